//! Plain person list, newest first.

use crate::error::Result;
use crate::filter::Filter;
use crate::query::builder::{QueryBuilder, QueryPlan};
use crate::query::person_distinct_ids;
use crate::query::predicate::{and_all, compile_predicates, PropertyColumns};

const LIST_COLUMNS: PropertyColumns<'static> = PropertyColumns {
    person: "argMax(properties, version)",
    event: None,
};

pub fn build(filter: &Filter, fetch_limit: u32) -> Result<QueryPlan> {
    let mut b = QueryBuilder::new();
    let team = b.bind(filter.team_id());

    let mut where_ = vec![format!("team_id = {}", team)];
    let search = filter.list_search();
    if let Some(distinct_id) = &search.distinct_id {
        let distinct_id = b.bind(distinct_id.as_str());
        where_.push(format!(
            "id IN (SELECT person_id FROM ({}) WHERE distinct_id = {})",
            person_distinct_ids(&team),
            distinct_id
        ));
    }

    let mut having = vec!["max(is_deleted) = 0".to_string()];
    having.extend(compile_predicates(filter.properties(), LIST_COLUMNS, &mut b)?);
    if let Some(email) = &search.email {
        let email = b.bind(email.as_str());
        having.push(format!(
            "JSONExtractString(argMax(properties, version), 'email') = {}",
            email
        ));
    }
    if let Some(term) = &search.search {
        let pattern = b.bind(format!("%{}%", term));
        let exact = b.bind(term.as_str());
        having.push(format!(
            "(ilike(JSONExtractString(argMax(properties, version), 'email'), {}) \
             OR id IN (SELECT person_id FROM ({}) WHERE distinct_id = {}))",
            pattern,
            person_distinct_ids(&team),
            exact
        ));
    }

    let sql = format!(
        "SELECT id\nFROM person\nWHERE {}\nGROUP BY id\nHAVING {}\nORDER BY argMax(created_at, version) DESC, id DESC",
        and_all(&where_),
        and_all(&having)
    );
    Ok(b.paged(sql, fetch_limit, filter.offset()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{InsightKind, RequestParams};
    use crate::query::builder::SqlParam;
    use chrono::Utc;

    #[test]
    fn test_list_plan_pages_and_orders() {
        let params = RequestParams::new()
            .with_query("offset", "200")
            .with_query("email", "a@b.com");
        let filter = Filter::from_params(&params, 3, InsightKind::Trends, Utc::now()).unwrap();
        let plan = build(&filter, 101).unwrap();
        assert!(plan.sql.contains("ORDER BY argMax(created_at, version) DESC"));
        assert!(plan.params.values().any(|p| *p == SqlParam::String("a@b.com".into())));
        assert!(plan.params.values().any(|p| *p == SqlParam::UInt(200)));
        assert_eq!(plan.fetch_limit, 101);
    }
}
