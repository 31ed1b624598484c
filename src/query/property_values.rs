//! Person property value suggestions and property key counts.

use crate::query::builder::{QueryBuilder, QueryPlan};
use crate::query::live_persons;

/// Values suggested for one key.
pub const VALUES_LIMIT: u32 = 20;

/// Most common raw JSON values of `key` across live persons, optionally
/// narrowed to values containing `prefix`.
pub fn values_for_key(team_id: i64, key: &str, prefix: Option<&str>) -> QueryPlan {
    let mut b = QueryBuilder::new();
    let team = b.bind(team_id);
    let key = b.bind(key);
    let mut conditions = vec!["value != ''".to_string(), "value != 'null'".to_string()];
    if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
        let pattern = b.bind(format!("%{}%", prefix));
        conditions.push(format!("ilike(value, {})", pattern));
    }
    let sql = format!(
        "SELECT value, count() AS count FROM (\n\
         SELECT JSONExtractRaw(person_props, {key}) AS value FROM ({persons})\n\
         ) WHERE {conditions}\nGROUP BY value\nORDER BY count DESC, value",
        key = key,
        persons = live_persons(&team),
        conditions = conditions.join(" AND ")
    );
    b.paged(sql, VALUES_LIMIT, 0)
}

/// Property keys of live persons with how many persons carry each.
pub fn property_counts(team_id: i64) -> QueryPlan {
    let mut b = QueryBuilder::new();
    let team = b.bind(team_id);
    let sql = format!(
        "SELECT key, count() AS count FROM (\n\
         SELECT arrayJoin(JSONExtractKeys(person_props)) AS key FROM ({})\n\
         ) GROUP BY key\nORDER BY count DESC, key",
        live_persons(&team)
    );
    b.finish(sql, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_is_bound() {
        let plan = values_for_key(1, "plan", Some("pr"));
        assert!(plan.sql.contains("ilike(value, {"));
        assert!(plan.params.values().any(|p| p.render() == "%pr%"));
        assert_eq!(plan.fetch_limit, VALUES_LIMIT);

        let plan = values_for_key(1, "plan", Some(""));
        assert!(!plan.sql.contains("ilike"));
    }
}
