//! Stickiness actors: who performed the target entity on exactly N intervals.

use crate::error::{ResolverError, Result};
use crate::filter::Filter;
use crate::query::builder::{QueryBuilder, QueryPlan};
use crate::query::{entity_condition, EventSource};

pub fn build(filter: &Filter, fetch_limit: u32) -> Result<QueryPlan> {
    let stickiness = filter
        .stickiness()
        .ok_or_else(|| ResolverError::validation("Invalid filter", "Not a stickiness filter"))?;
    let mut b = QueryBuilder::new();

    let mut source = EventSource::for_filter(filter, &mut b)?;
    source.push(entity_condition(&stickiness.target_entity, &mut b)?);
    let days = b.bind(stickiness.stickiness_days);

    let sql = format!(
        "SELECT person_id FROM (\n\
         SELECT pdi.person_id AS person_id, countDistinct({}(e.timestamp)) AS num_intervals\n\
         FROM {}\nWHERE {}\nGROUP BY person_id\n\
         ) WHERE num_intervals = {}\nORDER BY person_id",
        filter.interval().truncate_fn(),
        source.from,
        source.where_clause(),
        days
    );
    Ok(b.paged(sql, fetch_limit, filter.offset()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{InsightKind, RequestParams};
    use crate::query::SqlParam;
    use chrono::Utc;

    #[test]
    fn test_counts_distinct_intervals() {
        let params = RequestParams::new()
            .with_query("stickiness_days", "4")
            .with_query("entityId", "$pageview")
            .with_query("interval", "week");
        let filter = Filter::from_params(&params, 1, InsightKind::Stickiness, Utc::now()).unwrap();
        let plan = build(&filter, 101).unwrap();
        assert!(plan.sql.contains("countDistinct(toStartOfWeek(e.timestamp))"));
        assert!(plan.params.values().any(|p| *p == SqlParam::UInt(4)));
    }
}
