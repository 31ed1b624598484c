//! Lifecycle actors: new, returning, resurrecting or dormant in the period
//! containing the target date.

use crate::error::{ResolverError, Result};
use crate::filter::{Filter, LifecycleType};
use crate::query::builder::{QueryBuilder, QueryPlan};
use crate::query::{entity_condition, EventSource};

pub fn build(filter: &Filter, fetch_limit: u32) -> Result<QueryPlan> {
    let lifecycle = filter
        .lifecycle()
        .ok_or_else(|| ResolverError::validation("Invalid filter", "Not a lifecycle filter"))?;
    let target = lifecycle
        .target_date_parsed
        .ok_or_else(|| ResolverError::missing_parameter("Must include specified date"))?;
    let mut b = QueryBuilder::new();

    let interval = filter.interval();
    let target = b.bind(target);
    let period_start = format!("{}(toDateTime({}))", interval.truncate_fn(), target);
    let period_end = format!("{} + {}(1)", period_start, interval.interval_fn());
    let previous_start = format!("{} - {}(1)", period_start, interval.interval_fn());

    let mut source = EventSource::unbounded(filter, &mut b)?;
    source.push(entity_condition(&lifecycle.target_entity, &mut b)?);
    source.push(format!("e.timestamp >= {}", previous_start));
    source.push(format!("e.timestamp < {}", period_end));

    let status = match lifecycle.lifecycle_type {
        LifecycleType::New => format!("active_now AND created_at >= {}", period_start),
        LifecycleType::Returning => {
            format!("active_now AND active_before AND created_at < {}", period_start)
        }
        LifecycleType::Resurrecting => {
            format!("active_now AND NOT active_before AND created_at < {}", period_start)
        }
        LifecycleType::Dormant => "active_before AND NOT active_now".to_string(),
    };

    let sql = format!(
        "SELECT person_id FROM (\n\
         SELECT pdi.person_id AS person_id, any(person.created_at) AS created_at,\n\
         countIf(e.timestamp >= {start}) > 0 AS active_now,\n\
         countIf(e.timestamp < {start}) > 0 AS active_before\n\
         FROM {from}\nWHERE {where_clause}\nGROUP BY person_id\n\
         ) WHERE {status}\nORDER BY person_id",
        start = period_start,
        from = source.from,
        where_clause = source.where_clause(),
        status = status
    );
    Ok(b.paged(sql, fetch_limit, filter.offset()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{InsightKind, RequestParams};
    use chrono::Utc;

    fn lifecycle_filter(kind: &str) -> Filter {
        let params = RequestParams::new()
            .with_query("target_date", "2022-03-01")
            .with_query("lifecycle_type", kind)
            .with_query("events", r#"[{"id": "$pageview", "order": 0}]"#);
        Filter::from_params(&params, 1, InsightKind::Lifecycle, Utc::now()).unwrap()
    }

    #[test]
    fn test_dormant_was_active_before_only() {
        let plan = build(&lifecycle_filter("dormant"), 101).unwrap();
        assert!(plan.sql.contains("WHERE active_before AND NOT active_now"));
    }

    #[test]
    fn test_new_checks_creation() {
        let plan = build(&lifecycle_filter("new"), 101).unwrap();
        assert!(plan.sql.contains("active_now AND created_at >="));
    }
}
