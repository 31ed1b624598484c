//! Retention actors: the cohort of one period, optionally with the periods
//! each actor came back in.

use crate::error::{ResolverError, Result};
use crate::filter::{Filter, RetentionParams, RetentionType};
use crate::query::builder::{QueryBuilder, QueryPlan};
use crate::query::{entity_condition, EventSource};

fn retention_params(filter: &Filter) -> Result<&RetentionParams> {
    filter
        .retention()
        .ok_or_else(|| ResolverError::validation("Invalid filter", "Not a retention filter"))
}

/// Start of the selected cohort period.
fn cohort_start(filter: &Filter, retention: &RetentionParams, b: &mut QueryBuilder) -> String {
    let to = b.bind(filter.date_range().to());
    let back = b.bind(retention.total_intervals - 1 - retention.selected_interval);
    format!(
        "{}(toDateTime({})) - {}({})",
        retention.period.truncate_fn(),
        to,
        retention.period.interval_fn(),
        back
    )
}

/// Actors that performed the target entity in the cohort period (first time
/// ever, for first-time retention).
fn cohort(filter: &Filter, retention: &RetentionParams, start: &str, b: &mut QueryBuilder) -> Result<String> {
    let mut source = EventSource::unbounded(filter, b)?;
    source.push(entity_condition(&retention.target_entity, b)?);
    let sql = match retention.retention_type {
        RetentionType::RetentionRecurring => {
            source.push(format!("e.timestamp >= {}", start));
            source.push(format!(
                "e.timestamp < {} + {}(1)",
                start,
                retention.period.interval_fn()
            ));
            format!(
                "SELECT DISTINCT pdi.person_id AS person_id FROM {} WHERE {}",
                source.from,
                source.where_clause()
            )
        }
        RetentionType::RetentionFirstTime => format!(
            "SELECT pdi.person_id AS person_id FROM {} WHERE {} GROUP BY person_id HAVING {}(min(e.timestamp)) = {}",
            source.from,
            source.where_clause(),
            retention.period.truncate_fn(),
            start
        ),
    };
    Ok(sql)
}

pub fn build(filter: &Filter, fetch_limit: u32) -> Result<QueryPlan> {
    let retention = retention_params(filter)?;
    let mut b = QueryBuilder::new();
    let start = cohort_start(filter, retention, &mut b);
    let sql = cohort(filter, retention, &start, &mut b)?;
    Ok(b.paged(format!("{}\nORDER BY person_id", sql), fetch_limit, filter.offset()))
}

/// Cohort actors with one 0/1 flag per period from the cohort period on,
/// most-returning first. Second column: `appearances`.
pub fn build_in_period(filter: &Filter, fetch_limit: u32) -> Result<QueryPlan> {
    let retention = retention_params(filter)?;
    let mut b = QueryBuilder::new();
    let start = cohort_start(filter, retention, &mut b);
    let cohort_sql = cohort(filter, retention, &start, &mut b)?;

    let mut returning = EventSource::unbounded(filter, &mut b)?;
    returning.push(entity_condition(&retention.returning_entity, &mut b)?);
    returning.push(format!("e.timestamp >= {}", start));

    let periods = b.bind(retention.total_intervals - retention.selected_interval);
    let sql = format!(
        "SELECT c.person_id AS person_id, \
         arrayMap(i -> toUInt8(has(r.periods, i)), range(0, {periods})) AS appearances\n\
         FROM ({cohort}) AS c\n\
         LEFT JOIN (\n\
         SELECT pdi.person_id AS person_id, \
         groupUniqArray(toUInt32(dateDiff('{unit}', {start}, {trunc}(e.timestamp)))) AS periods\n\
         FROM {from}\nWHERE {where_clause}\nGROUP BY person_id\n\
         ) AS r ON c.person_id = r.person_id\n\
         ORDER BY arraySum(appearances) DESC, person_id",
        periods = periods,
        cohort = cohort_sql,
        unit = retention.period.as_str(),
        start = start,
        trunc = retention.period.truncate_fn(),
        from = returning.from,
        where_clause = returning.where_clause()
    );
    Ok(b.paged(sql, fetch_limit, filter.offset()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{InsightKind, RequestParams};
    use chrono::Utc;

    fn retention_filter(extra: &[(&str, &str)]) -> Filter {
        let mut params = RequestParams::new().with_query("period", "Week");
        for (k, v) in extra {
            params = params.with_query(*k, *v);
        }
        Filter::from_params(&params, 1, InsightKind::Retention, Utc::now()).unwrap()
    }

    #[test]
    fn test_recurring_cohort_is_one_period() {
        let plan = build(&retention_filter(&[]), 101).unwrap();
        assert!(plan.sql.contains("toStartOfWeek"));
        assert!(plan.sql.contains("toIntervalWeek(1)"));
        assert!(plan.sql.contains("SELECT DISTINCT"));
    }

    #[test]
    fn test_first_time_groups_by_first_event() {
        let plan = build(&retention_filter(&[("retention_type", "retention_first_time")]), 101).unwrap();
        assert!(plan.sql.contains("HAVING toStartOfWeek(min(e.timestamp))"));
    }

    #[test]
    fn test_in_period_returns_appearances() {
        let plan = build_in_period(&retention_filter(&[("selected_interval", "2")]), 101).unwrap();
        assert!(plan.sql.contains("AS appearances"));
        assert!(plan.sql.contains("dateDiff('week'"));
    }
}
