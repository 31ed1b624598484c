//! Funnel actors: who reached (or dropped off at) a step.

use crate::error::{ResolverError, Result};
use crate::filter::date::relative_date_parse;
use crate::filter::{Filter, FunnelOrderType, FunnelParams};
use crate::query::builder::{QueryBuilder, QueryPlan};
use crate::query::{entity_condition, EventSource};
use chrono::Utc;

/// Funnel query shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunnelVariant {
    Ordered,
    Strict,
    Unordered,
    /// Conversion of the cohort entering in one period.
    Trends,
    /// Funnel actors who also performed the correlation event.
    Correlation,
}

impl FunnelVariant {
    pub fn for_order(order: FunnelOrderType) -> Self {
        match order {
            FunnelOrderType::Ordered => FunnelVariant::Ordered,
            FunnelOrderType::Strict => FunnelVariant::Strict,
            FunnelOrderType::Unordered => FunnelVariant::Unordered,
        }
    }
}

fn funnel_params(filter: &Filter) -> Result<&FunnelParams> {
    filter
        .funnel()
        .ok_or_else(|| ResolverError::validation("Invalid filter", "Not a funnel filter"))
}

/// Per-person furthest step, plus entrance period for trends.
fn steps_subquery(filter: &Filter, variant: FunnelVariant, b: &mut QueryBuilder) -> Result<(String, usize)> {
    let funnel = funnel_params(filter)?;
    if filter.entities().is_empty() {
        return Err(ResolverError::validation(
            "Invalid filter",
            "A funnel needs at least one step",
        ));
    }

    let mut source = EventSource::for_filter(filter, b)?;
    let steps = filter
        .entities()
        .iter()
        .map(|entity| entity_condition(entity, b))
        .collect::<Result<Vec<_>>>()?;
    source.push(format!("({})", steps.join(" OR ")));

    let window_seconds = funnel.window_days as u64 * 86_400;
    let steps_expr = match variant {
        FunnelVariant::Unordered => {
            let reached: Vec<String> = steps.iter().map(|c| format!("max(toUInt8({}))", c)).collect();
            format!("arraySum([{}])", reached.join(", "))
        }
        FunnelVariant::Strict => format!(
            "windowFunnel({}, 'strict_order')(toDateTime(e.timestamp), {})",
            b.bind(window_seconds),
            steps.join(", ")
        ),
        _ => format!(
            "windowFunnel({})(toDateTime(e.timestamp), {})",
            b.bind(window_seconds),
            steps.join(", ")
        ),
    };

    let mut columns = vec![
        "pdi.person_id AS person_id".to_string(),
        format!("{} AS steps", steps_expr),
    ];
    if variant == FunnelVariant::Trends {
        columns.push(format!(
            "{}(minIf(e.timestamp, {})) AS entrance_period",
            filter.interval().truncate_fn(),
            steps[0]
        ));
    }

    let sql = format!(
        "SELECT {}\nFROM {}\nWHERE {}\nGROUP BY person_id",
        columns.join(", "),
        source.from,
        source.where_clause()
    );
    Ok((sql, steps.len()))
}

/// Condition on `steps` selecting the requested step.
fn step_selection(funnel: &FunnelParams, total: usize, b: &mut QueryBuilder) -> Result<String> {
    if !funnel.funnel_custom_steps.is_empty() {
        if funnel.funnel_custom_steps.iter().any(|s| *s as usize > total) {
            return Err(ResolverError::validation(
                "Invalid parameter",
                format!("funnel_custom_steps must be within 1..={}", total),
            ));
        }
        let custom = b.bind(crate::query::SqlParam::UIntArray(
            funnel.funnel_custom_steps.iter().map(|s| *s as u64).collect(),
        ));
        return Ok(format!("steps IN {}", custom));
    }
    let step = funnel.funnel_step.unwrap_or(1);
    if step.unsigned_abs() as usize > total {
        return Err(ResolverError::validation(
            "Invalid parameter",
            format!("funnel_step {} is outside a {}-step funnel", step, total),
        ));
    }
    Ok(if step > 0 {
        format!("steps >= {}", b.bind(step as u64))
    } else {
        // dropped off at |step|: reached the step before it and no further
        format!("steps = {}", b.bind(step.unsigned_abs() - 1))
    })
}

/// `SELECT person_id ...` for the funnel actors, unordered and unpaged.
/// Nested plans (paths) embed this.
pub fn actor_selection(filter: &Filter, variant: FunnelVariant, b: &mut QueryBuilder) -> Result<String> {
    let funnel = funnel_params(filter)?;
    let (steps_sql, total) = steps_subquery(filter, variant, b)?;

    let mut conditions = Vec::new();
    match variant {
        FunnelVariant::Trends => {
            let raw = funnel.entrance_period_start.as_deref().ok_or_else(|| {
                ResolverError::missing_parameter("Must include entrance_period_start")
            })?;
            let period = b.bind(relative_date_parse(raw, Utc::now())?);
            conditions.push(format!("entrance_period = {}", period));
            conditions.push("steps >= 1".to_string());
            let total = b.bind(total as u64);
            if funnel.drop_off.unwrap_or(false) {
                conditions.push(format!("steps < {}", total));
            } else {
                conditions.push(format!("steps = {}", total));
            }
        }
        FunnelVariant::Correlation => {
            let entity = funnel.correlation_person_entity.as_ref().ok_or_else(|| {
                ResolverError::missing_parameter("Must include funnel_correlation_person_entity")
            })?;
            match funnel.correlation_person_converted {
                Some(true) => conditions.push(format!("steps = {}", b.bind(total as u64))),
                Some(false) => {
                    conditions.push(format!("steps >= 1 AND steps < {}", b.bind(total as u64)))
                }
                None => conditions.push("steps >= 1".to_string()),
            }
            let mut source = EventSource::for_filter(filter, b)?;
            source.push(entity_condition(entity, b)?);
            conditions.push(format!(
                "person_id IN (SELECT pdi.person_id FROM {} WHERE {})",
                source.from,
                source.where_clause()
            ));
        }
        _ => conditions.push(step_selection(funnel, total, b)?),
    }

    Ok(format!(
        "SELECT person_id FROM (\n{}\n) WHERE {}",
        steps_sql,
        conditions.join(" AND ")
    ))
}

pub fn build(filter: &Filter, variant: FunnelVariant, fetch_limit: u32) -> Result<QueryPlan> {
    let mut b = QueryBuilder::new();
    let sql = actor_selection(filter, variant, &mut b)?;
    Ok(b.paged(format!("{}\nORDER BY person_id", sql), fetch_limit, filter.offset()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{InsightKind, RequestParams};
    use serde_json::json;

    fn funnel_filter(extra: &[(&str, &str)]) -> Filter {
        let mut params = RequestParams::new().with_body(
            "events",
            json!([{"id": "$pageview", "order": 0}, {"id": "signup", "order": 1}]),
        );
        for (k, v) in extra {
            params = params.with_query(*k, *v);
        }
        Filter::from_params(&params, 1, InsightKind::Funnels, Utc::now()).unwrap()
    }

    #[test]
    fn test_strict_uses_strict_order() {
        let plan = build(&funnel_filter(&[]), FunnelVariant::Strict, 101).unwrap();
        assert!(plan.sql.contains("'strict_order'"));
        let plan = build(&funnel_filter(&[]), FunnelVariant::Ordered, 101).unwrap();
        assert!(!plan.sql.contains("'strict_order'"));
    }

    #[test]
    fn test_negative_step_selects_drop_offs() {
        let plan = build(&funnel_filter(&[("funnel_step", "-2")]), FunnelVariant::Ordered, 10).unwrap();
        assert!(plan.sql.contains("steps = {"));
    }

    #[test]
    fn test_step_outside_funnel_rejected() {
        assert!(build(&funnel_filter(&[("funnel_step", "3")]), FunnelVariant::Ordered, 10).is_err());
    }

    #[test]
    fn test_trends_requires_entrance_period() {
        let err = build(&funnel_filter(&[]), FunnelVariant::Trends, 10).unwrap_err();
        assert_eq!(err.status_code(), 400);
        let plan = build(
            &funnel_filter(&[("entrance_period_start", "2021-05-01 00:00:00"), ("drop_off", "true")]),
            FunnelVariant::Trends,
            10,
        )
        .unwrap();
        assert!(plan.sql.contains("entrance_period ="));
        assert!(plan.sql.contains("steps < {"));
    }
}
