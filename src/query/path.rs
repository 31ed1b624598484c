//! Path actors: who passed through a node, an edge, or dropped off at a node.

use crate::error::{ResolverError, Result};
use crate::filter::{Filter, FunnelPathType, PathParams, PathType};
use crate::query::builder::{QueryBuilder, QueryPlan};
use crate::query::funnel::{self, FunnelVariant};
use crate::query::EventSource;

fn path_params(filter: &Filter) -> Result<&PathParams> {
    filter
        .path()
        .ok_or_else(|| ResolverError::validation("Invalid filter", "Not a paths filter"))
}

/// Event filter and node label for the path type.
fn path_item(path: &PathParams, b: &mut QueryBuilder) -> (String, String) {
    match path.path_type {
        PathType::Pageview => {
            let event = b.bind("$pageview");
            let prop = b.bind("$current_url");
            (
                format!("e.event = {}", event),
                format!("JSONExtractString(e.properties, {})", prop),
            )
        }
        PathType::Screen => {
            let event = b.bind("$screen");
            let prop = b.bind("$screen_name");
            (
                format!("e.event = {}", event),
                format!("JSONExtractString(e.properties, {})", prop),
            )
        }
        PathType::CustomEvent => (
            "NOT startsWith(e.event, '$')".to_string(),
            "e.event".to_string(),
        ),
    }
}

pub fn build(filter: &Filter, fetch_limit: u32) -> Result<QueryPlan> {
    let path = path_params(filter)?;
    let mut b = QueryBuilder::new();

    let mut source = EventSource::for_filter(filter, &mut b)?;
    let (event_filter, item) = path_item(path, &mut b);
    source.push(event_filter);

    if let Some(funnel_filter) = filter.funnel_filter() {
        let funnel_params = funnel_filter.funnel().ok_or_else(|| {
            ResolverError::validation("Invalid filter", "funnel_filter is not a funnel")
        })?;
        if path.funnel_paths.is_none() {
            return Err(ResolverError::missing_parameter(
                "Must include funnel_paths with funnel_filter",
            ));
        }
        let variant = FunnelVariant::for_order(funnel_params.order_type);
        let funnel_actors = funnel::actor_selection(funnel_filter, variant, &mut b)?;
        source.push(format!("pdi.person_id IN ({})", funnel_actors));
    }

    let raw_path = format!(
        "arrayMap(x -> x.2, arraySort(x -> x.1, groupArray((e.timestamp, {}))))",
        item
    );
    let path_expr = match &path.start_point {
        Some(start) => {
            let start = b.bind(start.as_str());
            format!(
                "arraySlice({raw}, indexOf({raw}, {start}))",
                raw = raw_path,
                start = start
            )
        }
        None => raw_path,
    };
    let path_expr = match &path.end_point {
        Some(end) => {
            let end = b.bind(end.as_str());
            format!(
                "arraySlice({p}, 1, indexOf({p}, {end}))",
                p = path_expr,
                end = end
            )
        }
        None => path_expr,
    };

    let mut conditions = vec!["length(path) > 0".to_string()];
    if let Some(node) = &path.path_start_key {
        let step = b.bind(node.step);
        let value = b.bind(node.value.as_str());
        conditions.push(format!("arrayElement(path, {}) = {}", step, value));
    }
    if let Some(node) = &path.path_end_key {
        let step = b.bind(node.step);
        let value = b.bind(node.value.as_str());
        conditions.push(format!("arrayElement(path, {}) = {}", step, value));
    }
    if let Some(node) = &path.path_dropoff_key {
        let step = b.bind(node.step);
        let value = b.bind(node.value.as_str());
        conditions.push(format!(
            "length(path) = {step} AND arrayElement(path, {step}) = {value}",
            step = step,
            value = value
        ));
    }
    if matches!(path.funnel_paths, Some(FunnelPathType::FunnelPathBetweenSteps)) && filter.funnel_filter().is_none() {
        return Err(ResolverError::missing_parameter(
            "Must include funnel_filter with funnel_paths",
        ));
    }

    let sql = format!(
        "SELECT person_id FROM (\n\
         SELECT pdi.person_id AS person_id, {path} AS path\n\
         FROM {from}\nWHERE {where_clause}\nGROUP BY person_id\n\
         ) WHERE {conditions}\nORDER BY person_id",
        path = path_expr,
        from = source.from,
        where_clause = source.where_clause(),
        conditions = conditions.join(" AND ")
    );
    Ok(b.paged(sql, fetch_limit, filter.offset()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{InsightKind, RequestParams};
    use chrono::Utc;

    #[test]
    fn test_edge_keys_become_positions() {
        let params = RequestParams::new()
            .with_query("path_start_key", "1_/home")
            .with_query("path_end_key", "2_/pricing");
        let filter = Filter::from_params(&params, 1, InsightKind::Paths, Utc::now()).unwrap();
        let plan = build(&filter, 101).unwrap();
        assert_eq!(plan.sql.matches("arrayElement(path,").count(), 2);
        assert!(plan.params.values().any(|p| p.render() == "$current_url"));
    }

    #[test]
    fn test_nested_funnel_shares_namespace() {
        let params = RequestParams::new()
            .with_query("funnel_paths", "funnel_path_before_step")
            .with_query(
                "funnel_filter",
                r#"{"events": [{"id": "a", "order": 0}, {"id": "b", "order": 1}], "funnel_step": 2}"#,
            );
        let filter = Filter::from_params(&params, 1, InsightKind::Paths, Utc::now()).unwrap();
        let plan = build(&filter, 101).unwrap();
        assert!(plan.sql.contains("windowFunnel"));
        // every placeholder referenced in the SQL is bound exactly once
        for name in plan.params.keys() {
            assert!(plan.sql.contains(&format!("{{{}:", name)));
        }
    }

    #[test]
    fn test_funnel_filter_requires_funnel_paths() {
        let params = RequestParams::new().with_query(
            "funnel_filter",
            r#"{"events": [{"id": "a", "order": 0}]}"#,
        );
        let filter = Filter::from_params(&params, 1, InsightKind::Paths, Utc::now()).unwrap();
        assert!(build(&filter, 10).is_err());
    }
}
