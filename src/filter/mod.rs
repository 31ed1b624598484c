//! Filter Model
//!
//! Immutable, validated representation of one analytics request: team scope,
//! paging, time range, property predicates and the sub-parameters of the
//! insight mode being drilled into.

pub mod date;
pub mod insight;
pub mod params;
pub mod property;

pub use date::{DateRange, Interval};
pub use insight::{
    Entity, EntityType, FunnelOrderType, FunnelParams, FunnelPathType, FunnelVizType,
    LifecycleParams, LifecycleType, PathNode, PathParams, PathType, RetentionParams,
    RetentionType, StickinessParams,
};
pub use params::RequestParams;
pub use property::{PropertyOperator, PropertyPredicate, PropertyType};

use crate::config::{CSV_EXPORT_LIMIT, DEFAULT_LIMIT};
use crate::error::{ResolverError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Insight the request drills into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    Trends,
    Funnels,
    Paths,
    Retention,
    Stickiness,
    Lifecycle,
}

/// Output format of the response; bulk exports page differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl ExportFormat {
    pub fn from_params(params: &RequestParams) -> Self {
        match params.get_str("format").as_deref() {
            Some("csv") => ExportFormat::Csv,
            _ => ExportFormat::Json,
        }
    }
}

/// Concrete paging window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

/// Person-list search fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListSearch {
    pub email: Option<String>,
    pub distinct_id: Option<String>,
    pub search: Option<String>,
}

impl ListSearch {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.distinct_id.is_none() && self.search.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Filter {
    team_id: i64,
    insight: InsightKind,
    limit: Option<u32>,
    offset: u32,
    date_range: DateRange,
    interval: Interval,
    properties: Vec<PropertyPredicate>,
    entities: Vec<Entity>,
    display: Option<String>,
    funnel: Option<FunnelParams>,
    path: Option<PathParams>,
    funnel_filter: Option<Box<Filter>>,
    retention: Option<RetentionParams>,
    stickiness: Option<StickinessParams>,
    lifecycle: Option<LifecycleParams>,
    list: ListSearch,
    #[serde(skip)]
    refresh: bool,
}

impl Filter {
    /// Validate raw request parameters into a filter for `insight`.
    pub fn from_params(
        params: &RequestParams,
        team_id: i64,
        insight: InsightKind,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let limit = params.get_u32("limit")?;
        if limit == Some(0) {
            return Err(ResolverError::validation(
                "Invalid parameter",
                "'limit' must be a positive integer",
            ));
        }
        let offset = params.get_u32("offset")?.unwrap_or(0);
        let date_range = DateRange::parse(params.get_str("date_from"), params.get_str("date_to"), now)?;
        let interval = match params.get_str("interval") {
            Some(raw) => raw.parse()?,
            None => Interval::Day,
        };
        let properties = match params.get_json("properties")? {
            Some(raw) => PropertyPredicate::parse_list(&raw)?,
            None => Vec::new(),
        };
        let entities = insight::parse_entities(params)?;

        let mut filter = Self {
            team_id,
            insight,
            limit,
            offset,
            date_range,
            interval,
            properties,
            entities,
            display: params.get_str("display"),
            funnel: None,
            path: None,
            funnel_filter: None,
            retention: None,
            stickiness: None,
            lifecycle: None,
            list: ListSearch {
                email: params.get_str("email"),
                distinct_id: params.get_str("distinct_id"),
                search: params.get_str("search"),
            },
            refresh: params.get_bool("refresh").unwrap_or(false),
        };

        match insight {
            InsightKind::Trends => {}
            InsightKind::Funnels => filter.funnel = Some(FunnelParams::from_params(params)?),
            InsightKind::Paths => {
                filter.path = Some(PathParams::from_params(params)?);
                if let Some(raw) = params.get_json("funnel_filter")? {
                    let nested = RequestParams::from_json(raw)?;
                    filter.funnel_filter = Some(Box::new(Self::from_params(
                        &nested,
                        team_id,
                        InsightKind::Funnels,
                        now,
                    )?));
                }
            }
            InsightKind::Retention => {
                filter.retention = Some(RetentionParams::from_params(params)?)
            }
            InsightKind::Stickiness => {
                filter.stickiness = Some(StickinessParams::from_params(params, &filter.entities)?)
            }
            InsightKind::Lifecycle => {
                let target_date = params
                    .get_str("target_date")
                    .ok_or_else(|| ResolverError::missing_parameter("Must include specified date"))?;
                let lifecycle_type = params
                    .get_str("lifecycle_type")
                    .ok_or_else(|| ResolverError::missing_parameter("Must include lifecycle type"))?
                    .parse()?;
                let target_entity = filter
                    .entities
                    .first()
                    .cloned()
                    .ok_or_else(|| ResolverError::missing_parameter("Must include an event"))?;
                filter.lifecycle = Some(LifecycleParams {
                    target_date_parsed: Some(date::relative_date_parse(&target_date, now)?),
                    target_date,
                    lifecycle_type,
                    target_entity,
                });
            }
        }

        filter.validate_entities()?;
        Ok(filter)
    }

    fn validate_entities(&self) -> Result<()> {
        for entity in &self.entities {
            entity.event_name()?;
        }
        if let Some(funnel) = &self.funnel {
            if let Some(entity) = &funnel.correlation_person_entity {
                entity.event_name()?;
            }
        }
        if let Some(retention) = &self.retention {
            retention.target_entity.event_name()?;
            retention.returning_entity.event_name()?;
        }
        if let Some(stickiness) = &self.stickiness {
            stickiness.target_entity.event_name()?;
        }
        if let Some(lifecycle) = &self.lifecycle {
            lifecycle.target_entity.event_name()?;
        }
        Ok(())
    }

    /// Resolve paging to concrete values using the built-in limits.
    pub fn with_defaults(&self, format: ExportFormat) -> Filter {
        self.with_limits(format, DEFAULT_LIMIT, CSV_EXPORT_LIMIT)
    }

    /// Resolve paging to concrete values. Exports always fetch the full export
    /// page from the start; other requests fall back to `default_limit` and are
    /// clamped to `max_limit`.
    pub fn with_limits(&self, format: ExportFormat, default_limit: u32, max_limit: u32) -> Filter {
        let mut resolved = self.clone();
        match format {
            ExportFormat::Csv => {
                resolved.limit = Some(max_limit);
                resolved.offset = 0;
            }
            ExportFormat::Json => {
                resolved.limit = Some(self.limit.unwrap_or(default_limit).min(max_limit));
            }
        }
        resolved
    }

    /// Copy of this filter positioned at `offset`.
    pub fn with_offset(&self, offset: u32) -> Filter {
        Filter {
            offset,
            ..self.clone()
        }
    }

    pub fn page(&self) -> Page {
        Page {
            limit: self.limit.unwrap_or(DEFAULT_LIMIT),
            offset: self.offset,
        }
    }

    pub fn team_id(&self) -> i64 {
        self.team_id
    }

    pub fn insight(&self) -> InsightKind {
        self.insight
    }

    /// Requested limit, `None` until defaults are applied.
    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn date_range(&self) -> &DateRange {
        &self.date_range
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn properties(&self) -> &[PropertyPredicate] {
        &self.properties
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn display(&self) -> Option<&str> {
        self.display.as_deref()
    }

    pub fn funnel(&self) -> Option<&FunnelParams> {
        self.funnel.as_ref()
    }

    pub fn path(&self) -> Option<&PathParams> {
        self.path.as_ref()
    }

    pub fn funnel_filter(&self) -> Option<&Filter> {
        self.funnel_filter.as_deref()
    }

    pub fn retention(&self) -> Option<&RetentionParams> {
        self.retention.as_ref()
    }

    pub fn stickiness(&self) -> Option<&StickinessParams> {
        self.stickiness.as_ref()
    }

    pub fn lifecycle(&self) -> Option<&LifecycleParams> {
        self.lifecycle.as_ref()
    }

    pub fn list_search(&self) -> &ListSearch {
        &self.list
    }

    pub fn refresh(&self) -> bool {
        self.refresh
    }

    /// Deterministic key-sorted JSON of everything that affects the result.
    /// The refresh flag is not part of it.
    pub fn to_normalized(&self) -> Result<Value> {
        Ok(sort_keys(serde_json::to_value(self)?))
    }
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, sort_keys(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 3, 15, 12, 0, 0).unwrap()
    }

    fn filter(params: RequestParams, insight: InsightKind) -> Result<Filter> {
        Filter::from_params(&params, 1, insight, now())
    }

    #[test]
    fn test_with_defaults_fills_limit() {
        let f = filter(RequestParams::new(), InsightKind::Trends).unwrap();
        assert_eq!(f.limit(), None);
        let resolved = f.with_defaults(ExportFormat::Json);
        assert_eq!(resolved.page(), Page { limit: 100, offset: 0 });
        // the original value is untouched
        assert_eq!(f.limit(), None);
    }

    #[test]
    fn test_csv_forces_export_page() {
        let params = RequestParams::new()
            .with_query("limit", "10")
            .with_query("offset", "30");
        let f = filter(params, InsightKind::Trends).unwrap();
        let resolved = f.with_defaults(ExportFormat::Csv);
        assert_eq!(resolved.page(), Page { limit: 5000, offset: 0 });
    }

    #[test]
    fn test_out_of_range_date_from_rejected() {
        for raw in ["-100000000d", "-99999999999999999999d"] {
            let err = filter(RequestParams::new().with_query("date_from", raw), InsightKind::Trends);
            assert!(matches!(err, Err(ResolverError::Validation { .. })), "{} accepted", raw);
        }
    }

    #[test]
    fn test_limit_clamped_and_zero_rejected() {
        let f = filter(RequestParams::new().with_query("limit", "100000"), InsightKind::Trends)
            .unwrap()
            .with_defaults(ExportFormat::Json);
        assert_eq!(f.page().limit, 5000);

        let err = filter(RequestParams::new().with_query("limit", "0"), InsightKind::Trends);
        assert!(matches!(err, Err(ResolverError::Validation { .. })));
    }

    #[test]
    fn test_lifecycle_requires_target_date_and_type() {
        let err = filter(
            RequestParams::new().with_query("lifecycle_type", "new"),
            InsightKind::Lifecycle,
        )
        .unwrap_err();
        let body = err.error_body().unwrap();
        assert_eq!(body.message, "Missing parameter");
        assert_eq!(body.detail, "Must include specified date");

        let err = filter(
            RequestParams::new().with_query("target_date", "2022-03-01"),
            InsightKind::Lifecycle,
        );
        assert!(err.is_err());

        let ok = filter(
            RequestParams::new()
                .with_query("target_date", "2022-03-01")
                .with_query("lifecycle_type", "dormant")
                .with_query("events", r#"[{"id": "$pageview"}]"#),
            InsightKind::Lifecycle,
        )
        .unwrap();
        assert_eq!(ok.lifecycle().unwrap().lifecycle_type, LifecycleType::Dormant);
    }

    #[test]
    fn test_action_entities_rejected() {
        let params = RequestParams::new().with_body("actions", json!([{"id": 4, "order": 0}]));
        assert!(matches!(
            filter(params, InsightKind::Funnels),
            Err(ResolverError::Validation { .. })
        ));
    }

    #[test]
    fn test_nested_funnel_filter_from_string() {
        let params = RequestParams::new().with_query(
            "funnel_filter",
            r#"{"events": [{"id": "a", "order": 0}, {"id": "b", "order": 1}], "funnel_step": 2}"#,
        );
        let f = filter(params, InsightKind::Paths).unwrap();
        let nested = f.funnel_filter().unwrap();
        assert_eq!(nested.entities().len(), 2);
        assert_eq!(nested.funnel().unwrap().funnel_step, Some(2));
    }

    #[test]
    fn test_normalized_ignores_refresh() {
        let a = filter(RequestParams::new().with_query("refresh", "true"), InsightKind::Funnels).unwrap();
        let b = filter(RequestParams::new(), InsightKind::Funnels).unwrap();
        assert!(a.refresh());
        assert_eq!(a.to_normalized().unwrap(), b.to_normalized().unwrap());
    }
}
