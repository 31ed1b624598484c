//! Insight-mode specific sub-parameters (funnel, path, retention,
//! stickiness, lifecycle) and the entities they refer to.

use crate::error::{ResolverError, Result};
use crate::filter::date::Interval;
use crate::filter::params::RequestParams;
use crate::filter::property::PropertyPredicate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Events,
    Actions,
}

/// An event (or action) step of an insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub order: Option<u32>,
    pub name: Option<String>,
    pub properties: Vec<PropertyPredicate>,
}

impl Entity {
    pub fn event(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: EntityType::Events,
            order: None,
            name: None,
            properties: Vec::new(),
        }
    }

    pub fn from_json(raw: &Value, default_type: EntityType) -> Result<Self> {
        let obj = raw.as_object().ok_or_else(|| {
            ResolverError::validation("Invalid entity", format!("Expected object, got {}", raw))
        })?;
        let id = match obj.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(ResolverError::validation("Invalid entity", "Entity id is required")),
        };
        let entity_type = match obj.get("type").and_then(Value::as_str) {
            None => default_type,
            Some("events") => EntityType::Events,
            Some("actions") => EntityType::Actions,
            Some(other) => {
                return Err(ResolverError::validation(
                    "Invalid entity",
                    format!("Unknown entity type '{}'", other),
                ))
            }
        };
        let order = obj.get("order").and_then(Value::as_u64).map(|o| o as u32);
        let name = obj.get("name").and_then(Value::as_str).map(str::to_string);
        let properties = match obj.get("properties") {
            Some(props) => PropertyPredicate::parse_list(props)?,
            None => Vec::new(),
        };
        Ok(Self {
            id,
            entity_type,
            order,
            name,
            properties,
        })
    }

    /// Event name this entity matches. Action definitions live outside this
    /// engine, so only event entities can be resolved.
    pub fn event_name(&self) -> Result<&str> {
        match self.entity_type {
            EntityType::Events => Ok(&self.id),
            EntityType::Actions => Err(ResolverError::validation(
                "Unsupported entity",
                format!("Action entity '{}' cannot be resolved to actors", self.id),
            )),
        }
    }
}

/// Read `events` and `actions` into one list ordered by `order`.
pub fn parse_entities(params: &RequestParams) -> Result<Vec<Entity>> {
    let mut entities = Vec::new();
    for (key, default_type) in [("events", EntityType::Events), ("actions", EntityType::Actions)] {
        if let Some(Value::Array(items)) = params.get_json(key)? {
            for item in &items {
                entities.push(Entity::from_json(item, default_type)?);
            }
        }
    }
    entities.sort_by_key(|e| e.order.unwrap_or(u32::MAX));
    Ok(entities)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FunnelOrderType {
    #[default]
    Ordered,
    Strict,
    Unordered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FunnelVizType {
    #[default]
    Steps,
    Trends,
    TimeToConvert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelParams {
    /// Positive: actors who reached this step. Negative: actors who dropped
    /// off at this step.
    pub funnel_step: Option<i64>,
    pub funnel_custom_steps: Vec<u32>,
    pub order_type: FunnelOrderType,
    pub viz_type: FunnelVizType,
    pub window_days: u32,
    pub entrance_period_start: Option<String>,
    pub drop_off: Option<bool>,
    pub correlation_person_entity: Option<Entity>,
    pub correlation_person_converted: Option<bool>,
}

impl FunnelParams {
    pub const DEFAULT_WINDOW_DAYS: u32 = 14;

    pub fn from_params(params: &RequestParams) -> Result<Self> {
        let funnel_step = params.get_i64("funnel_step")?;
        if funnel_step == Some(0) {
            return Err(ResolverError::validation(
                "Invalid parameter",
                "funnel_step must not be zero",
            ));
        }
        let funnel_custom_steps = match params.get_json("funnel_custom_steps")? {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_u64().filter(|n| *n > 0).map(|n| n as u32).ok_or_else(|| {
                        ResolverError::validation(
                            "Invalid parameter",
                            "funnel_custom_steps must be positive step numbers",
                        )
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(ResolverError::validation(
                    "Invalid parameter",
                    format!("funnel_custom_steps must be a list, got {}", other),
                ))
            }
            None => Vec::new(),
        };
        let order_type = match params.get_str("funnel_order_type").as_deref() {
            None | Some("ordered") => FunnelOrderType::Ordered,
            Some("strict") => FunnelOrderType::Strict,
            Some("unordered") => FunnelOrderType::Unordered,
            Some(other) => {
                return Err(ResolverError::validation(
                    "Invalid parameter",
                    format!("Unknown funnel_order_type '{}'", other),
                ))
            }
        };
        let viz_type = match params.get_str("funnel_viz_type").as_deref() {
            None | Some("steps") => FunnelVizType::Steps,
            Some("trends") => FunnelVizType::Trends,
            Some("time_to_convert") => FunnelVizType::TimeToConvert,
            Some(other) => {
                return Err(ResolverError::validation(
                    "Invalid parameter",
                    format!("Unknown funnel_viz_type '{}'", other),
                ))
            }
        };
        let correlation_person_entity = params
            .get_json("funnel_correlation_person_entity")?
            .map(|raw| Entity::from_json(&raw, EntityType::Events))
            .transpose()?;

        Ok(Self {
            funnel_step,
            funnel_custom_steps,
            order_type,
            viz_type,
            window_days: params
                .get_u32("funnel_window_days")?
                .unwrap_or(Self::DEFAULT_WINDOW_DAYS),
            entrance_period_start: params.get_str("entrance_period_start"),
            drop_off: params.get_bool("drop_off"),
            correlation_person_entity,
            correlation_person_converted: params.get_bool("funnel_correlation_person_converted"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PathType {
    #[default]
    #[serde(rename = "$pageview")]
    Pageview,
    #[serde(rename = "$screen")]
    Screen,
    #[serde(rename = "custom_event")]
    CustomEvent,
}

/// A `"<step>_<value>"` path node key, e.g. `"2_/pricing"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathNode {
    pub step: u32,
    pub value: String,
}

impl PathNode {
    pub fn parse(raw: &str) -> Result<Self> {
        let (step, value) = raw.split_once('_').ok_or_else(|| {
            ResolverError::validation("Invalid path key", format!("'{}' is not a path node", raw))
        })?;
        let step = step.parse::<u32>().ok().filter(|s| *s > 0).ok_or_else(|| {
            ResolverError::validation("Invalid path key", format!("'{}' has no step number", raw))
        })?;
        Ok(Self {
            step,
            value: value.to_string(),
        })
    }
}

/// Whether the nested funnel selects actors before, after or between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelPathType {
    FunnelPathBeforeStep,
    FunnelPathAfterStep,
    FunnelPathBetweenSteps,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathParams {
    pub path_type: PathType,
    pub start_point: Option<String>,
    pub end_point: Option<String>,
    pub path_start_key: Option<PathNode>,
    pub path_end_key: Option<PathNode>,
    pub path_dropoff_key: Option<PathNode>,
    pub funnel_paths: Option<FunnelPathType>,
}

impl PathParams {
    pub fn from_params(params: &RequestParams) -> Result<Self> {
        let path_type = match params.get_str("path_type").as_deref() {
            None | Some("$pageview") => PathType::Pageview,
            Some("$screen") => PathType::Screen,
            Some("custom_event") => PathType::CustomEvent,
            Some(other) => {
                return Err(ResolverError::validation(
                    "Invalid parameter",
                    format!("Unknown path_type '{}'", other),
                ))
            }
        };
        let node = |key: &str| params.get_str(key).map(|raw| PathNode::parse(&raw)).transpose();
        let funnel_paths = match params.get_str("funnel_paths").as_deref() {
            None => None,
            Some("funnel_path_before_step") => Some(FunnelPathType::FunnelPathBeforeStep),
            Some("funnel_path_after_step") => Some(FunnelPathType::FunnelPathAfterStep),
            Some("funnel_path_between_steps") => Some(FunnelPathType::FunnelPathBetweenSteps),
            Some(other) => {
                return Err(ResolverError::validation(
                    "Invalid parameter",
                    format!("Unknown funnel_paths '{}'", other),
                ))
            }
        };
        Ok(Self {
            path_type,
            start_point: params.get_str("start_point"),
            end_point: params.get_str("end_point"),
            path_start_key: node("path_start_key")?,
            path_end_key: node("path_end_key")?,
            path_dropoff_key: node("path_dropoff_key")?,
            funnel_paths,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionType {
    #[default]
    RetentionRecurring,
    RetentionFirstTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionParams {
    pub target_entity: Entity,
    pub returning_entity: Entity,
    pub period: Interval,
    pub total_intervals: u32,
    pub selected_interval: u32,
    pub retention_type: RetentionType,
}

impl RetentionParams {
    pub const DEFAULT_TOTAL_INTERVALS: u32 = 11;

    pub fn from_params(params: &RequestParams) -> Result<Self> {
        let entity = |key: &str| -> Result<Entity> {
            Ok(match params.get_json(key)? {
                Some(raw) => Entity::from_json(&raw, EntityType::Events)?,
                None => Entity::event("$pageview"),
            })
        };
        let period = match params.get_str("period") {
            Some(raw) => raw.parse()?,
            None => Interval::Day,
        };
        let total_intervals = params
            .get_u32("total_intervals")?
            .unwrap_or(Self::DEFAULT_TOTAL_INTERVALS)
            .max(1);
        let selected_interval = params.get_u32("selected_interval")?.unwrap_or(0);
        if selected_interval >= total_intervals {
            return Err(ResolverError::validation(
                "Invalid parameter",
                "selected_interval must be smaller than total_intervals",
            ));
        }
        let retention_type = match params.get_str("retention_type").as_deref() {
            None | Some("retention_recurring") => RetentionType::RetentionRecurring,
            Some("retention_first_time") => RetentionType::RetentionFirstTime,
            Some(other) => {
                return Err(ResolverError::validation(
                    "Invalid parameter",
                    format!("Unknown retention_type '{}'", other),
                ))
            }
        };
        Ok(Self {
            target_entity: entity("target_entity")?,
            returning_entity: entity("returning_entity")?,
            period,
            total_intervals,
            selected_interval,
            retention_type,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickinessParams {
    /// Number of intervals an actor must have been active on.
    pub stickiness_days: u32,
    pub target_entity: Entity,
}

impl StickinessParams {
    /// The target entity comes from `entityId`/`type`, matched against the
    /// filter's own entities so per-entity predicates carry over.
    pub fn from_params(params: &RequestParams, entities: &[Entity]) -> Result<Self> {
        let stickiness_days = params
            .get_u32("stickiness_days")?
            .filter(|d| *d > 0)
            .ok_or_else(|| ResolverError::missing_parameter("Must include stickiness_days"))?;
        let entity_id = params
            .get_str("entityId")
            .or_else(|| params.get_str("entity_id"))
            .ok_or_else(|| ResolverError::missing_parameter("Must include entityId"))?;
        let entity_type = match params
            .get_str("type")
            .or_else(|| params.get_str("entity_type"))
            .as_deref()
        {
            None | Some("events") => EntityType::Events,
            Some("actions") => EntityType::Actions,
            Some(other) => {
                return Err(ResolverError::validation(
                    "Invalid parameter",
                    format!("Unknown entity type '{}'", other),
                ))
            }
        };
        let target_entity = entities
            .iter()
            .find(|e| e.id == entity_id && e.entity_type == entity_type)
            .cloned()
            .unwrap_or_else(|| Entity {
                entity_type,
                ..Entity::event(entity_id)
            });
        Ok(Self {
            stickiness_days,
            target_entity,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleType {
    New,
    Returning,
    Resurrecting,
    Dormant,
}

impl std::str::FromStr for LifecycleType {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(LifecycleType::New),
            "returning" => Ok(LifecycleType::Returning),
            "resurrecting" => Ok(LifecycleType::Resurrecting),
            "dormant" => Ok(LifecycleType::Dormant),
            other => Err(ResolverError::validation(
                "Invalid parameter",
                format!("Unknown lifecycle_type '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleParams {
    /// Raw `target_date` as sent, kept for normalisation.
    pub target_date: String,
    #[serde(skip)]
    pub target_date_parsed: Option<chrono::DateTime<chrono::Utc>>,
    pub lifecycle_type: LifecycleType,
    /// First entity of the filter.
    pub target_entity: Entity,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entities_sorted_by_order() {
        let params = RequestParams::new().with_body(
            "events",
            json!([
                {"id": "signup", "order": 1},
                {"id": "$pageview", "order": 0}
            ]),
        );
        let entities = parse_entities(&params).unwrap();
        assert_eq!(entities[0].id, "$pageview");
        assert_eq!(entities[1].id, "signup");
    }

    #[test]
    fn test_path_node_parse() {
        let node = PathNode::parse("2_/pricing_page").unwrap();
        assert_eq!(node.step, 2);
        assert_eq!(node.value, "/pricing_page");
        assert!(PathNode::parse("/pricing").is_err());
    }

    #[test]
    fn test_zero_funnel_step_rejected() {
        let params = RequestParams::new().with_query("funnel_step", "0");
        assert!(FunnelParams::from_params(&params).is_err());
    }

    #[test]
    fn test_stickiness_requires_entity() {
        let params = RequestParams::new().with_query("stickiness_days", "3");
        assert!(StickinessParams::from_params(&params, &[]).is_err());

        let params = params.with_query("entityId", "$pageview");
        let sticky = StickinessParams::from_params(&params, &[]).unwrap();
        assert_eq!(sticky.target_entity.id, "$pageview");
        assert_eq!(sticky.stickiness_days, 3);
    }
}
