//! Parameterized property-definition search
//!
//! Request options become predicate fragments with Postgres `$n` bind
//! parameters. No user input is spliced into the SQL text.

use super::HiddenProperties;
use crate::error::{ResolverError, Result};
use crate::filter::RequestParams;

const FEATURE_FLAG_LIKE: &str = "$feature/%";

const EVENT_PROPERTY_FIELD: &str = "(SELECT count(1) > 0 FROM posthog_eventproperty \
     WHERE posthog_eventproperty.team_id = posthog_propertydefinition.team_id \
     AND posthog_eventproperty.event = ANY({events}) \
     AND posthog_eventproperty.property = posthog_propertydefinition.name)";

#[derive(Debug, Clone, PartialEq)]
pub enum PgParam {
    Int(i64),
    Text(String),
    TextArray(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CatalogQuery {
    pub team_id: i64,
    /// Restrict to these names
    pub names: Vec<String>,
    pub numerical_only: bool,
    /// `Some(true)`: only `$feature/...` names; `Some(false)`: none of them
    pub feature_flag: Option<bool>,
    /// Events whose properties get `is_event_property` computed
    pub event_names: Vec<String>,
    pub is_event_property: Option<bool>,
    /// Caller exclusions plus hidden names
    pub excluded: Vec<String>,
    /// Whitespace-split search, every term must match
    pub search_terms: Vec<String>,
    pub limit: u32,
    pub offset: u32,
}

impl CatalogQuery {
    pub fn from_params(
        params: &RequestParams,
        team_id: i64,
        hidden: &HiddenProperties,
        default_limit: u32,
    ) -> Result<Self> {
        let names: Vec<String> = params
            .get_str("properties")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let event_names = string_list(params, "event_names")?;
        let mut excluded = string_list(params, "excluded_properties")?;
        excluded.extend(hidden.iter().map(String::from));
        excluded.sort();
        excluded.dedup();

        let search_terms: Vec<String> = params
            .get_str("search")
            .map(|s| {
                s.replace('\0', "")
                    .split_whitespace()
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let limit = params.get_u32("limit")?.unwrap_or(default_limit);
        if limit == 0 {
            return Err(ResolverError::validation(
                "Invalid parameter",
                "limit must be positive",
            ));
        }

        Ok(Self {
            team_id,
            names,
            numerical_only: params.get_str("is_numerical").as_deref() == Some("true"),
            feature_flag: match params.get_str("is_feature_flag").as_deref() {
                Some("true") => Some(true),
                Some("false") => Some(false),
                _ => None,
            },
            event_names,
            is_event_property: match params.get_str("is_event_property").as_deref() {
                Some("true") => Some(true),
                Some("false") => Some(false),
                _ => None,
            },
            excluded,
            search_terms,
            limit,
            offset: params.get_u32("offset")?.unwrap_or(0),
        })
    }

    /// SQL and its bind parameters in `$n` order.
    pub fn render(&self) -> (String, Vec<PgParam>) {
        let mut params: Vec<PgParam> = Vec::new();
        let mut bind = |param: PgParam| {
            params.push(param);
            format!("${}", params.len())
        };

        let team = bind(PgParam::Int(self.team_id));
        let excluded = bind(PgParam::TextArray(self.excluded.clone()));
        let mut conditions = vec![
            format!("team_id = {}", team),
            format!("NOT (name = ANY({}))", excluded),
        ];

        if !self.names.is_empty() {
            conditions.push(format!("name = ANY({})", bind(PgParam::TextArray(self.names.clone()))));
        }
        if self.numerical_only {
            conditions.push(
                "is_numerical = true AND name NOT IN ('distinct_id', 'timestamp')".to_string(),
            );
        }
        for term in &self.search_terms {
            conditions.push(format!(
                "name ILIKE {}",
                bind(PgParam::Text(format!("%{}%", term)))
            ));
        }

        let event_field = if self.event_names.is_empty() {
            "NULL::boolean".to_string()
        } else {
            let events = bind(PgParam::TextArray(self.event_names.clone()));
            EVENT_PROPERTY_FIELD.replace("{events}", &events)
        };
        if !self.event_names.is_empty() {
            match self.is_event_property {
                Some(true) => conditions.push(format!("{} = true", event_field)),
                Some(false) => conditions.push(format!("{} = false", event_field)),
                None => {}
            }
        }

        match self.feature_flag {
            Some(true) => conditions.push(format!(
                "name LIKE {}",
                bind(PgParam::Text(FEATURE_FLAG_LIKE.to_string()))
            )),
            Some(false) => conditions.push(format!(
                "name NOT LIKE {}",
                bind(PgParam::Text(FEATURE_FLAG_LIKE.to_string()))
            )),
            None => {}
        }

        let limit = bind(PgParam::Int(self.limit as i64));
        let offset = bind(PgParam::Int(self.offset as i64));

        let sql = format!(
            r#"
            SELECT id, name, is_numerical, query_usage_30_day, property_type,
                   {event_field} AS is_event_property
            FROM posthog_propertydefinition
            WHERE {conditions}
            ORDER BY is_event_property DESC, query_usage_30_day DESC NULLS LAST, name ASC
            LIMIT {limit} OFFSET {offset}
            "#,
            event_field = event_field,
            conditions = conditions
                .iter()
                .map(|c| format!("({})", c))
                .collect::<Vec<_>>()
                .join(" AND "),
            limit = limit,
            offset = offset,
        );
        (sql, params)
    }
}

/// JSON-encoded string list, e.g. `event_names=["$pageview"]`.
fn string_list(params: &RequestParams, key: &str) -> Result<Vec<String>> {
    match params.get_json(key)? {
        None => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::String(s) => Ok(s),
                other => Err(ResolverError::validation(
                    "Invalid parameter",
                    format!("{} must be a list of strings, got {}", key, other),
                )),
            })
            .collect(),
        Some(other) => Err(ResolverError::validation(
            "Invalid parameter",
            format!("{} must be a JSON list, got {}", key, other),
        )),
    }
}
