//! Actor Materializer
//!
//! Hydrates resolved actor ids from the relational store. Output follows the
//! input order and duplicate ids collapse to their first occurrence. Ids the
//! store does not know are dropped: the columnar index may lag behind
//! relational deletes and merges.

use crate::error::{ResolverError, Result};
use crate::store::ActorStore;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

lazy_static! {
    static ref ANONYMOUS_ID: Regex = Regex::new(r"^([a-z0-9]+\-){4}([a-z0-9]+)$").unwrap();
}

/// UUID-shaped aliases are generated by SDKs before identification.
pub fn is_anonymous_id(distinct_id: &str) -> bool {
    ANONYMOUS_ID.is_match(distinct_id)
}

/// A person as stored relationally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: i64,
    pub uuid: Uuid,
    pub team_id: i64,
    pub properties: Map<String, Value>,
    pub distinct_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub is_identified: bool,
}

impl Actor {
    /// Non-empty `email`, else the first alias with anonymous ones last,
    /// else the primary key.
    pub fn display_name(&self) -> String {
        if let Some(Value::String(email)) = self.properties.get("email") {
            if !email.is_empty() {
                return email.clone();
            }
        }
        self.sorted_distinct_ids()
            .into_iter()
            .next()
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Deduplicated aliases, identified ones first, lexicographic within each group.
    pub fn sorted_distinct_ids(&self) -> Vec<String> {
        self.distinct_ids
            .iter()
            .unique()
            .sorted_by(|a, b| (is_anonymous_id(a), a.as_str()).cmp(&(is_anonymous_id(b), b.as_str())))
            .cloned()
            .collect()
    }

    pub fn serialize(&self) -> SerializedActor {
        SerializedActor {
            id: self.id,
            uuid: self.uuid,
            name: self.display_name(),
            distinct_ids: self.sorted_distinct_ids(),
            properties: self.properties.clone(),
            created_at: self.created_at,
            is_identified: self.is_identified,
        }
    }
}

/// Response shape of one actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedActor {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub distinct_ids: Vec<String>,
    pub properties: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub is_identified: bool,
}

pub struct Materializer {
    store: Arc<dyn ActorStore>,
}

impl Materializer {
    pub fn new(store: Arc<dyn ActorStore>) -> Self {
        Self { store }
    }

    /// One batched fetch; output in input order without duplicates.
    pub async fn materialize(&self, team_id: i64, ids: &[Uuid]) -> Result<Vec<Actor>> {
        let unique: Vec<Uuid> = ids.iter().copied().unique().collect();
        if unique.is_empty() {
            return Ok(Vec::new());
        }
        let mut by_uuid: HashMap<Uuid, Actor> = self
            .store
            .fetch_by_uuids(team_id, &unique)
            .await?
            .into_iter()
            .map(|actor| (actor.uuid, actor))
            .collect();

        let actors: Vec<Actor> = unique.iter().filter_map(|id| by_uuid.remove(id)).collect();
        if actors.len() < unique.len() {
            debug!(
                team_id,
                missing = unique.len() - actors.len(),
                "dropping actors absent from the relational store"
            );
        }
        Ok(actors)
    }

    pub async fn serialized(&self, team_id: i64, ids: &[Uuid]) -> Result<Vec<SerializedActor>> {
        Ok(self
            .materialize(team_id, ids)
            .await?
            .iter()
            .map(Actor::serialize)
            .collect())
    }
}

/// Flatten actors into CSV for bulk export. Property columns are the union of
/// keys across the page, sorted.
pub fn render_csv(actors: &[SerializedActor]) -> Result<String> {
    let property_keys: Vec<&String> = actors
        .iter()
        .flat_map(|a| a.properties.keys())
        .unique()
        .sorted()
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = vec![
        "id".to_string(),
        "uuid".to_string(),
        "name".to_string(),
        "distinct_ids".to_string(),
        "created_at".to_string(),
        "is_identified".to_string(),
    ];
    header.extend(property_keys.iter().map(|k| format!("properties.{}", k)));
    writer.write_record(&header).map_err(csv_error)?;

    for actor in actors {
        let mut record = vec![
            actor.id.to_string(),
            actor.uuid.to_string(),
            actor.name.clone(),
            actor.distinct_ids.join(","),
            actor.created_at.to_rfc3339(),
            actor.is_identified.to_string(),
        ];
        for key in &property_keys {
            record.push(match actor.properties.get(key.as_str()) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            });
        }
        writer.write_record(&record).map_err(csv_error)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| ResolverError::Execution(format!("CSV flush failed: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| ResolverError::Execution(format!("CSV is not UTF-8: {}", e)))
}

fn csv_error(err: csv::Error) -> ResolverError {
    ResolverError::Execution(format!("CSV write failed: {}", err))
}
