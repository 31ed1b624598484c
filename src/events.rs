//! Internal analytics events
//!
//! Property edits are not written relationally by this crate. They are sent
//! as `$set` / `$delete_person_property` events through the normal ingestion
//! path, which owns person property writes.

use crate::error::{ResolverError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

pub const EVENT_SET: &str = "$set";
pub const EVENT_DELETE_PERSON_PROPERTY: &str = "$delete_person_property";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalEvent {
    pub team_id: i64,
    pub event: String,
    pub distinct_id: String,
    pub properties: Value,
    pub timestamp: DateTime<Utc>,
}

impl InternalEvent {
    /// Replace the actor's properties.
    pub fn set_properties(team_id: i64, distinct_id: &str, properties: Map<String, Value>) -> Self {
        Self {
            team_id,
            event: EVENT_SET.to_string(),
            distinct_id: distinct_id.to_string(),
            properties: json!({ "$set": properties }),
            timestamp: Utc::now(),
        }
    }

    pub fn unset_property(team_id: i64, distinct_id: &str, key: &str) -> Self {
        Self {
            team_id,
            event: EVENT_DELETE_PERSON_PROPERTY.to_string(),
            distinct_id: distinct_id.to_string(),
            properties: json!({ "$unset": [key] }),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn capture(&self, event: InternalEvent) -> Result<()>;
}

/// Posts events to the capture endpoint.
pub struct CaptureClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl CaptureClient {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl EventSink for CaptureClient {
    async fn capture(&self, event: InternalEvent) -> Result<()> {
        let payload = json!({
            "api_key": self.api_key,
            "event": event.event,
            "distinct_id": event.distinct_id,
            "properties": event.properties,
            "timestamp": event.timestamp.to_rfc3339(),
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ResolverError::Capture(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ResolverError::Capture(format!(
                "capture returned {}: {}",
                status, body
            )));
        }
        debug!(team_id = event.team_id, event = %event.event, "captured internal event");
        Ok(())
    }
}

/// Hands events to an in-process receiver.
#[derive(Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<InternalEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InternalEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn capture(&self, event: InternalEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|e| ResolverError::Capture(format!("event channel closed: {}", e)))
    }
}
