//! Columnar executor contract
//!
//! The columnar store is a black-box SQL executor. Plans go in, rows come
//! back in store order. The identity index (alias → person rows kept in the
//! columnar store) is written through a separate trait so the async task
//! worker does not need the full executor.

pub mod clickhouse;
pub mod result;

pub use clickhouse::ClickHouseExecutor;
pub use result::QueryResult;

use crate::error::Result;
use crate::query::QueryPlan;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution context passed to executors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Team the query runs for (used for tagging)
    pub team_id: i64,

    /// Timeout in milliseconds
    pub timeout_ms: u64,

    /// Tag attached to the query in the store's query log
    pub query_tag: String,
}

impl ExecutionContext {
    pub fn new(team_id: i64, timeout_ms: u64, query_tag: impl Into<String>) -> Self {
        Self {
            team_id,
            timeout_ms,
            query_tag: query_tag.into(),
        }
    }
}

/// What an executor supports
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorCapabilities {
    /// Returns an exact total alongside a page, so no probe row is needed
    pub supports_exact_count_paging: bool,

    /// Accepts `{name:Type}` bound parameters
    pub supports_query_parameters: bool,
}

impl ExecutorCapabilities {
    /// ClickHouse over HTTP
    pub fn clickhouse() -> Self {
        Self {
            supports_exact_count_paging: false,
            supports_query_parameters: true,
        }
    }
}

#[async_trait]
pub trait ColumnarExecutor: Send + Sync {
    /// Executor name (e.g., "clickhouse")
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> &ExecutorCapabilities;

    /// Run one plan. Called exactly once per resolution.
    async fn execute(&self, plan: &QueryPlan, ctx: &ExecutionContext) -> Result<QueryResult>;

    /// Check if the store is reachable
    async fn health_check(&self) -> Result<bool>;
}

/// Writes to the columnar alias → person index.
#[async_trait]
pub trait IdentityIndex: Send + Sync {
    /// Point `distinct_ids` at `person_id`.
    async fn reassign(
        &self,
        team_id: i64,
        person_id: Uuid,
        distinct_ids: &[String],
        version: i64,
    ) -> Result<()>;

    /// Tombstone `distinct_ids` and the person row.
    async fn remove(
        &self,
        team_id: i64,
        person_id: Uuid,
        distinct_ids: &[String],
        version: i64,
    ) -> Result<()>;
}
