//! Actor Resolver
//!
//! Turns a filter and an actor mode into the ordered actor ids of one page.
//! Each mode builds its plan and runs it exactly once; ids come back in the
//! store's order and are never re-sorted here.

use crate::config::Settings;
use crate::error::{ResolverError, Result};
use crate::execution::{ColumnarExecutor, ExecutionContext, QueryResult};
use crate::filter::{Filter, FunnelOrderType, FunnelVizType};
use crate::observability::QueryMetrics;
use crate::query::funnel::FunnelVariant;
use crate::query::{self, QueryPlan};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Display value selecting per-period retention actors.
pub const RETENTION_TABLE_DISPLAY: &str = "ActionsTable";

/// Tenant entitlements consulted during dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    FunnelCorrelation,
}

pub trait CapabilityCheck: Send + Sync {
    fn has_capability(&self, team_id: i64, capability: Capability) -> bool;
}

/// Same answer for every team, from deployment settings.
#[derive(Debug, Clone, Copy)]
pub struct StaticCapabilities {
    pub ee_available: bool,
}

impl StaticCapabilities {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            ee_available: settings.ee_available,
        }
    }
}

impl CapabilityCheck for StaticCapabilities {
    fn has_capability(&self, _team_id: i64, capability: Capability) -> bool {
        match capability {
            Capability::FunnelCorrelation => self.ee_available,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorMode {
    Plain,
    Funnel,
    FunnelTrends,
    FunnelStrict,
    FunnelUnordered,
    FunnelCorrelation,
    Path,
    Retention,
    RetentionInPeriod,
    Stickiness,
    Lifecycle,
}

impl ActorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorMode::Plain => "plain",
            ActorMode::Funnel => "funnel",
            ActorMode::FunnelTrends => "funnel_trends",
            ActorMode::FunnelStrict => "funnel_strict",
            ActorMode::FunnelUnordered => "funnel_unordered",
            ActorMode::FunnelCorrelation => "funnel_correlation",
            ActorMode::Path => "path",
            ActorMode::Retention => "retention",
            ActorMode::RetentionInPeriod => "retention_in_period",
            ActorMode::Stickiness => "stickiness",
            ActorMode::Lifecycle => "lifecycle",
        }
    }

    /// Funnel sub-mode. Correlation wins when requested; without the
    /// capability it is an error rather than a silent fallback.
    pub fn for_funnel(filter: &Filter, capabilities: &dyn CapabilityCheck) -> Result<Self> {
        let funnel = filter
            .funnel()
            .ok_or_else(|| ResolverError::validation("Invalid filter", "Not a funnel filter"))?;
        if funnel.correlation_person_entity.is_some() {
            if capabilities.has_capability(filter.team_id(), Capability::FunnelCorrelation) {
                return Ok(ActorMode::FunnelCorrelation);
            }
            return Err(ResolverError::CapabilityUnavailable(
                "Funnel Correlations is not available without an enterprise license and enterprise supported deployment"
                    .to_string(),
            ));
        }
        if funnel.viz_type == FunnelVizType::Trends {
            return Ok(ActorMode::FunnelTrends);
        }
        Ok(match funnel.order_type {
            FunnelOrderType::Unordered => ActorMode::FunnelUnordered,
            FunnelOrderType::Strict => ActorMode::FunnelStrict,
            FunnelOrderType::Ordered => ActorMode::Funnel,
        })
    }

    pub fn for_retention(filter: &Filter) -> Self {
        if filter.display() == Some(RETENTION_TABLE_DISPLAY) {
            ActorMode::RetentionInPeriod
        } else {
            ActorMode::Retention
        }
    }

    /// Build the plan for this mode.
    pub fn plan(self, filter: &Filter, fetch_limit: u32) -> Result<QueryPlan> {
        match self {
            ActorMode::Plain => query::person::build(filter, fetch_limit),
            ActorMode::Funnel => query::funnel::build(filter, FunnelVariant::Ordered, fetch_limit),
            ActorMode::FunnelTrends => query::funnel::build(filter, FunnelVariant::Trends, fetch_limit),
            ActorMode::FunnelStrict => query::funnel::build(filter, FunnelVariant::Strict, fetch_limit),
            ActorMode::FunnelUnordered => {
                query::funnel::build(filter, FunnelVariant::Unordered, fetch_limit)
            }
            ActorMode::FunnelCorrelation => {
                query::funnel::build(filter, FunnelVariant::Correlation, fetch_limit)
            }
            ActorMode::Path => query::path::build(filter, fetch_limit),
            ActorMode::Retention => query::retention::build(filter, fetch_limit),
            ActorMode::RetentionInPeriod => query::retention::build_in_period(filter, fetch_limit),
            ActorMode::Stickiness => query::stickiness::build(filter, fetch_limit),
            ActorMode::Lifecycle => query::lifecycle::build(filter, fetch_limit),
        }
    }
}

/// Ids of one page, truncated to the page limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedActors {
    pub ids: Vec<Uuid>,
    /// Per-actor period flags, retention-in-period only.
    pub appearances: Option<Vec<Vec<u8>>>,
}

pub struct ActorResolver {
    executor: Arc<dyn ColumnarExecutor>,
    metrics: QueryMetrics,
    timeout: Duration,
}

impl ActorResolver {
    pub fn new(executor: Arc<dyn ColumnarExecutor>, metrics: QueryMetrics, timeout: Duration) -> Self {
        Self {
            executor,
            metrics,
            timeout,
        }
    }

    /// Rows to request for a page of `limit`: one extra probe row unless the
    /// executor pages with exact counts.
    pub fn fetch_limit(&self, limit: u32) -> u32 {
        if self.executor.capabilities().supports_exact_count_paging {
            limit
        } else {
            limit.saturating_add(1)
        }
    }

    /// Resolve one page of actor ids. `filter` must have its defaults applied.
    pub async fn resolve(&self, filter: &Filter, mode: ActorMode) -> Result<ResolvedActors> {
        let page = filter.page();
        let plan = mode.plan(filter, self.fetch_limit(page.limit))?;
        let result = self.run(&plan, filter.team_id(), mode.as_str()).await?;

        let mut ids = result.uuid_column()?;
        let mut appearances = match mode {
            ActorMode::RetentionInPeriod => Some(result.flags_column(1)?),
            _ => None,
        };
        ids.truncate(page.limit as usize);
        if let Some(flags) = appearances.as_mut() {
            flags.truncate(page.limit as usize);
        }

        info!(
            team_id = filter.team_id(),
            mode = mode.as_str(),
            rows = result.row_count(),
            returned = ids.len(),
            "resolved actors"
        );
        Ok(ResolvedActors { ids, appearances })
    }

    /// Most common values of a person property, as raw JSON text.
    pub async fn property_values(&self, team_id: i64, key: &str, prefix: Option<&str>) -> Result<Vec<(String, u64)>> {
        let plan = query::property_values::values_for_key(team_id, key, prefix);
        let outcome = self.run(&plan, team_id, "person_property_values").await;
        let team = team_id.to_string();
        match outcome {
            Ok(result) => {
                self.metrics.incr(
                    "get_person_property_values_for_key_success",
                    &[("team_id", team.as_str())],
                );
                result.name_counts()
            }
            Err(err) => {
                warn!(team_id, key, value = prefix.unwrap_or(""), "property values failed: {}", err);
                self.metrics.incr(
                    "get_person_property_values_for_key_error",
                    &[("team_id", team.as_str())],
                );
                Err(err)
            }
        }
    }

    /// Person property keys with their usage counts.
    pub async fn property_counts(&self, team_id: i64) -> Result<Vec<(String, u64)>> {
        let plan = query::property_values::property_counts(team_id);
        self.run(&plan, team_id, "person_property_counts").await?.name_counts()
    }

    /// Execute once under the deadline. No retries.
    async fn run(&self, plan: &QueryPlan, team_id: i64, tag: &str) -> Result<QueryResult> {
        let ctx = ExecutionContext::new(
            team_id,
            self.timeout.as_millis() as u64,
            format!("{}-{}", tag, Uuid::new_v4()),
        );
        debug!(team_id, tag, fetch_limit = plan.fetch_limit, "running plan");
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.executor.execute(plan, &ctx)).await;
        self.metrics.timing(tag, start.elapsed().as_millis() as u64);

        match outcome {
            Err(_) => {
                warn!(team_id, tag, "columnar query timed out after {:?}", self.timeout);
                self.metrics.incr("query_timeout", &[("query", tag)]);
                Err(ResolverError::QueryTimeout(self.timeout))
            }
            Ok(Err(err)) => {
                warn!(team_id, tag, "columnar query failed: {}", err);
                self.metrics.incr("query_error", &[("query", tag)]);
                Err(err)
            }
            Ok(Ok(result)) => {
                self.metrics.incr("query_success", &[("query", tag)]);
                Ok(result)
            }
        }
    }
}
