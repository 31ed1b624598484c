//! Relational actor store contract
//!
//! The relational store owns actor identity. Mutations run in one
//! transaction each; merge and split load their rows under that transaction
//! and apply a plan from [`crate::identity::graph`].

use crate::actors::Actor;
use crate::error::{ResolverError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Actors are addressed by primary key or UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorLookup {
    Id(i64),
    Uuid(Uuid),
}

impl ActorLookup {
    pub fn parse(raw: &str) -> Result<Self> {
        if let Ok(id) = raw.parse::<i64>() {
            return Ok(ActorLookup::Id(id));
        }
        Uuid::parse_str(raw)
            .map(ActorLookup::Uuid)
            .map_err(|_| ResolverError::NotFound(format!("person '{}'", raw)))
    }
}

impl std::fmt::Display for ActorLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorLookup::Id(id) => write!(f, "{}", id),
            ActorLookup::Uuid(uuid) => write!(f, "{}", uuid),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewActor {
    pub uuid: Option<Uuid>,
    pub properties: Map<String, Value>,
    pub distinct_ids: Vec<String>,
    pub is_identified: bool,
}

/// Snapshots around a committed merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub target_before: Actor,
    pub target: Actor,
    /// Source actors as they were before being absorbed
    pub sources: Vec<Actor>,
    pub moved_distinct_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub retained: Actor,
    /// Actors created (or found, on redelivery) for the split-off aliases
    pub created: Vec<Actor>,
}

#[async_trait]
pub trait ActorStore: Send + Sync {
    /// Batched fetch; order is not significant.
    async fn fetch_by_uuids(&self, team_id: i64, uuids: &[Uuid]) -> Result<Vec<Actor>>;

    /// `NotFound` when absent.
    async fn get(&self, team_id: i64, lookup: ActorLookup) -> Result<Actor>;

    async fn create(&self, team_id: i64, actor: NewActor) -> Result<Actor>;

    /// Delete the actor and its aliases, returning its last state.
    async fn delete(&self, team_id: i64, lookup: ActorLookup) -> Result<Actor>;

    /// Merge `sources` into `target`. `NotFound` if any of them is missing;
    /// nothing is written in that case.
    async fn merge(&self, team_id: i64, target: ActorLookup, sources: &[Uuid]) -> Result<MergeOutcome>;

    /// Split every alias but the kept one into its own actor.
    async fn split(
        &self,
        team_id: i64,
        actor_id: i64,
        main_distinct_id: Option<&str>,
    ) -> Result<SplitOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_parse() {
        assert_eq!(ActorLookup::parse("17").unwrap(), ActorLookup::Id(17));
        let uuid = Uuid::new_v4();
        assert_eq!(ActorLookup::parse(&uuid.to_string()).unwrap(), ActorLookup::Uuid(uuid));
        assert!(matches!(ActorLookup::parse("nope"), Err(ResolverError::NotFound(_))));
    }
}
