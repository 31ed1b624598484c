//! Identity graph planning
//!
//! Pure functions deciding what a merge or split changes. Stores apply the
//! resulting plans inside one transaction.

use crate::actors::Actor;
use crate::error::{ResolverError, Result};
use lazy_static::lazy_static;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use uuid::Uuid;

lazy_static! {
    /// Namespace for actor UUIDs seeded by a split.
    static ref SPLIT_NAMESPACE: Uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, b"people-resolver.split");
}

/// Deterministic actor UUID for an alias split out of its actor. Repeated
/// deliveries of the same split create the same actor.
pub fn split_actor_uuid(team_id: i64, distinct_id: &str) -> Uuid {
    Uuid::new_v5(&SPLIT_NAMESPACE, format!("{}:{}", team_id, distinct_id).as_bytes())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergePlan {
    pub target_id: i64,
    /// Target's bag after absorbing source-only keys
    pub properties: Map<String, Value>,
    /// Actors deleted by the merge
    pub source_ids: Vec<i64>,
    /// Aliases moving onto the target
    pub moved_distinct_ids: Vec<String>,
}

/// Union aliases into `target`. Keys the target already has are untouched;
/// keys only a source has are copied, earlier sources first.
pub fn plan_merge(target: &Actor, sources: &[Actor]) -> Result<MergePlan> {
    if sources.iter().any(|s| s.id == target.id) {
        return Err(ResolverError::validation(
            "Invalid merge",
            "A person cannot be merged into itself",
        ));
    }

    let mut properties = target.properties.clone();
    let mut seen: HashSet<&str> = target.distinct_ids.iter().map(String::as_str).collect();
    let mut moved_distinct_ids = Vec::new();
    let mut source_ids = Vec::new();

    for source in sources {
        if source_ids.contains(&source.id) {
            continue;
        }
        source_ids.push(source.id);
        for (key, value) in &source.properties {
            if !properties.contains_key(key) {
                properties.insert(key.clone(), value.clone());
            }
        }
        for distinct_id in &source.distinct_ids {
            if seen.insert(distinct_id.as_str()) {
                moved_distinct_ids.push(distinct_id.clone());
            }
        }
    }

    Ok(MergePlan {
        target_id: target.id,
        properties,
        source_ids,
        moved_distinct_ids,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitSeed {
    pub uuid: Uuid,
    pub distinct_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitPlan {
    pub actor_id: i64,
    /// Alias that keeps the original identity
    pub keep: String,
    /// Without an explicit main alias the retained actor's bag is reset too
    pub clear_properties: bool,
    /// One new actor per other alias, each with an empty bag
    pub seeds: Vec<SplitSeed>,
}

pub fn plan_split(actor: &Actor, main_distinct_id: Option<&str>) -> Result<SplitPlan> {
    let keep = match main_distinct_id {
        Some(main) => {
            if !actor.distinct_ids.iter().any(|d| d == main) {
                return Err(ResolverError::validation(
                    "Invalid split",
                    format!("'{}' is not a distinct id of this person", main),
                ));
            }
            main.to_string()
        }
        None => actor.distinct_ids.first().cloned().ok_or_else(|| {
            ResolverError::validation("Invalid split", "Person has no distinct ids")
        })?,
    };

    let mut seen = HashSet::new();
    let seeds = actor
        .distinct_ids
        .iter()
        .filter(|d| **d != keep && seen.insert(d.as_str()))
        .map(|distinct_id| SplitSeed {
            uuid: split_actor_uuid(actor.team_id, distinct_id),
            distinct_id: distinct_id.clone(),
        })
        .collect();

    Ok(SplitPlan {
        actor_id: actor.id,
        keep,
        clear_properties: main_distinct_id.is_none(),
        seeds,
    })
}
