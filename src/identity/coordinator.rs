//! Merge/Split Coordinator
//!
//! Relational writes happen inside the store, one transaction per call. The
//! audit record and any columnar follow-up are issued once that transaction
//! has committed.

use crate::activity::{
    ActivityLog, AuditContext, Change, Detail, Merge, ACTIVITY_DELETED, ACTIVITY_DELETE_PROPERTY,
    ACTIVITY_PEOPLE_MERGED_INTO, ACTIVITY_SPLIT_PERSON, ACTIVITY_UPDATED,
    ACTIVITY_WAS_MERGED_INTO_PERSON, PERSON_SCOPE,
};
use crate::actors::Actor;
use crate::error::{ResolverError, Result};
use crate::events::{EventSink, InternalEvent};
use crate::store::{ActorLookup, ActorStore};
use crate::tasks::{index_version, Task, TaskQueue};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct IdentityCoordinator {
    store: Arc<dyn ActorStore>,
    activity: Arc<dyn ActivityLog>,
    tasks: Arc<dyn TaskQueue>,
    events: Arc<dyn EventSink>,
}

impl IdentityCoordinator {
    pub fn new(
        store: Arc<dyn ActorStore>,
        activity: Arc<dyn ActivityLog>,
        tasks: Arc<dyn TaskQueue>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            activity,
            tasks,
            events,
        }
    }

    /// Merge `sources` (by uuid) into `target`. Returns the merged actor.
    pub async fn merge(
        &self,
        audit: &AuditContext,
        target: ActorLookup,
        sources: &[Uuid],
    ) -> Result<Actor> {
        let outcome = self.store.merge(audit.team_id, target, sources).await?;
        info!(
            team_id = audit.team_id,
            target = outcome.target.id,
            sources = outcome.sources.len(),
            moved = outcome.moved_distinct_ids.len(),
            "merged people"
        );

        let target_snapshot = snapshot(&outcome.target)?;
        let mut source_snapshots = Vec::with_capacity(outcome.sources.len());
        for source in &outcome.sources {
            let source_snapshot = snapshot(source)?;
            self.activity
                .log(audit.record(
                    source.id,
                    ACTIVITY_WAS_MERGED_INTO_PERSON,
                    Detail {
                        merge: Some(Merge {
                            merge_type: PERSON_SCOPE.to_string(),
                            source: Some(source_snapshot.clone()),
                            target: Some(target_snapshot.clone()),
                        }),
                        ..Default::default()
                    },
                ))
                .await?;
            source_snapshots.push(source_snapshot);
        }
        self.activity
            .log(audit.record(
                outcome.target.id,
                ACTIVITY_PEOPLE_MERGED_INTO,
                Detail {
                    merge: Some(Merge {
                        merge_type: PERSON_SCOPE.to_string(),
                        source: Some(Value::Array(source_snapshots)),
                        target: Some(target_snapshot),
                    }),
                    ..Default::default()
                },
            ))
            .await?;

        let version = index_version();
        for source in &outcome.sources {
            self.tasks
                .enqueue(Task::DeleteDistinctIds {
                    team_id: audit.team_id,
                    person_uuid: source.uuid,
                    distinct_ids: Vec::new(),
                    version,
                })
                .await?;
        }
        if !outcome.moved_distinct_ids.is_empty() {
            self.tasks
                .enqueue(Task::ReassignDistinctIds {
                    team_id: audit.team_id,
                    person_uuid: outcome.target.uuid,
                    distinct_ids: outcome.moved_distinct_ids.clone(),
                    version,
                })
                .await?;
        }

        Ok(outcome.target)
    }

    /// Record the split and queue it. The split itself runs on a task worker.
    pub async fn split(
        &self,
        audit: &AuditContext,
        lookup: ActorLookup,
        main_distinct_id: Option<String>,
    ) -> Result<()> {
        let actor = self.store.get(audit.team_id, lookup).await?;
        if let Some(main) = &main_distinct_id {
            if !actor.distinct_ids.contains(main) {
                return Err(ResolverError::validation(
                    "Invalid split",
                    format!("'{}' is not a distinct id of this person", main),
                ));
            }
        }

        self.activity
            .log(audit.record(
                actor.id,
                ACTIVITY_SPLIT_PERSON,
                Detail {
                    changes: vec![Change::new(PERSON_SCOPE, "split")
                        .after(json!({ "distinct_ids": actor.distinct_ids }))],
                    ..Default::default()
                },
            ))
            .await?;

        self.tasks
            .enqueue(Task::SplitActor {
                team_id: audit.team_id,
                actor_id: actor.id,
                main_distinct_id,
            })
            .await?;
        info!(team_id = audit.team_id, actor_id = actor.id, "queued person split");
        Ok(())
    }

    pub async fn delete(&self, audit: &AuditContext, lookup: ActorLookup) -> Result<()> {
        let actor = self.store.delete(audit.team_id, lookup).await.map_err(|e| match e {
            ResolverError::NotFound(_) => ResolverError::NotFound("Person not found.".to_string()),
            other => other,
        })?;

        self.tasks
            .enqueue(Task::DeleteDistinctIds {
                team_id: audit.team_id,
                person_uuid: actor.uuid,
                distinct_ids: actor.distinct_ids.clone(),
                version: index_version(),
            })
            .await?;

        self.activity
            .log(audit.record(
                actor.id,
                ACTIVITY_DELETED,
                Detail {
                    name: Some(actor.id.to_string()),
                    ..Default::default()
                },
            ))
            .await?;
        info!(team_id = audit.team_id, actor_id = actor.id, "deleted person");
        Ok(())
    }

    pub async fn delete_property(
        &self,
        audit: &AuditContext,
        lookup: ActorLookup,
        key: &str,
    ) -> Result<()> {
        let actor = self.store.get(audit.team_id, lookup).await?;
        let distinct_id = first_distinct_id(&actor)?;
        self.events
            .capture(InternalEvent::unset_property(audit.team_id, distinct_id, key))
            .await?;

        self.activity
            .log(audit.record(
                actor.id,
                ACTIVITY_DELETE_PROPERTY,
                Detail {
                    changes: vec![Change::new(PERSON_SCOPE, "changed")],
                    ..Default::default()
                },
            ))
            .await
    }

    /// Replace the property bag through the ingestion path.
    pub async fn update(
        &self,
        audit: &AuditContext,
        lookup: ActorLookup,
        properties: Map<String, Value>,
    ) -> Result<()> {
        let actor = self.store.get(audit.team_id, lookup).await?;
        let distinct_id = first_distinct_id(&actor)?;
        self.events
            .capture(InternalEvent::set_properties(audit.team_id, distinct_id, properties))
            .await?;

        self.activity
            .log(audit.record(
                actor.id,
                ACTIVITY_UPDATED,
                Detail {
                    changes: vec![Change::new(PERSON_SCOPE, "changed").field("properties")],
                    ..Default::default()
                },
            ))
            .await
    }
}

fn snapshot(actor: &Actor) -> Result<Value> {
    Ok(serde_json::to_value(actor.serialize())?)
}

fn first_distinct_id(actor: &Actor) -> Result<&str> {
    actor
        .distinct_ids
        .first()
        .map(String::as_str)
        .ok_or_else(|| ResolverError::validation("Invalid person", "Person has no distinct ids"))
}
