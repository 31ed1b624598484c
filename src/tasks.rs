//! Asynchronous identity tasks
//!
//! Work the request path hands off: splitting an actor and keeping the
//! columnar alias index in line with the relational store. Delivery is
//! at-least-once, so every handler must tolerate a repeat.

use crate::error::{ResolverError, Result};
use crate::execution::IdentityIndex;
use crate::store::ActorStore;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    SplitActor {
        team_id: i64,
        actor_id: i64,
        main_distinct_id: Option<String>,
    },
    ReassignDistinctIds {
        team_id: i64,
        person_uuid: Uuid,
        distinct_ids: Vec<String>,
        version: i64,
    },
    DeleteDistinctIds {
        team_id: i64,
        person_uuid: Uuid,
        distinct_ids: Vec<String>,
        version: i64,
    },
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Task::SplitActor { .. } => "split_actor",
            Task::ReassignDistinctIds { .. } => "reassign_distinct_ids",
            Task::DeleteDistinctIds { .. } => "delete_distinct_ids",
        }
    }

    pub fn team_id(&self) -> i64 {
        match self {
            Task::SplitActor { team_id, .. }
            | Task::ReassignDistinctIds { team_id, .. }
            | Task::DeleteDistinctIds { team_id, .. } => *team_id,
        }
    }
}

/// Version stamp for columnar index rows. Later writes must win.
pub fn index_version() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<()>;
}

/// A task handed to a worker, with the queue's handle for acknowledging it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    /// Queue row id; `None` for in-process channels
    pub id: Option<i64>,
    pub task: Task,
    pub attempts: i32,
}

#[async_trait]
pub trait TaskSource: Send {
    /// Next task, or `None` once the source is closed.
    async fn next(&mut self) -> Result<Option<ClaimedTask>>;

    async fn ack(&mut self, claimed: &ClaimedTask) -> Result<()>;

    /// Record a failed attempt. The source decides whether to redeliver.
    async fn fail(&mut self, claimed: &ClaimedTask, reason: &str) -> Result<()>;
}

/// In-process queue backed by an unbounded tokio channel.
#[derive(Clone)]
pub struct ChannelTaskQueue {
    tx: mpsc::UnboundedSender<Task>,
}

impl ChannelTaskQueue {
    pub fn new() -> (Self, ChannelTaskSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, ChannelTaskSource { rx })
    }
}

#[async_trait]
impl TaskQueue for ChannelTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<()> {
        self.tx
            .send(task)
            .map_err(|e| ResolverError::Queue(format!("task channel closed: {}", e)))
    }
}

pub struct ChannelTaskSource {
    rx: mpsc::UnboundedReceiver<Task>,
}

impl ChannelTaskSource {
    /// Pop a task without waiting.
    pub fn try_next(&mut self) -> Option<Task> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
impl TaskSource for ChannelTaskSource {
    async fn next(&mut self) -> Result<Option<ClaimedTask>> {
        Ok(self.rx.recv().await.map(|task| ClaimedTask {
            id: None,
            task,
            attempts: 0,
        }))
    }

    async fn ack(&mut self, _claimed: &ClaimedTask) -> Result<()> {
        Ok(())
    }

    async fn fail(&mut self, _claimed: &ClaimedTask, _reason: &str) -> Result<()> {
        Ok(())
    }
}

/// Consumes tasks and applies them. Failures are logged and reported back to
/// the source; they never reach the request that enqueued the task.
pub struct TaskWorker {
    store: Arc<dyn ActorStore>,
    index: Arc<dyn IdentityIndex>,
}

impl TaskWorker {
    pub fn new(store: Arc<dyn ActorStore>, index: Arc<dyn IdentityIndex>) -> Self {
        Self { store, index }
    }

    pub async fn run<S: TaskSource>(&self, mut source: S) -> Result<()> {
        while let Some(claimed) = source.next().await? {
            self.process(&mut source, &claimed).await?;
        }
        info!("task source closed, worker stopping");
        Ok(())
    }

    /// Drain whatever a channel holds right now.
    pub async fn drain(&self, source: &mut ChannelTaskSource) -> Result<usize> {
        let mut handled = 0;
        while let Some(task) = source.try_next() {
            let claimed = ClaimedTask {
                id: None,
                task,
                attempts: 0,
            };
            self.process(source, &claimed).await?;
            handled += 1;
        }
        Ok(handled)
    }

    async fn process<S: TaskSource>(&self, source: &mut S, claimed: &ClaimedTask) -> Result<()> {
        match self.handle(&claimed.task).await {
            Ok(()) => source.ack(claimed).await,
            Err(e) => {
                error!(
                    task = claimed.task.kind(),
                    team_id = claimed.task.team_id(),
                    attempts = claimed.attempts,
                    "task failed: {}",
                    e
                );
                source.fail(claimed, &e.to_string()).await
            }
        }
    }

    pub async fn handle(&self, task: &Task) -> Result<()> {
        match task {
            Task::SplitActor {
                team_id,
                actor_id,
                main_distinct_id,
            } => {
                let outcome = self
                    .store
                    .split(*team_id, *actor_id, main_distinct_id.as_deref())
                    .await?;
                let version = index_version();
                for created in &outcome.created {
                    self.index
                        .reassign(*team_id, created.uuid, &created.distinct_ids, version)
                        .await?;
                }
                info!(
                    team_id,
                    actor_id,
                    created = outcome.created.len(),
                    "split person"
                );
                Ok(())
            }
            Task::ReassignDistinctIds {
                team_id,
                person_uuid,
                distinct_ids,
                version,
            } => {
                self.index
                    .reassign(*team_id, *person_uuid, distinct_ids, *version)
                    .await
            }
            Task::DeleteDistinctIds {
                team_id,
                person_uuid,
                distinct_ids,
                version,
            } => {
                self.index
                    .remove(*team_id, *person_uuid, distinct_ids, *version)
                    .await
            }
        }
    }
}
