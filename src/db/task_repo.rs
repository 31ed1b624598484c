//! Durable identity task queue on PostgreSQL
//!
//! Workers claim one row at a time with `FOR UPDATE SKIP LOCKED` and lease it
//! by pushing `available_at` forward. A worker that dies mid-task leaves the
//! row to be claimed again once the lease lapses.

use crate::error::{ResolverError, Result};
use crate::tasks::{ClaimedTask, Task, TaskQueue, TaskSource};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::warn;

const MAX_ATTEMPTS: i32 = 5;
const LEASE_SECS: f64 = 300.0;
const RETRY_BACKOFF_SECS: f64 = 30.0;

pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<()> {
        let payload = serde_json::to_value(&task)?;
        sqlx::query("INSERT INTO identity_task (kind, payload) VALUES ($1, $2)")
            .bind(task.kind())
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| ResolverError::Queue(e.to_string()))?;
        Ok(())
    }
}

pub struct PgTaskSource {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgTaskSource {
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
        }
    }

    async fn claim(&self) -> Result<Option<ClaimedTask>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT id, payload, attempts FROM identity_task
            WHERE available_at <= now() AND attempts < $1
            ORDER BY id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(MAX_ATTEMPTS)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let id: i64 = row.try_get("id")?;
        let attempts: i32 = row.try_get("attempts")?;
        sqlx::query(
            r#"
            UPDATE identity_task
            SET attempts = attempts + 1, available_at = now() + $2 * INTERVAL '1 second'
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(LEASE_SECS)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let payload: Value = row.try_get("payload")?;
        match serde_json::from_value::<Task>(payload) {
            Ok(task) => Ok(Some(ClaimedTask {
                id: Some(id),
                task,
                attempts: attempts + 1,
            })),
            Err(e) => {
                warn!(task_id = id, "dropping undecodable task: {}", e);
                sqlx::query("DELETE FROM identity_task WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl TaskSource for PgTaskSource {
    /// Polls until a task is available. Never reports the source closed.
    async fn next(&mut self) -> Result<Option<ClaimedTask>> {
        loop {
            if let Some(claimed) = self.claim().await? {
                return Ok(Some(claimed));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&mut self, claimed: &ClaimedTask) -> Result<()> {
        if let Some(id) = claimed.id {
            sqlx::query("DELETE FROM identity_task WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn fail(&mut self, claimed: &ClaimedTask, reason: &str) -> Result<()> {
        let Some(id) = claimed.id else {
            return Ok(());
        };
        if claimed.attempts >= MAX_ATTEMPTS {
            warn!(task_id = id, attempts = claimed.attempts, "task exhausted its attempts");
        }
        sqlx::query(
            r#"
            UPDATE identity_task
            SET last_error = $2, available_at = now() + $3 * INTERVAL '1 second'
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(RETRY_BACKOFF_SECS * claimed.attempts as f64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
