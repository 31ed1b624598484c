//! Activity log persistence on PostgreSQL

use super::person_repo::PgStore;
use crate::activity::{ActivityLog, ActivityPage, ActivityQuery, ActivityRecord, Detail, UserRef};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

fn record_from_row(row: &PgRow) -> Result<ActivityRecord> {
    let user: Option<Value> = row.try_get("user_json")?;
    let user: Option<UserRef> = user.map(serde_json::from_value).transpose()?;
    let detail: Detail = serde_json::from_value(row.try_get::<Value, _>("detail")?)?;
    Ok(ActivityRecord {
        team_id: row.try_get("team_id")?,
        organization_id: row.try_get::<Uuid, _>("organization_id")?,
        user,
        scope: row.try_get("scope")?,
        item_id: row.try_get("item_id")?,
        activity: row.try_get("activity")?,
        detail,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

#[async_trait]
impl ActivityLog for PgStore {
    async fn log(&self, record: ActivityRecord) -> Result<()> {
        let user = record.user.as_ref().map(serde_json::to_value).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO posthog_activitylog
            (team_id, organization_id, user_json, scope, item_id, activity, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.team_id)
        .bind(record.organization_id)
        .bind(user)
        .bind(&record.scope)
        .bind(&record.item_id)
        .bind(&record.activity)
        .bind(serde_json::to_value(&record.detail)?)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, query: &ActivityQuery) -> Result<ActivityPage> {
        let total_count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM posthog_activitylog
            WHERE team_id = $1 AND scope = $2 AND ($3::text IS NULL OR item_id = $3)
            "#,
        )
        .bind(query.team_id)
        .bind(&query.scope)
        .bind(query.item_id.as_deref())
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT team_id, organization_id, user_json, scope, item_id, activity, detail, created_at
            FROM posthog_activitylog
            WHERE team_id = $1 AND scope = $2 AND ($3::text IS NULL OR item_id = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(query.team_id)
        .bind(&query.scope)
        .bind(query.item_id.as_deref())
        .bind(query.limit as i64)
        .bind(query.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(ActivityPage {
            results: rows.iter().map(record_from_row).collect::<Result<Vec<_>>>()?,
            total_count: total_count.max(0) as u64,
            limit: query.limit,
            page: query.page,
        })
    }
}
