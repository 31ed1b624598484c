//! Person repository for PostgreSQL operations

use crate::actors::Actor;
use crate::error::{ResolverError, Result};
use crate::identity::graph::{plan_merge, plan_split};
use crate::store::{ActorLookup, ActorStore, MergeOutcome, NewActor, SplitOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

const PERSON_SELECT: &str = r#"
    SELECT p.id, p.uuid, p.team_id, p.properties, p.is_identified, p.created_at,
           ARRAY(
               SELECT d.distinct_id FROM posthog_persondistinctid d
               WHERE d.person_id = p.id ORDER BY d.id
           ) AS distinct_ids
    FROM posthog_person p
"#;

pub struct PgStore {
    pub(crate) pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn actor_from_row(row: &PgRow) -> Result<Actor> {
    let properties = match row.try_get::<Value, _>("properties")? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(Actor {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        team_id: row.try_get("team_id")?,
        properties,
        distinct_ids: row.try_get("distinct_ids")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        is_identified: row.try_get("is_identified")?,
    })
}

async fn find_actor(
    conn: &mut PgConnection,
    team_id: i64,
    lookup: ActorLookup,
    lock: bool,
) -> Result<Option<Actor>> {
    let filter = match lookup {
        ActorLookup::Id(_) => "WHERE p.team_id = $1 AND p.id = $2",
        ActorLookup::Uuid(_) => "WHERE p.team_id = $1 AND p.uuid = $2",
    };
    let sql = format!(
        "{} {}{}",
        PERSON_SELECT,
        filter,
        if lock { " FOR UPDATE" } else { "" }
    );
    let query = sqlx::query(&sql).bind(team_id);
    let query = match lookup {
        ActorLookup::Id(id) => query.bind(id),
        ActorLookup::Uuid(uuid) => query.bind(uuid),
    };
    match query.fetch_optional(&mut *conn).await? {
        Some(row) => Ok(Some(actor_from_row(&row)?)),
        None => Ok(None),
    }
}

async fn load_actor(
    conn: &mut PgConnection,
    team_id: i64,
    lookup: ActorLookup,
    lock: bool,
) -> Result<Actor> {
    find_actor(conn, team_id, lookup, lock)
        .await?
        .ok_or_else(|| ResolverError::NotFound(format!("person '{}'", lookup)))
}

async fn insert_person(conn: &mut PgConnection, team_id: i64, actor: &NewActor) -> Result<i64> {
    let person_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO posthog_person (uuid, team_id, properties, is_identified)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(actor.uuid.unwrap_or_else(Uuid::new_v4))
    .bind(team_id)
    .bind(Value::Object(actor.properties.clone()))
    .bind(actor.is_identified)
    .fetch_one(&mut *conn)
    .await?;

    for distinct_id in &actor.distinct_ids {
        sqlx::query(
            r#"
            INSERT INTO posthog_persondistinctid (team_id, person_id, distinct_id)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(team_id)
        .bind(person_id)
        .bind(distinct_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(person_id)
}

#[async_trait]
impl ActorStore for PgStore {
    async fn fetch_by_uuids(&self, team_id: i64, uuids: &[Uuid]) -> Result<Vec<Actor>> {
        if uuids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("{} WHERE p.team_id = $1 AND p.uuid = ANY($2)", PERSON_SELECT);
        let rows = sqlx::query(&sql)
            .bind(team_id)
            .bind(uuids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(actor_from_row).collect()
    }

    async fn get(&self, team_id: i64, lookup: ActorLookup) -> Result<Actor> {
        let mut conn = self.pool.acquire().await?;
        load_actor(&mut conn, team_id, lookup, false).await
    }

    async fn create(&self, team_id: i64, actor: NewActor) -> Result<Actor> {
        let mut tx = self.pool.begin().await?;
        let person_id = insert_person(&mut tx, team_id, &actor).await?;
        let created = load_actor(&mut tx, team_id, ActorLookup::Id(person_id), false).await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn delete(&self, team_id: i64, lookup: ActorLookup) -> Result<Actor> {
        let mut tx = self.pool.begin().await?;
        let actor = load_actor(&mut tx, team_id, lookup, true).await?;
        sqlx::query("DELETE FROM posthog_persondistinctid WHERE person_id = $1")
            .bind(actor.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM posthog_person WHERE id = $1")
            .bind(actor.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(actor)
    }

    async fn merge(&self, team_id: i64, target: ActorLookup, sources: &[Uuid]) -> Result<MergeOutcome> {
        let mut tx = self.pool.begin().await?;
        let target_before = load_actor(&mut tx, team_id, target, true).await?;

        // Lock sources in id order; restore request order afterwards.
        let sql = format!(
            "{} WHERE p.team_id = $1 AND p.uuid = ANY($2) ORDER BY p.id FOR UPDATE",
            PERSON_SELECT
        );
        let rows = sqlx::query(&sql)
            .bind(team_id)
            .bind(sources.to_vec())
            .fetch_all(&mut *tx)
            .await?;
        let mut locked: Vec<Actor> = rows.iter().map(actor_from_row).collect::<Result<_>>()?;
        let mut loaded = Vec::with_capacity(locked.len());
        for uuid in sources {
            if loaded.iter().any(|a: &Actor| a.uuid == *uuid) {
                continue;
            }
            let position = locked
                .iter()
                .position(|a| a.uuid == *uuid)
                .ok_or_else(|| ResolverError::NotFound(format!("person '{}'", uuid)))?;
            loaded.push(locked.swap_remove(position));
        }

        let plan = plan_merge(&target_before, &loaded)?;
        sqlx::query("UPDATE posthog_person SET properties = $1, version = version + 1 WHERE id = $2")
            .bind(Value::Object(plan.properties.clone()))
            .bind(plan.target_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE posthog_persondistinctid
            SET person_id = $1, version = version + 1
            WHERE person_id = ANY($2)
            "#,
        )
        .bind(plan.target_id)
        .bind(&plan.source_ids)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM posthog_person WHERE id = ANY($1)")
            .bind(&plan.source_ids)
            .execute(&mut *tx)
            .await?;

        let merged = load_actor(&mut tx, team_id, ActorLookup::Id(plan.target_id), false).await?;
        tx.commit().await?;
        debug!(team_id, target = plan.target_id, "merge committed");

        Ok(MergeOutcome {
            target_before,
            target: merged,
            sources: loaded,
            moved_distinct_ids: plan.moved_distinct_ids,
        })
    }

    async fn split(
        &self,
        team_id: i64,
        actor_id: i64,
        main_distinct_id: Option<&str>,
    ) -> Result<SplitOutcome> {
        let mut tx = self.pool.begin().await?;
        let actor = load_actor(&mut tx, team_id, ActorLookup::Id(actor_id), true).await?;
        let plan = plan_split(&actor, main_distinct_id)?;

        if plan.clear_properties {
            sqlx::query("UPDATE posthog_person SET properties = '{}', version = version + 1 WHERE id = $1")
                .bind(actor.id)
                .execute(&mut *tx)
                .await?;
        }

        let mut created = Vec::with_capacity(plan.seeds.len());
        for seed in &plan.seeds {
            sqlx::query(
                r#"
                INSERT INTO posthog_person (uuid, team_id, properties)
                VALUES ($1, $2, '{}')
                ON CONFLICT (team_id, uuid) DO NOTHING
                "#,
            )
            .bind(seed.uuid)
            .bind(team_id)
            .execute(&mut *tx)
            .await?;
            let person_id: i64 =
                sqlx::query_scalar("SELECT id FROM posthog_person WHERE team_id = $1 AND uuid = $2")
                    .bind(team_id)
                    .bind(seed.uuid)
                    .fetch_one(&mut *tx)
                    .await?;
            sqlx::query(
                r#"
                UPDATE posthog_persondistinctid
                SET person_id = $1, version = version + 1
                WHERE team_id = $2 AND distinct_id = $3
                "#,
            )
            .bind(person_id)
            .bind(team_id)
            .bind(&seed.distinct_id)
            .execute(&mut *tx)
            .await?;
            created.push(load_actor(&mut tx, team_id, ActorLookup::Id(person_id), false).await?);
        }

        let retained = load_actor(&mut tx, team_id, ActorLookup::Id(actor.id), false).await?;
        tx.commit().await?;
        Ok(SplitOutcome { retained, created })
    }
}
