//! Embedded relational store on SQLite
//!
//! Used for local development and tests. Same contract as the Postgres
//! store: every mutation is one transaction on the single connection.

use crate::activity::{ActivityLog, ActivityPage, ActivityQuery, ActivityRecord, Detail, UserRef};
use crate::actors::Actor;
use crate::error::{ResolverError, Result};
use crate::identity::graph::{plan_merge, plan_split};
use crate::store::{ActorLookup, ActorStore, MergeOutcome, NewActor, SplitOutcome};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

const PERSON_COLUMNS: &str = "id, uuid, team_id, properties, is_identified, created_at";

pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Connection::open(path.as_ref())?;
        Self::with_connection(db)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(db: Connection) -> Result<Self> {
        let store = Self { db: Mutex::new(db) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_conn(|db| {
            db.execute_batch(
                r#"
                PRAGMA foreign_keys = ON;

                CREATE TABLE IF NOT EXISTS person (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL,
                    team_id INTEGER NOT NULL,
                    properties TEXT NOT NULL DEFAULT '{}',
                    is_identified INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    version INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(team_id, uuid)
                );

                CREATE TABLE IF NOT EXISTS person_distinct_id (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    team_id INTEGER NOT NULL,
                    person_id INTEGER NOT NULL REFERENCES person(id) ON DELETE CASCADE,
                    distinct_id TEXT NOT NULL,
                    version INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(team_id, distinct_id)
                );

                CREATE INDEX IF NOT EXISTS idx_person_distinct_id_person
                    ON person_distinct_id(person_id);

                CREATE TABLE IF NOT EXISTS activity_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    team_id INTEGER NOT NULL,
                    organization_id TEXT NOT NULL,
                    user_json TEXT,
                    scope TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    activity TEXT NOT NULL,
                    detail TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_activity_log_scope
                    ON activity_log(team_id, scope, item_id);
                "#,
            )?;
            Ok(())
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut db)
    }
}

/// Fixed-width so text order is time order.
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ResolverError::Database(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| ResolverError::Database(format!("bad uuid '{}': {}", raw, e)))
}

/// Columns of `PERSON_COLUMNS`, before aliases are attached.
struct PersonRow {
    id: i64,
    uuid: String,
    team_id: i64,
    properties: String,
    is_identified: bool,
    created_at: String,
}

impl PersonRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            uuid: row.get(1)?,
            team_id: row.get(2)?,
            properties: row.get(3)?,
            is_identified: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_actor(self, distinct_ids: Vec<String>) -> Result<Actor> {
        let properties = match serde_json::from_str(&self.properties)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(Actor {
            id: self.id,
            uuid: parse_uuid(&self.uuid)?,
            team_id: self.team_id,
            properties,
            distinct_ids,
            created_at: parse_time(&self.created_at)?,
            is_identified: self.is_identified,
        })
    }
}

fn distinct_ids_for(db: &Connection, person_id: i64) -> Result<Vec<String>> {
    let mut stmt =
        db.prepare("SELECT distinct_id FROM person_distinct_id WHERE person_id = ?1 ORDER BY id")?;
    let ids = stmt
        .query_map(params![person_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

fn find_actor(db: &Connection, team_id: i64, lookup: ActorLookup) -> Result<Option<Actor>> {
    let row = match lookup {
        ActorLookup::Id(id) => db
            .query_row(
                &format!("SELECT {} FROM person WHERE team_id = ?1 AND id = ?2", PERSON_COLUMNS),
                params![team_id, id],
                PersonRow::from_row,
            )
            .optional()?,
        ActorLookup::Uuid(uuid) => db
            .query_row(
                &format!("SELECT {} FROM person WHERE team_id = ?1 AND uuid = ?2", PERSON_COLUMNS),
                params![team_id, uuid.to_string()],
                PersonRow::from_row,
            )
            .optional()?,
    };
    match row {
        Some(row) => {
            let distinct_ids = distinct_ids_for(db, row.id)?;
            Ok(Some(row.into_actor(distinct_ids)?))
        }
        None => Ok(None),
    }
}

fn load_actor(db: &Connection, team_id: i64, lookup: ActorLookup) -> Result<Actor> {
    find_actor(db, team_id, lookup)?
        .ok_or_else(|| ResolverError::NotFound(format!("person '{}'", lookup)))
}

fn insert_person(db: &Connection, team_id: i64, actor: &NewActor) -> Result<i64> {
    let uuid = actor.uuid.unwrap_or_else(Uuid::new_v4);
    db.execute(
        "INSERT INTO person (uuid, team_id, properties, is_identified, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            uuid.to_string(),
            team_id,
            Value::Object(actor.properties.clone()).to_string(),
            actor.is_identified,
            timestamp(Utc::now()),
        ],
    )?;
    let person_id = db.last_insert_rowid();
    for distinct_id in &actor.distinct_ids {
        db.execute(
            "INSERT INTO person_distinct_id (team_id, person_id, distinct_id) VALUES (?1, ?2, ?3)",
            params![team_id, person_id, distinct_id],
        )?;
    }
    Ok(person_id)
}

#[async_trait]
impl ActorStore for SqliteStore {
    async fn fetch_by_uuids(&self, team_id: i64, uuids: &[Uuid]) -> Result<Vec<Actor>> {
        if uuids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|db| {
            let placeholders = (0..uuids.len())
                .map(|i| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT {} FROM person WHERE team_id = ?1 AND uuid IN ({})",
                PERSON_COLUMNS, placeholders
            );
            let mut values = vec![SqlValue::Integer(team_id)];
            values.extend(uuids.iter().map(|u| SqlValue::Text(u.to_string())));

            let rows = {
                let mut stmt = db.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(values.iter()), PersonRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            rows.into_iter()
                .map(|row| {
                    let distinct_ids = distinct_ids_for(db, row.id)?;
                    row.into_actor(distinct_ids)
                })
                .collect()
        })
    }

    async fn get(&self, team_id: i64, lookup: ActorLookup) -> Result<Actor> {
        self.with_conn(|db| load_actor(db, team_id, lookup))
    }

    async fn create(&self, team_id: i64, actor: NewActor) -> Result<Actor> {
        self.with_conn(|db| {
            let tx = db.transaction()?;
            let person_id = insert_person(&tx, team_id, &actor)?;
            let created = load_actor(&tx, team_id, ActorLookup::Id(person_id))?;
            tx.commit()?;
            Ok(created)
        })
    }

    async fn delete(&self, team_id: i64, lookup: ActorLookup) -> Result<Actor> {
        self.with_conn(|db| {
            let tx = db.transaction()?;
            let actor = load_actor(&tx, team_id, lookup)?;
            tx.execute(
                "DELETE FROM person_distinct_id WHERE person_id = ?1",
                params![actor.id],
            )?;
            tx.execute("DELETE FROM person WHERE id = ?1", params![actor.id])?;
            tx.commit()?;
            Ok(actor)
        })
    }

    async fn merge(&self, team_id: i64, target: ActorLookup, sources: &[Uuid]) -> Result<MergeOutcome> {
        self.with_conn(|db| {
            let tx = db.transaction()?;
            let target_before = load_actor(&tx, team_id, target)?;
            let mut loaded = Vec::with_capacity(sources.len());
            for uuid in sources {
                let source = load_actor(&tx, team_id, ActorLookup::Uuid(*uuid))?;
                if !loaded.iter().any(|a: &Actor| a.id == source.id) {
                    loaded.push(source);
                }
            }

            let plan = plan_merge(&target_before, &loaded)?;
            tx.execute(
                "UPDATE person SET properties = ?1, version = version + 1 WHERE id = ?2",
                params![Value::Object(plan.properties.clone()).to_string(), plan.target_id],
            )?;
            for source_id in &plan.source_ids {
                tx.execute(
                    "UPDATE person_distinct_id SET person_id = ?1, version = version + 1 WHERE person_id = ?2",
                    params![plan.target_id, source_id],
                )?;
                tx.execute("DELETE FROM person WHERE id = ?1", params![source_id])?;
            }

            let merged = load_actor(&tx, team_id, ActorLookup::Id(plan.target_id))?;
            tx.commit()?;
            debug!(team_id, target = plan.target_id, "merge committed");
            Ok(MergeOutcome {
                target_before,
                target: merged,
                sources: loaded,
                moved_distinct_ids: plan.moved_distinct_ids,
            })
        })
    }

    async fn split(
        &self,
        team_id: i64,
        actor_id: i64,
        main_distinct_id: Option<&str>,
    ) -> Result<SplitOutcome> {
        self.with_conn(|db| {
            let tx = db.transaction()?;
            let actor = load_actor(&tx, team_id, ActorLookup::Id(actor_id))?;
            let plan = plan_split(&actor, main_distinct_id)?;

            if plan.clear_properties {
                tx.execute(
                    "UPDATE person SET properties = '{}', version = version + 1 WHERE id = ?1",
                    params![actor.id],
                )?;
            }

            let mut created = Vec::with_capacity(plan.seeds.len());
            for seed in &plan.seeds {
                let person_id = match find_actor(&tx, team_id, ActorLookup::Uuid(seed.uuid))? {
                    Some(existing) => existing.id,
                    None => insert_person(
                        &tx,
                        team_id,
                        &NewActor {
                            uuid: Some(seed.uuid),
                            ..Default::default()
                        },
                    )?,
                };
                tx.execute(
                    "UPDATE person_distinct_id SET person_id = ?1, version = version + 1 WHERE team_id = ?2 AND distinct_id = ?3",
                    params![person_id, team_id, seed.distinct_id],
                )?;
                created.push(load_actor(&tx, team_id, ActorLookup::Id(person_id))?);
            }

            let retained = load_actor(&tx, team_id, ActorLookup::Id(actor.id))?;
            tx.commit()?;
            Ok(SplitOutcome { retained, created })
        })
    }
}

struct ActivityRow {
    team_id: i64,
    organization_id: String,
    user: Option<String>,
    scope: String,
    item_id: String,
    activity: String,
    detail: String,
    created_at: String,
}

impl ActivityRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            team_id: row.get(0)?,
            organization_id: row.get(1)?,
            user: row.get(2)?,
            scope: row.get(3)?,
            item_id: row.get(4)?,
            activity: row.get(5)?,
            detail: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<ActivityRecord> {
        let user: Option<UserRef> = self.user.as_deref().map(serde_json::from_str).transpose()?;
        Ok(ActivityRecord {
            team_id: self.team_id,
            organization_id: parse_uuid(&self.organization_id)?,
            user,
            scope: self.scope,
            item_id: self.item_id,
            activity: self.activity,
            detail: serde_json::from_str::<Detail>(&self.detail)?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

#[async_trait]
impl ActivityLog for SqliteStore {
    async fn log(&self, record: ActivityRecord) -> Result<()> {
        let user = record.user.as_ref().map(serde_json::to_string).transpose()?;
        let detail = serde_json::to_string(&record.detail)?;
        self.with_conn(|db| {
            db.execute(
                r#"
                INSERT INTO activity_log
                (team_id, organization_id, user_json, scope, item_id, activity, detail, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    record.team_id,
                    record.organization_id.to_string(),
                    user,
                    record.scope,
                    record.item_id,
                    record.activity,
                    detail,
                    timestamp(record.created_at),
                ],
            )?;
            Ok(())
        })
    }

    async fn load(&self, query: &ActivityQuery) -> Result<ActivityPage> {
        self.with_conn(|db| {
            let item_filter = if query.item_id.is_some() { "AND item_id = ?3" } else { "" };
            let mut values = vec![
                SqlValue::Integer(query.team_id),
                SqlValue::Text(query.scope.clone()),
            ];
            if let Some(item_id) = &query.item_id {
                values.push(SqlValue::Text(item_id.clone()));
            }

            let total_count: i64 = db.query_row(
                &format!(
                    "SELECT COUNT(*) FROM activity_log WHERE team_id = ?1 AND scope = ?2 {}",
                    item_filter
                ),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )?;

            let sql = format!(
                r#"
                SELECT team_id, organization_id, user_json, scope, item_id, activity, detail, created_at
                FROM activity_log
                WHERE team_id = ?1 AND scope = ?2 {}
                ORDER BY created_at DESC, id DESC
                LIMIT {} OFFSET {}
                "#,
                item_filter,
                query.limit,
                query.offset()
            );
            let raw = {
                let mut stmt = db.prepare(&sql)?;
                let raw = stmt
                    .query_map(params_from_iter(values.iter()), ActivityRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                raw
            };
            let results = raw
                .into_iter()
                .map(ActivityRow::into_record)
                .collect::<Result<Vec<_>>>()?;

            Ok(ActivityPage {
                results,
                total_count: total_count.max(0) as u64,
                limit: query.limit,
                page: query.page,
            })
        })
    }
}
