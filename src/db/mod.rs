//! Relational store implementations
//!
//! Postgres (sqlx) for deployments, SQLite (rusqlite) for local runs and tests.

pub mod activity_repo;
pub mod catalog_repo;
pub mod connection;
pub mod person_repo;
pub mod sqlite;
pub mod task_repo;

pub use catalog_repo::PgCatalog;
pub use connection::{init_pool, run_migrations, DbPool};
pub use person_repo::PgStore;
pub use sqlite::SqliteStore;
pub use task_repo::{PgTaskQueue, PgTaskSource};
