//! Runtime settings loaded from environment variables.

use std::env;
use std::time::Duration;

/// Page size used when a request does not specify one.
pub const DEFAULT_LIMIT: u32 = 100;

/// Page size forced for bulk (CSV) exports; also the hard cap for any page.
pub const CSV_EXPORT_LIMIT: u32 = 5000;

/// Number of group types a team may define (`$group_0` .. `$group_{N-1}`).
pub const GROUP_TYPES_LIMIT: usize = 5;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Postgres connection string for the relational store
    pub database_url: String,

    /// Max connections held by the Postgres pool
    pub db_max_connections: u32,

    /// ClickHouse HTTP interface
    pub clickhouse_url: String,
    pub clickhouse_database: String,
    pub clickhouse_user: Option<String>,
    pub clickhouse_password: Option<String>,

    /// Deadline for a single columnar query
    pub query_timeout: Duration,

    /// How long cached funnel/path actor lists stay fresh
    pub result_cache_ttl: Duration,

    pub default_limit: u32,
    pub csv_export_limit: u32,
    pub group_types_limit: usize,

    /// Enterprise deployment (enables funnel correlation actors, taxonomy overlay)
    pub ee_available: bool,

    /// Capture endpoint for internal `$set` / `$delete_person_property` events
    pub capture_url: Option<String>,
    pub capture_api_key: Option<String>,

    /// Poll interval for the Postgres-backed task queue
    pub task_poll_interval: Duration,
}

impl Settings {
    /// Load settings from the process environment.
    ///
    /// Call `dotenv::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/people".to_string()),
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", 10),
            clickhouse_url: env::var("CLICKHOUSE_URL")
                .unwrap_or_else(|_| "http://localhost:8123".to_string()),
            clickhouse_database: env::var("CLICKHOUSE_DATABASE")
                .unwrap_or_else(|_| "default".to_string()),
            clickhouse_user: env::var("CLICKHOUSE_USER").ok(),
            clickhouse_password: env::var("CLICKHOUSE_PASSWORD").ok(),
            query_timeout: Duration::from_secs(parse_env("QUERY_TIMEOUT_SECS", 60)),
            result_cache_ttl: Duration::from_secs(parse_env("RESULT_CACHE_TTL_SECS", 900)),
            default_limit: parse_env("DEFAULT_PAGE_LIMIT", DEFAULT_LIMIT),
            csv_export_limit: parse_env("CSV_EXPORT_LIMIT", CSV_EXPORT_LIMIT),
            group_types_limit: parse_env("GROUP_TYPES_LIMIT", GROUP_TYPES_LIMIT),
            ee_available: parse_env("EE_AVAILABLE", false),
            capture_url: env::var("CAPTURE_URL").ok(),
            capture_api_key: env::var("CAPTURE_API_KEY").ok(),
            task_poll_interval: Duration::from_millis(parse_env("TASK_POLL_INTERVAL_MS", 1000)),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/people".to_string(),
            db_max_connections: 10,
            clickhouse_url: "http://localhost:8123".to_string(),
            clickhouse_database: "default".to_string(),
            clickhouse_user: None,
            clickhouse_password: None,
            query_timeout: Duration::from_secs(60),
            result_cache_ttl: Duration::from_secs(900),
            default_limit: DEFAULT_LIMIT,
            csv_export_limit: CSV_EXPORT_LIMIT,
            group_types_limit: GROUP_TYPES_LIMIT,
            ee_available: false,
            capture_url: None,
            capture_api_key: None,
            task_poll_interval: Duration::from_millis(1000),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.default_limit, 100);
        assert_eq!(settings.csv_export_limit, 5000);
        assert_eq!(settings.group_types_limit, 5);
        assert!(!settings.ee_available);
    }

    #[test]
    fn test_parse_env_falls_back_on_garbage() {
        std::env::set_var("PEOPLE_RESOLVER_TEST_KNOB", "not-a-number");
        assert_eq!(parse_env("PEOPLE_RESOLVER_TEST_KNOB", 7u64), 7);
        std::env::remove_var("PEOPLE_RESOLVER_TEST_KNOB");
    }
}
