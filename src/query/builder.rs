//! Parameterised ClickHouse query construction
//!
//! Literals never enter the SQL text: every value is bound through
//! [`QueryBuilder::bind`] and referenced as a `{name:Type}` placeholder, which
//! the HTTP interface fills from `param_<name>` arguments.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// A bound query parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlParam {
    String(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    DateTime(DateTime<Utc>),
    StringArray(Vec<String>),
    UIntArray(Vec<u64>),
}

impl SqlParam {
    /// ClickHouse type used in the placeholder.
    pub fn clickhouse_type(&self) -> &'static str {
        match self {
            SqlParam::String(_) => "String",
            SqlParam::Int(_) => "Int64",
            SqlParam::UInt(_) => "UInt64",
            SqlParam::Float(_) => "Float64",
            SqlParam::DateTime(_) => "DateTime",
            SqlParam::StringArray(_) => "Array(String)",
            SqlParam::UIntArray(_) => "Array(UInt64)",
        }
    }

    /// Text form sent as the `param_<name>` argument.
    pub fn render(&self) -> String {
        match self {
            SqlParam::String(s) => s.clone(),
            SqlParam::Int(n) => n.to_string(),
            SqlParam::UInt(n) => n.to_string(),
            SqlParam::Float(f) => f.to_string(),
            SqlParam::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            SqlParam::StringArray(items) => {
                let quoted: Vec<String> = items.iter().map(|s| quote(s)).collect();
                format!("[{}]", quoted.join(","))
            }
            SqlParam::UIntArray(items) => {
                let rendered: Vec<String> = items.iter().map(|n| n.to_string()).collect();
                format!("[{}]", rendered.join(","))
            }
        }
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl From<&str> for SqlParam {
    fn from(s: &str) -> Self {
        SqlParam::String(s.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(s: String) -> Self {
        SqlParam::String(s)
    }
}

impl From<i64> for SqlParam {
    fn from(n: i64) -> Self {
        SqlParam::Int(n)
    }
}

impl From<u32> for SqlParam {
    fn from(n: u32) -> Self {
        SqlParam::UInt(n as u64)
    }
}

impl From<u64> for SqlParam {
    fn from(n: u64) -> Self {
        SqlParam::UInt(n)
    }
}

impl From<f64> for SqlParam {
    fn from(f: f64) -> Self {
        SqlParam::Float(f)
    }
}

impl From<DateTime<Utc>> for SqlParam {
    fn from(dt: DateTime<Utc>) -> Self {
        SqlParam::DateTime(dt)
    }
}

impl From<Vec<String>> for SqlParam {
    fn from(items: Vec<String>) -> Self {
        SqlParam::StringArray(items)
    }
}

/// An executable query: SQL text plus its bound parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub sql: String,
    pub params: BTreeMap<String, SqlParam>,
    /// Rows requested from the store (page limit, plus one when probing).
    pub fetch_limit: u32,
}

impl QueryPlan {
    /// Arguments for the ClickHouse HTTP interface.
    pub fn http_params(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(name, value)| (format!("param_{}", name), value.render()))
            .collect()
    }
}

/// Accumulates bound parameters. Nested sub-plans share one builder so their
/// placeholders never collide.
#[derive(Debug, Default)]
pub struct QueryBuilder {
    params: BTreeMap<String, SqlParam>,
    counter: usize,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `value` and return its placeholder.
    pub fn bind(&mut self, value: impl Into<SqlParam>) -> String {
        let value = value.into();
        let name = format!("p{}", self.counter);
        self.counter += 1;
        let placeholder = format!("{{{}:{}}}", name, value.clickhouse_type());
        self.params.insert(name, value);
        placeholder
    }

    /// Append `LIMIT`/`OFFSET` to `sql` and finish the plan.
    pub fn paged(mut self, sql: String, fetch_limit: u32, offset: u32) -> QueryPlan {
        let limit = self.bind(fetch_limit);
        let offset = self.bind(offset);
        QueryPlan {
            sql: format!("{}\nLIMIT {} OFFSET {}", sql.trim_end(), limit, offset),
            params: self.params,
            fetch_limit,
        }
    }

    /// Finish a plan that carries its own limit.
    pub fn finish(self, sql: String, fetch_limit: u32) -> QueryPlan {
        QueryPlan {
            sql,
            params: self.params,
            fetch_limit,
        }
    }
}
