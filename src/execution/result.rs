//! Query Result - Standardized result format from the columnar executor

use crate::error::{ResolverError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Rows returned by one columnar query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names, in select order
    pub columns: Vec<String>,

    /// Row values, in store order
    pub rows: Vec<Vec<Value>>,

    /// Execution time in milliseconds
    pub execution_time_ms: u64,

    /// Executor that ran the query
    pub engine_name: String,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows,
            execution_time_ms: 0,
            engine_name: String::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// First column parsed as actor UUIDs.
    pub fn uuid_column(&self) -> Result<Vec<Uuid>> {
        self.rows
            .iter()
            .map(|row| {
                let cell = row.first().ok_or_else(|| {
                    ResolverError::Execution("Empty row in actor result".to_string())
                })?;
                parse_uuid(cell)
            })
            .collect()
    }

    /// Column `idx` as small integer arrays (retention appearances).
    pub fn flags_column(&self, idx: usize) -> Result<Vec<Vec<u8>>> {
        self.rows
            .iter()
            .map(|row| match row.get(idx) {
                Some(Value::Array(items)) => items.iter().map(|v| as_u64(v).map(|n| n as u8)).collect(),
                other => Err(ResolverError::Execution(format!(
                    "Expected array in column {}, got {:?}",
                    idx, other
                ))),
            })
            .collect()
    }

    /// `(name, count)` rows, e.g. value suggestions.
    pub fn name_counts(&self) -> Result<Vec<(String, u64)>> {
        self.rows
            .iter()
            .map(|row| {
                let name = match row.first() {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => {
                        return Err(ResolverError::Execution(
                            "Empty row in count result".to_string(),
                        ))
                    }
                };
                let count = row.get(1).map(as_u64).transpose()?.unwrap_or(0);
                Ok((name, count))
            })
            .collect()
    }
}

fn parse_uuid(cell: &Value) -> Result<Uuid> {
    match cell {
        Value::String(s) => Uuid::parse_str(s)
            .map_err(|e| ResolverError::Execution(format!("Invalid actor id '{}': {}", s, e))),
        other => Err(ResolverError::Execution(format!(
            "Invalid actor id {}",
            other
        ))),
    }
}

/// 64-bit integers arrive quoted from ClickHouse.
fn as_u64(value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| ResolverError::Execution(format!("Expected unsigned integer, got {}", n))),
        Value::String(s) => s
            .parse()
            .map_err(|_| ResolverError::Execution(format!("Expected unsigned integer, got '{}'", s))),
        other => Err(ResolverError::Execution(format!(
            "Expected unsigned integer, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quoted_counts_parse() {
        let result = QueryResult::new(
            vec!["value".into(), "count".into()],
            vec![vec![json!("\"pro\""), json!("12")], vec![json!("true"), json!(3)]],
        );
        let counts = result.name_counts().unwrap();
        assert_eq!(counts[0], ("\"pro\"".to_string(), 12));
        assert_eq!(counts[1].1, 3);
    }

    #[test]
    fn test_bad_uuid_is_execution_error() {
        let result = QueryResult::new(vec!["id".into()], vec![vec![json!("nope")]]);
        assert!(matches!(result.uuid_column(), Err(ResolverError::Execution(_))));
    }
}
