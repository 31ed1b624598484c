//! Raw request parameters
//!
//! Query-string values arrive as strings (some of them JSON-encoded), body
//! values arrive as JSON. Body keys shadow query keys.

use crate::error::{ResolverError, Result};
use reqwest::Url;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestParams {
    query: BTreeMap<String, String>,
    body: Map<String, Value>,
}

impl RequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect the query string of an absolute request URL.
    pub fn from_url(url: &Url) -> Self {
        let query = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self {
            query,
            body: Map::new(),
        }
    }

    /// Wrap a JSON object, e.g. a nested filter payload.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(body) => Ok(Self {
                query: BTreeMap::new(),
                body,
            }),
            other => Err(ResolverError::validation(
                "Invalid parameter",
                format!("Expected a JSON object, got {}", other),
            )),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, key: impl Into<String>, value: Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    /// Merge a JSON body into these params; body keys take precedence.
    pub fn merge_body(mut self, body: Value) -> Result<Self> {
        match body {
            Value::Object(map) => {
                self.body.extend(map);
                Ok(self)
            }
            Value::Null => Ok(self),
            other => Err(ResolverError::validation(
                "Invalid body",
                format!("Expected a JSON object, got {}", other),
            )),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.body.contains_key(key) || self.query.contains_key(key)
    }

    /// Value for `key`, body first.
    pub fn raw(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.body.get(key) {
            if !v.is_null() {
                return Some(v.clone());
            }
        }
        self.query.get(key).map(|s| Value::String(s.clone()))
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.raw(key)? {
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Non-negative integer parameter. Non-numeric or negative input is a
    /// validation error, absence is `None`.
    pub fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        let Some(value) = self.raw(key) else {
            return Ok(None);
        };
        let parsed = match &value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) if s.trim().is_empty() => return Ok(None),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        match parsed {
            Some(n) if n >= 0 && n <= u32::MAX as i64 => Ok(Some(n as u32)),
            Some(_) => Err(ResolverError::validation(
                "Invalid parameter",
                format!("'{}' must not be negative", key),
            )),
            None => Err(ResolverError::validation(
                "Invalid parameter",
                format!("'{}' must be an integer, got {}", key, value),
            )),
        }
    }

    /// Signed integer parameter (funnel steps may be negative).
    pub fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        let Some(value) = self.raw(key) else {
            return Ok(None);
        };
        let parsed = match &value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) if s.trim().is_empty() => return Ok(None),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        parsed.map(Some).ok_or_else(|| {
            ResolverError::validation(
                "Invalid parameter",
                format!("'{}' must be an integer, got {}", key, value),
            )
        })
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.raw(key)? {
            Value::Bool(b) => Some(b),
            Value::String(s) => match s.to_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            Value::Number(n) => n.as_i64().map(|n| n != 0),
            _ => None,
        }
    }

    /// JSON parameter; string values are decoded as JSON.
    pub fn get_json(&self, key: &str) -> Result<Option<Value>> {
        match self.raw(key) {
            None => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => serde_json::from_str(&s).map(Some).map_err(|e| {
                ResolverError::validation(
                    "Invalid parameter",
                    format!("'{}' is not valid JSON: {}", key, e),
                )
            }),
            Some(other) => Ok(Some(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_body_shadows_query() {
        let params = RequestParams::new()
            .with_query("limit", "10")
            .with_body("limit", json!(20));
        assert_eq!(params.get_u32("limit").unwrap(), Some(20));
    }

    #[test]
    fn test_negative_and_garbage_limits_rejected() {
        let params = RequestParams::new().with_query("limit", "-1");
        assert!(matches!(
            params.get_u32("limit"),
            Err(ResolverError::Validation { .. })
        ));

        let params = RequestParams::new().with_query("offset", "ten");
        assert!(params.get_u32("offset").is_err());
    }

    #[test]
    fn test_json_encoded_query_value() {
        let params = RequestParams::new().with_query("events", r#"[{"id":"$pageview"}]"#);
        let events = params.get_json("events").unwrap().unwrap();
        assert_eq!(events[0]["id"], "$pageview");
    }
}
