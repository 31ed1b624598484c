//! ClickHouse executor over the HTTP interface

use crate::config::Settings;
use crate::error::{ResolverError, Result};
use crate::execution::{
    ColumnarExecutor, ExecutionContext, ExecutorCapabilities, IdentityIndex, QueryResult,
};
use crate::query::QueryPlan;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct ClickHouseExecutor {
    client: reqwest::Client,
    url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
    capabilities: ExecutorCapabilities,
}

impl ClickHouseExecutor {
    pub fn new(settings: &Settings) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: settings.clickhouse_url.trim_end_matches('/').to_string(),
            database: settings.clickhouse_database.clone(),
            user: settings.clickhouse_user.clone(),
            password: settings.clickhouse_password.clone(),
            capabilities: ExecutorCapabilities::clickhouse(),
        }
    }

    fn post(&self, args: &[(String, String)]) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(format!("{}/", self.url))
            .query(&[("database", self.database.as_str())])
            .query(args);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }
        request
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!("ClickHouse returned {}: {}", status, body.trim());
            return Err(ResolverError::Execution(format!(
                "ClickHouse returned {}: {}",
                status,
                body.trim()
            )));
        }
        Ok(body)
    }

    async fn insert_rows(&self, table: &str, columns: &str, rows: &[Value]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let body = rows
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        let query = format!("INSERT INTO {} ({}) FORMAT JSONEachRow", table, columns);
        let request = self.post(&[("query".to_string(), query)]).body(body);
        self.send(request).await?;
        Ok(())
    }
}

/// Decode a `JSONCompact` response body.
pub fn parse_compact(body: &str) -> Result<QueryResult> {
    let parsed: Value = serde_json::from_str(body)?;
    let columns = parsed["meta"]
        .as_array()
        .map(|meta| {
            meta.iter()
                .filter_map(|m| m["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let rows = match parsed.get("data") {
        Some(Value::Array(rows)) => rows
            .iter()
            .map(|row| match row {
                Value::Array(cells) => Ok(cells.clone()),
                other => Err(ResolverError::Execution(format!(
                    "Unexpected row shape {}",
                    other
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        _ => {
            return Err(ResolverError::Execution(
                "ClickHouse response has no data".to_string(),
            ))
        }
    };
    Ok(QueryResult::new(columns, rows))
}

#[async_trait]
impl ColumnarExecutor for ClickHouseExecutor {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    fn capabilities(&self) -> &ExecutorCapabilities {
        &self.capabilities
    }

    async fn execute(&self, plan: &QueryPlan, ctx: &ExecutionContext) -> Result<QueryResult> {
        let start = Instant::now();
        let mut args = plan.http_params();
        args.push(("default_format".to_string(), "JSONCompact".to_string()));
        args.push(("query_id".to_string(), ctx.query_tag.clone()));
        args.push((
            "max_execution_time".to_string(),
            (ctx.timeout_ms / 1000).max(1).to_string(),
        ));

        debug!(team_id = ctx.team_id, query_id = %ctx.query_tag, "executing columnar query");
        let body = self.send(self.post(&args).body(plan.sql.clone())).await?;

        let mut result = parse_compact(&body)?;
        result.execution_time_ms = start.elapsed().as_millis() as u64;
        result.engine_name = self.name().to_string();
        Ok(result)
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self.client.get(format!("{}/ping", self.url)).send().await?;
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl IdentityIndex for ClickHouseExecutor {
    async fn reassign(
        &self,
        team_id: i64,
        person_id: Uuid,
        distinct_ids: &[String],
        version: i64,
    ) -> Result<()> {
        let rows: Vec<Value> = distinct_ids
            .iter()
            .map(|distinct_id| {
                json!({
                    "team_id": team_id,
                    "distinct_id": distinct_id,
                    "person_id": person_id.to_string(),
                    "is_deleted": 0,
                    "version": version,
                })
            })
            .collect();
        self.insert_rows(
            "person_distinct_id2",
            "team_id, distinct_id, person_id, is_deleted, version",
            &rows,
        )
        .await
    }

    async fn remove(
        &self,
        team_id: i64,
        person_id: Uuid,
        distinct_ids: &[String],
        version: i64,
    ) -> Result<()> {
        let rows: Vec<Value> = distinct_ids
            .iter()
            .map(|distinct_id| {
                json!({
                    "team_id": team_id,
                    "distinct_id": distinct_id,
                    "person_id": person_id.to_string(),
                    "is_deleted": 1,
                    "version": version,
                })
            })
            .collect();
        self.insert_rows(
            "person_distinct_id2",
            "team_id, distinct_id, person_id, is_deleted, version",
            &rows,
        )
        .await?;
        let person = json!({
            "id": person_id.to_string(),
            "team_id": team_id,
            "properties": "{}",
            "is_deleted": 1,
            "version": version,
        });
        self.insert_rows("person", "id, team_id, properties, is_deleted, version", &[person])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact() {
        let body = r#"{
            "meta": [{"name": "person_id", "type": "UUID"}],
            "data": [["0178a3ab-d163-0000-4b55-bceadebb03fa"], ["0178a3ab-d163-0000-4b55-bceadebb03fb"]],
            "rows": 2
        }"#;
        let result = parse_compact(body).unwrap();
        assert_eq!(result.columns, vec!["person_id"]);
        assert_eq!(result.uuid_column().unwrap().len(), 2);
    }

    #[test]
    fn test_parse_compact_without_data() {
        assert!(parse_compact(r#"{"meta": []}"#).is_err());
    }
}
