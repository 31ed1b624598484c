//! Property definition reads on PostgreSQL

use crate::catalog::{CatalogQuery, PgParam, PropertyCatalog, PropertyDefinition};
use crate::error::Result;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn definition_from_row(row: &PgRow, enterprise: bool) -> Result<PropertyDefinition> {
    let usage: Option<i32> = row.try_get("query_usage_30_day")?;
    Ok(PropertyDefinition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        is_numerical: row.try_get("is_numerical")?,
        query_usage_30_day: usage.map(i64::from),
        property_type: row.try_get("property_type")?,
        is_event_property: if enterprise {
            None
        } else {
            row.try_get("is_event_property")?
        },
        description: if enterprise {
            row.try_get("description")?
        } else {
            None
        },
        tags: if enterprise {
            row.try_get("tags")?
        } else {
            Vec::new()
        },
    })
}

#[async_trait]
impl PropertyCatalog for PgCatalog {
    async fn search(&self, query: &CatalogQuery) -> Result<Vec<PropertyDefinition>> {
        let (sql, params) = query.render();
        let mut q = sqlx::query(&sql);
        for param in params {
            q = match param {
                PgParam::Int(v) => q.bind(v),
                PgParam::Text(v) => q.bind(v),
                PgParam::TextArray(v) => q.bind(v),
            };
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(|row| definition_from_row(row, false)).collect()
    }

    async fn enterprise_definitions(&self, team_id: i64, ids: &[Uuid]) -> Result<Vec<PropertyDefinition>> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.name, d.is_numerical, d.query_usage_30_day, d.property_type,
                   e.description, e.tags
            FROM ee_enterprisepropertydefinition e
            JOIN posthog_propertydefinition d ON d.id = e.propertydefinition_ptr_id
            WHERE d.team_id = $1 AND d.id = ANY($2)
            "#,
        )
        .bind(team_id)
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| definition_from_row(row, true)).collect()
    }
}
