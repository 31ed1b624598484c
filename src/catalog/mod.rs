//! Property definition catalog
//!
//! Lists the property names a team has ingested. Enterprise deployments keep
//! a second table of curated definitions; those shadow the base rows with the
//! same id.

pub mod query;

pub use query::{CatalogQuery, PgParam};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

const HIDDEN_LITERALS: [&str; 7] = [
    "distinct_id",
    "$set",
    "$set_once",
    "$groups",
    "$group_type",
    "$group_key",
    "$group_set",
];

/// Ingestion-generated property names never shown to users. Built once at
/// startup and passed to whatever needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiddenProperties {
    names: BTreeSet<String>,
}

impl HiddenProperties {
    /// Fixed names plus `$group_0` .. `$group_{group_types_limit - 1}`.
    pub fn new(group_types_limit: usize) -> Self {
        let names = HIDDEN_LITERALS
            .iter()
            .map(|s| s.to_string())
            .chain((0..group_types_limit).map(|i| format!("$group_{}", i)))
            .collect();
        Self { names }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub id: Uuid,
    pub name: String,
    pub is_numerical: bool,
    pub query_usage_30_day: Option<i64>,
    pub property_type: Option<String>,
    /// Only computed when the request names events
    pub is_event_property: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[async_trait]
pub trait PropertyCatalog: Send + Sync {
    /// One page of base definitions in catalog order.
    async fn search(&self, query: &CatalogQuery) -> Result<Vec<PropertyDefinition>>;

    /// Enterprise definitions for the given ids.
    async fn enterprise_definitions(&self, team_id: i64, ids: &[Uuid]) -> Result<Vec<PropertyDefinition>>;
}

/// Replace base rows with the enterprise row of the same id. Base order
/// and the per-request `is_event_property` are kept.
pub fn apply_overlay(
    base: Vec<PropertyDefinition>,
    enterprise: Vec<PropertyDefinition>,
) -> Vec<PropertyDefinition> {
    let mut by_id: HashMap<Uuid, PropertyDefinition> =
        enterprise.into_iter().map(|d| (d.id, d)).collect();
    base.into_iter()
        .map(|row| match by_id.remove(&row.id) {
            Some(mut shadow) => {
                shadow.is_event_property = row.is_event_property;
                shadow
            }
            None => row,
        })
        .collect()
}

/// Run a catalog search, overlaying enterprise definitions when available.
pub async fn list_definitions(
    catalog: &dyn PropertyCatalog,
    query: &CatalogQuery,
    use_enterprise: bool,
) -> Result<Vec<PropertyDefinition>> {
    let base = catalog.search(query).await?;
    if !use_enterprise || base.is_empty() {
        return Ok(base);
    }
    let ids: Vec<Uuid> = base.iter().map(|d| d.id).collect();
    let enterprise = catalog.enterprise_definitions(query.team_id, &ids).await?;
    Ok(apply_overlay(base, enterprise))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(id: Uuid, name: &str) -> PropertyDefinition {
        PropertyDefinition {
            id,
            name: name.to_string(),
            is_numerical: false,
            query_usage_30_day: None,
            property_type: None,
            is_event_property: Some(true),
            description: None,
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_hidden_group_family() {
        let hidden = HiddenProperties::new(3);
        assert!(hidden.contains("$group_2"));
        assert!(!hidden.contains("$group_3"));
        assert!(hidden.contains("distinct_id"));
        assert!(!hidden.contains("email"));
    }

    #[test]
    fn test_enterprise_row_shadows_base() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut curated = definition(b, "plan");
        curated.description = Some("Billing plan".to_string());
        curated.is_event_property = None;

        let merged = apply_overlay(vec![definition(a, "email"), definition(b, "plan")], vec![curated]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].name, "email");
        assert_eq!(merged[1].description.as_deref(), Some("Billing plan"));
        assert_eq!(merged[1].is_event_property, Some(true));
    }

    #[test]
    fn test_enterprise_orphans_ignored() {
        let merged = apply_overlay(
            vec![definition(Uuid::new_v4(), "email")],
            vec![definition(Uuid::new_v4(), "ghost")],
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name, "email");
    }
}
