//! Property definition listing

use super::{Reply, RequestContext};
use crate::catalog::{list_definitions, CatalogQuery, HiddenProperties, PropertyCatalog, PropertyDefinition};
use crate::config::Settings;
use crate::error::Result;
use crate::pagination::catalog_links;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefinitionPage {
    pub next: Option<String>,
    pub previous: Option<String>,
    pub results: Vec<PropertyDefinition>,
}

pub struct PropertyDefinitionService {
    catalog: Arc<dyn PropertyCatalog>,
    hidden: HiddenProperties,
    default_limit: u32,
    use_enterprise: bool,
}

impl PropertyDefinitionService {
    pub fn new(settings: &Settings, catalog: Arc<dyn PropertyCatalog>) -> Self {
        Self {
            catalog,
            hidden: HiddenProperties::new(settings.group_types_limit),
            default_limit: settings.default_limit,
            use_enterprise: settings.ee_available,
        }
    }

    pub async fn list(&self, ctx: &RequestContext) -> Result<Reply<DefinitionPage>> {
        let query = CatalogQuery::from_params(&ctx.params, ctx.team_id(), &self.hidden, self.default_limit)?;
        let results = list_definitions(self.catalog.as_ref(), &query, self.use_enterprise).await?;
        let links = catalog_links(&ctx.url, query.offset, query.limit, results.len())?;
        Ok(Reply::ok(DefinitionPage {
            next: links.next,
            previous: links.previous,
            results,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::TeamScope;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingCatalog {
        seen: Mutex<Vec<CatalogQuery>>,
        rows: Vec<PropertyDefinition>,
    }

    #[async_trait]
    impl PropertyCatalog for RecordingCatalog {
        async fn search(&self, query: &CatalogQuery) -> Result<Vec<PropertyDefinition>> {
            self.seen.lock().unwrap().push(query.clone());
            Ok(self.rows.clone())
        }

        async fn enterprise_definitions(&self, _team_id: i64, _ids: &[Uuid]) -> Result<Vec<PropertyDefinition>> {
            Ok(Vec::new())
        }
    }

    fn definition(name: &str) -> PropertyDefinition {
        PropertyDefinition {
            id: Uuid::new_v4(),
            name: name.to_string(),
            is_numerical: false,
            query_usage_30_day: None,
            property_type: None,
            is_event_property: None,
            description: None,
            tags: Vec::new(),
        }
    }

    fn context(url: &str) -> RequestContext {
        let team = TeamScope {
            team_id: 7,
            organization_id: Uuid::nil(),
        };
        RequestContext::new(team, None, url, None).unwrap()
    }

    #[tokio::test]
    async fn test_list_hides_internal_properties_and_links() {
        let catalog = Arc::new(RecordingCatalog {
            rows: vec![definition("$browser"), definition("plan")],
            ..Default::default()
        });
        let service = PropertyDefinitionService::new(&Settings::default(), catalog.clone());

        let reply = service
            .list(&context("http://localhost/api/projects/7/property_definitions/?limit=2&offset=2"))
            .await
            .unwrap();
        let page = reply.body.unwrap();
        assert_eq!(page.results.len(), 2);
        assert_eq!(
            page.next.as_deref(),
            Some("http://localhost/api/projects/7/property_definitions/?limit=2&offset=4")
        );
        assert_eq!(
            page.previous.as_deref(),
            Some("http://localhost/api/projects/7/property_definitions/?limit=2")
        );

        let seen = catalog.seen.lock().unwrap();
        assert_eq!(seen[0].team_id, 7);
        assert!(seen[0].excluded.iter().any(|name| name == "$group_4"));
    }

    #[tokio::test]
    async fn test_empty_page_has_no_next() {
        let catalog = Arc::new(RecordingCatalog::default());
        let service = PropertyDefinitionService::new(&Settings::default(), catalog);
        let page = service
            .list(&context("http://localhost/api/projects/7/property_definitions/"))
            .await
            .unwrap()
            .body
            .unwrap();
        assert!(page.next.is_none());
        assert!(page.previous.is_none());
    }
}
