//! Person endpoints
//!
//! Each method is one endpoint: parse the request into a [`Filter`], pick an
//! [`ActorMode`], resolve one page of ids against the columnar store,
//! materialize them from the relational store and attach pagination links.

use super::{Reply, RequestContext, Success};
use crate::activity::{ActivityLog, ActivityQuery, ActivityRecord, PERSON_SCOPE};
use crate::actors::{render_csv, Materializer, SerializedActor};
use crate::cache::{cache_key, SingleFlightCache};
use crate::config::Settings;
use crate::error::{ResolverError, Result};
use crate::events::EventSink;
use crate::filter::{ExportFormat, Filter, InsightKind};
use crate::identity::IdentityCoordinator;
use crate::pagination::{activity_links, initial_url, next_offset, offset_url, page_links};
use crate::resolver::{ActorMode, ActorResolver, CapabilityCheck};
use crate::store::{ActorLookup, ActorStore};
use crate::tasks::TaskQueue;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActorPage {
    pub results: Vec<SerializedActor>,
    pub next: Option<String>,
    pub previous: Option<String>,
}

/// List body: a JSON page, or the CSV document of a bulk export.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ListBody {
    Page(ActorPage),
    Csv(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeopleGroup {
    pub people: Vec<SerializedActor>,
    pub count: usize,
}

impl PeopleGroup {
    fn new(people: Vec<SerializedActor>) -> Self {
        Self {
            count: people.len(),
            people,
        }
    }
}

/// Funnel and path actors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActorsResponse {
    pub results: Vec<PeopleGroup>,
    pub next: Option<String>,
    pub initial: String,
    pub is_cached: bool,
    pub last_refresh: DateTime<Utc>,
}

/// Lifecycle and stickiness actors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeopleResponse {
    pub results: Vec<PeopleGroup>,
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RetentionEntry {
    Actor(SerializedActor),
    InPeriod {
        person: SerializedActor,
        appearances: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionResponse {
    pub result: Vec<RetentionEntry>,
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueCount {
    pub name: Value,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyCount {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityResponse {
    pub results: Vec<ActivityRecord>,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub total_count: u64,
}

/// Cached part of a funnel/path response.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPage {
    pub people: Vec<SerializedActor>,
    pub next: Option<String>,
    pub initial: String,
}

pub struct PersonService {
    resolver: ActorResolver,
    materializer: Materializer,
    store: Arc<dyn ActorStore>,
    activity: Arc<dyn ActivityLog>,
    coordinator: IdentityCoordinator,
    capabilities: Arc<dyn CapabilityCheck>,
    cache: SingleFlightCache<CachedPage>,
    default_limit: u32,
    csv_export_limit: u32,
}

impl PersonService {
    pub fn new(
        settings: &Settings,
        resolver: ActorResolver,
        store: Arc<dyn ActorStore>,
        activity: Arc<dyn ActivityLog>,
        tasks: Arc<dyn TaskQueue>,
        events: Arc<dyn EventSink>,
        capabilities: Arc<dyn CapabilityCheck>,
    ) -> Self {
        Self {
            resolver,
            materializer: Materializer::new(store.clone()),
            coordinator: IdentityCoordinator::new(store.clone(), activity.clone(), tasks, events),
            store,
            activity,
            capabilities,
            cache: SingleFlightCache::new(settings.result_cache_ttl),
            default_limit: settings.default_limit,
            csv_export_limit: settings.csv_export_limit,
        }
    }

    fn filter(&self, ctx: &RequestContext, insight: InsightKind, format: ExportFormat) -> Result<Filter> {
        Ok(Filter::from_params(&ctx.params, ctx.team_id(), insight, ctx.now)?.with_limits(
            format,
            self.default_limit,
            self.csv_export_limit,
        ))
    }

    /// Resolve and materialize one page. The `next` link is computed from the
    /// resolved id count, before actors missing from the relational store
    /// are dropped.
    async fn people_page(
        &self,
        ctx: &RequestContext,
        filter: &Filter,
        mode: ActorMode,
    ) -> Result<(Vec<SerializedActor>, Option<String>)> {
        let resolved = self.resolver.resolve(filter, mode).await?;
        let people = self.materializer.serialized(ctx.team_id(), &resolved.ids).await?;
        let page = filter.page();
        let next = next_offset(resolved.ids.len(), page.offset, page.limit)
            .map(|offset| offset_url(&ctx.url, offset, page.limit))
            .transpose()?;
        Ok((people, next))
    }

    pub async fn list(&self, ctx: &RequestContext) -> Result<Reply<ListBody>> {
        let format = ExportFormat::from_params(&ctx.params);
        let filter = self.filter(ctx, InsightKind::Trends, format)?;
        let resolved = self.resolver.resolve(&filter, ActorMode::Plain).await?;
        let people = self.materializer.serialized(ctx.team_id(), &resolved.ids).await?;

        if format == ExportFormat::Csv {
            return Ok(Reply::ok(ListBody::Csv(render_csv(&people)?)));
        }
        let page = filter.page();
        let links = page_links(&ctx.url, page.offset, page.limit, resolved.ids.len())?;
        Ok(Reply::ok(ListBody::Page(ActorPage {
            results: people,
            next: links.next,
            previous: links.previous,
        })))
    }

    pub async fn destroy(&self, ctx: &RequestContext, id: &str) -> Result<Reply<()>> {
        let lookup = ActorLookup::parse(id)?;
        self.coordinator.delete(&ctx.audit(), lookup).await?;
        Ok(Reply::no_content())
    }

    pub async fn funnel(&self, ctx: &RequestContext) -> Result<Reply<ActorsResponse>> {
        let filter = self.filter(ctx, InsightKind::Funnels, ExportFormat::Json)?;
        let mode = ActorMode::for_funnel(&filter, self.capabilities.as_ref())?;
        self.cached_actors(ctx, &filter, mode).await
    }

    pub async fn path(&self, ctx: &RequestContext) -> Result<Reply<ActorsResponse>> {
        let filter = self.filter(ctx, InsightKind::Paths, ExportFormat::Json)?;
        self.cached_actors(ctx, &filter, ActorMode::Path).await
    }

    async fn cached_actors(
        &self,
        ctx: &RequestContext,
        filter: &Filter,
        mode: ActorMode,
    ) -> Result<Reply<ActorsResponse>> {
        let key = cache_key(ctx.team_id(), mode.as_str(), filter)?;
        let cached = self
            .cache
            .get_or_compute(&key, filter.refresh(), move || async move {
                let (people, next) = self.people_page(ctx, filter, mode).await?;
                Ok(CachedPage {
                    people,
                    next,
                    initial: initial_url(&ctx.url, filter.page().limit)?,
                })
            })
            .await?;
        debug!(key = key.as_str(), is_cached = cached.is_cached, "actor page");

        let CachedPage {
            people,
            next,
            initial,
        } = cached.value;
        Ok(Reply::ok(ActorsResponse {
            results: vec![PeopleGroup::new(people)],
            next,
            initial,
            is_cached: cached.is_cached,
            last_refresh: cached.last_refresh,
        }))
    }

    /// Most common values of the `key` property, optionally narrowed by a
    /// `value` prefix. No key means no suggestions.
    pub async fn values(&self, ctx: &RequestContext) -> Result<Reply<Vec<ValueCount>>> {
        let Some(key) = ctx.params.get_str("key") else {
            return Ok(Reply::ok(Vec::new()));
        };
        let prefix = ctx.params.get_str("value");
        let rows = self
            .resolver
            .property_values(ctx.team_id(), &key, prefix.as_deref())
            .await?;
        Ok(Reply::ok(
            rows.into_iter()
                .map(|(raw, count)| ValueCount {
                    name: display_value(&raw),
                    count,
                })
                .collect(),
        ))
    }

    pub async fn properties(&self, ctx: &RequestContext) -> Result<Reply<Vec<PropertyCount>>> {
        let counts = self.resolver.property_counts(ctx.team_id()).await?;
        Ok(Reply::ok(
            counts
                .into_iter()
                .map(|(name, count)| PropertyCount { name, count })
                .collect(),
        ))
    }

    /// Merge the actors named in `uuids` into actor `id`.
    pub async fn merge(&self, ctx: &RequestContext, id: &str) -> Result<Reply<SerializedActor>> {
        let target = ActorLookup::parse(id)?;
        let sources = match ctx.params.get_json("uuids")? {
            Some(Value::Array(items)) => items.iter().map(parse_uuid).collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(ResolverError::validation(
                    "Invalid parameter",
                    "'uuids' must be a list of person uuids",
                ))
            }
            None => return Err(ResolverError::missing_parameter("uuids")),
        };
        let merged = self.coordinator.merge(&ctx.audit(), target, &sources).await?;
        Ok(Reply::created(merged.serialize()))
    }

    pub async fn split(&self, ctx: &RequestContext, id: &str) -> Result<Reply<Success>> {
        let lookup = ActorLookup::parse(id)?;
        let main_distinct_id = ctx.params.get_str("main_distinct_id");
        self.coordinator.split(&ctx.audit(), lookup, main_distinct_id).await?;
        Ok(Reply::created(Success::new()))
    }

    pub async fn delete_property(&self, ctx: &RequestContext, id: &str) -> Result<Reply<Success>> {
        let lookup = ActorLookup::parse(id)?;
        let key = ctx
            .params
            .get_str("$unset")
            .ok_or_else(|| ResolverError::missing_parameter("$unset"))?;
        self.coordinator.delete_property(&ctx.audit(), lookup, &key).await?;
        Ok(Reply::created(Success::new()))
    }

    /// Replace the property set of actor `id`.
    pub async fn update(&self, ctx: &RequestContext, id: &str) -> Result<Reply<()>> {
        let lookup = ActorLookup::parse(id)?;
        let properties = match ctx.params.get_json("properties")? {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(ResolverError::validation(
                    "Invalid parameter",
                    "'properties' must be an object",
                ))
            }
            None => return Err(ResolverError::missing_parameter("properties")),
        };
        self.coordinator.update(&ctx.audit(), lookup, properties).await?;
        Ok(Reply::no_content())
    }

    pub async fn lifecycle(&self, ctx: &RequestContext) -> Result<Reply<PeopleResponse>> {
        let filter = self.filter(ctx, InsightKind::Lifecycle, ExportFormat::Json)?;
        let (people, next) = self.people_page(ctx, &filter, ActorMode::Lifecycle).await?;
        Ok(Reply::ok(PeopleResponse {
            results: vec![PeopleGroup::new(people)],
            next,
        }))
    }

    pub async fn stickiness(&self, ctx: &RequestContext) -> Result<Reply<PeopleResponse>> {
        let filter = self.filter(ctx, InsightKind::Stickiness, ExportFormat::Json)?;
        let (people, next) = self.people_page(ctx, &filter, ActorMode::Stickiness).await?;
        Ok(Reply::ok(PeopleResponse {
            results: vec![PeopleGroup::new(people)],
            next,
        }))
    }

    /// Retention actors. With the table display each actor carries its
    /// per-period appearance flags.
    pub async fn retention(&self, ctx: &RequestContext) -> Result<Reply<RetentionResponse>> {
        let filter = self.filter(ctx, InsightKind::Retention, ExportFormat::Json)?;
        let mode = ActorMode::for_retention(&filter);
        let resolved = self.resolver.resolve(&filter, mode).await?;
        let people = self.materializer.serialized(ctx.team_id(), &resolved.ids).await?;
        let page = filter.page();
        let next = next_offset(resolved.ids.len(), page.offset, page.limit)
            .map(|offset| offset_url(&ctx.url, offset, page.limit))
            .transpose()?;

        let result = match resolved.appearances {
            Some(flags) => {
                let mut by_uuid: HashMap<Uuid, Vec<u8>> = HashMap::with_capacity(flags.len());
                for (uuid, appearances) in resolved.ids.iter().zip(flags) {
                    by_uuid.entry(*uuid).or_insert(appearances);
                }
                people
                    .into_iter()
                    .map(|person| RetentionEntry::InPeriod {
                        appearances: by_uuid.remove(&person.uuid).unwrap_or_default(),
                        person,
                    })
                    .collect()
            }
            None => people.into_iter().map(RetentionEntry::Actor).collect(),
        };
        Ok(Reply::ok(RetentionResponse { result, next }))
    }

    /// Person activity across the team.
    pub async fn all_activity(&self, ctx: &RequestContext) -> Result<Reply<ActivityResponse>> {
        self.activity_page(ctx, None).await
    }

    /// Activity of one actor; 404 when the actor does not exist.
    pub async fn activity(&self, ctx: &RequestContext, id: &str) -> Result<Reply<ActivityResponse>> {
        let lookup = ActorLookup::parse(id)?;
        let actor = self.store.get(ctx.team_id(), lookup).await?;
        self.activity_page(ctx, Some(actor.id.to_string())).await
    }

    async fn activity_page(&self, ctx: &RequestContext, item_id: Option<String>) -> Result<Reply<ActivityResponse>> {
        let limit = ctx.params.get_u32("limit")?.unwrap_or(ActivityQuery::DEFAULT_LIMIT);
        let page = ctx.params.get_u32("page")?.unwrap_or(1);
        let query = ActivityQuery::new(PERSON_SCOPE, ctx.team_id(), item_id, limit, page)?;
        let loaded = self.activity.load(&query).await?;
        let links = activity_links(
            &ctx.url,
            loaded.page,
            loaded.limit,
            loaded.has_next(),
            loaded.has_previous(),
        )?;
        Ok(Reply::ok(ActivityResponse {
            next: links.next,
            previous: links.previous,
            total_count: loaded.total_count,
            results: loaded.results,
        }))
    }
}

fn parse_uuid(value: &Value) -> Result<Uuid> {
    value
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| ResolverError::validation("Invalid parameter", format!("'{}' is not a person uuid", value)))
}

/// Stored property values arrive as raw JSON text. Booleans display as
/// `"true"`/`"false"`, objects and lists as their key-sorted JSON text, other
/// JSON values decoded. Text that is not JSON is shown as is.
pub fn display_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Bool(b)) => Value::String(b.to_string()),
        // serde_json maps are ordered by key
        Ok(v @ (Value::Object(_) | Value::Array(_))) => Value::String(v.to_string()),
        Ok(v) => v,
        Err(_) => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_display_value_decodes_json() {
        assert_eq!(display_value("\"chrome\""), json!("chrome"));
        assert_eq!(display_value("42"), json!(42));
        assert_eq!(display_value("true"), json!("true"));
        assert_eq!(display_value(r#"{"b":1,"a":2}"#), json!(r#"{"a":2,"b":1}"#));
        assert_eq!(display_value("[1, 2]"), json!("[1,2]"));
        assert_eq!(display_value("not json"), json!("not json"));
    }

    #[test]
    fn test_parse_uuid_rejects_garbage() {
        assert!(parse_uuid(&json!("00000000-0000-0000-0000-000000000001")).is_ok());
        assert!(matches!(
            parse_uuid(&json!(12)),
            Err(ResolverError::Validation { .. })
        ));
    }

    #[test]
    fn test_retention_entry_shapes() {
        let person = SerializedActor {
            id: 1,
            uuid: Uuid::nil(),
            name: "alice".into(),
            distinct_ids: vec!["alice".into()],
            properties: Default::default(),
            created_at: Utc::now(),
            is_identified: false,
        };
        let plain = serde_json::to_value(RetentionEntry::Actor(person.clone())).unwrap();
        assert_eq!(plain["name"], "alice");

        let in_period = serde_json::to_value(RetentionEntry::InPeriod {
            person,
            appearances: vec![1, 0, 1],
        })
        .unwrap();
        assert_eq!(in_period["person"]["id"], 1);
        assert_eq!(in_period["appearances"], json!([1, 0, 1]));
    }
}
