use async_trait::async_trait;
use people_resolver::actors::Actor;
use people_resolver::config::Settings;
use people_resolver::db::SqliteStore;
use people_resolver::error::{ResolverError, Result};
use people_resolver::events::ChannelEventSink;
use people_resolver::events::InternalEvent;
use people_resolver::execution::{
    ColumnarExecutor, ExecutionContext, ExecutorCapabilities, IdentityIndex, QueryResult,
};
use people_resolver::identity::split_actor_uuid;
use people_resolver::observability::QueryMetrics;
use people_resolver::query::{QueryPlan, SqlParam};
use people_resolver::resolver::{ActorResolver, StaticCapabilities};
use people_resolver::service::person::ListBody;
use people_resolver::service::{error_reply, PersonService, RequestContext, TeamScope};
use people_resolver::store::{ActorLookup, ActorStore, NewActor};
use people_resolver::tasks::{ChannelTaskQueue, ChannelTaskSource, TaskWorker};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

const TEAM: i64 = 2;

/// Serves a fixed, ordered list of actor uuids, honouring the plan's
/// fetch limit and bound offset.
struct ListExecutor {
    capabilities: ExecutorCapabilities,
    ids: Mutex<Vec<Uuid>>,
    executions: AtomicUsize,
    delay: Duration,
}

impl ListExecutor {
    fn new(ids: Vec<Uuid>) -> Self {
        Self {
            capabilities: ExecutorCapabilities::clickhouse(),
            ids: Mutex::new(ids),
            executions: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }
}

fn plan_offset(plan: &QueryPlan) -> usize {
    let Some(pos) = plan.sql.rfind("OFFSET {") else {
        return 0;
    };
    let name: String = plan.sql[pos + "OFFSET {".len()..]
        .chars()
        .take_while(|c| *c != ':')
        .collect();
    match plan.params.get(&name) {
        Some(SqlParam::UInt(n)) => *n as usize,
        Some(SqlParam::Int(n)) => *n as usize,
        _ => 0,
    }
}

#[async_trait]
impl ColumnarExecutor for ListExecutor {
    fn name(&self) -> &'static str {
        "list"
    }

    fn capabilities(&self) -> &ExecutorCapabilities {
        &self.capabilities
    }

    async fn execute(&self, plan: &QueryPlan, _ctx: &ExecutionContext) -> Result<QueryResult> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let rows = self
            .ids
            .lock()
            .unwrap()
            .iter()
            .skip(plan_offset(plan))
            .take(plan.fetch_limit as usize)
            .map(|id| vec![json!(id.to_string())])
            .collect();
        Ok(QueryResult::new(vec!["person_id".into()], rows))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Default)]
struct RecordingIndex {
    calls: Mutex<Vec<(&'static str, Uuid, Vec<String>)>>,
}

#[async_trait]
impl IdentityIndex for RecordingIndex {
    async fn reassign(&self, _team_id: i64, person_id: Uuid, distinct_ids: &[String], _version: i64) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(("reassign", person_id, distinct_ids.to_vec()));
        Ok(())
    }

    async fn remove(&self, _team_id: i64, person_id: Uuid, distinct_ids: &[String], _version: i64) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(("remove", person_id, distinct_ids.to_vec()));
        Ok(())
    }
}

struct Harness {
    store: Arc<SqliteStore>,
    executor: Arc<ListExecutor>,
    service: PersonService,
    tasks: ChannelTaskSource,
    events: UnboundedReceiver<InternalEvent>,
    worker: TaskWorker,
    index: Arc<RecordingIndex>,
}

impl Harness {
    fn new(executor: ListExecutor) -> Self {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let executor = Arc::new(executor);
        let (queue, tasks) = ChannelTaskQueue::new();
        let (sink, events) = ChannelEventSink::new();
        let index = Arc::new(RecordingIndex::default());
        let settings = Settings::default();
        let resolver = ActorResolver::new(executor.clone(), QueryMetrics::new(), Duration::from_secs(5));
        let service = PersonService::new(
            &settings,
            resolver,
            store.clone(),
            store.clone(),
            Arc::new(queue),
            Arc::new(sink),
            Arc::new(StaticCapabilities::from_settings(&settings)),
        );
        Self {
            worker: TaskWorker::new(store.clone(), index.clone()),
            store,
            executor,
            service,
            tasks,
            events,
            index,
        }
    }

    async fn person(&self, distinct_ids: &[&str], properties: Value) -> Actor {
        let properties: Map<String, Value> = match properties {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.store
            .create(
                TEAM,
                NewActor {
                    uuid: None,
                    properties,
                    distinct_ids: distinct_ids.iter().map(|d| d.to_string()).collect(),
                    is_identified: false,
                },
            )
            .await
            .unwrap()
    }

    fn serve(&self, ids: Vec<Uuid>) {
        *self.executor.ids.lock().unwrap() = ids;
    }

    async fn get(&self, lookup: ActorLookup) -> Result<Actor> {
        self.store.get(TEAM, lookup).await
    }
}

fn ctx(url: &str, body: Option<Value>) -> RequestContext {
    let team = TeamScope {
        team_id: TEAM,
        organization_id: Uuid::nil(),
    };
    RequestContext::new(team, None, url, body).unwrap()
}

fn sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids
}

fn page(reply: Option<ListBody>) -> people_resolver::service::person::ActorPage {
    match reply {
        Some(ListBody::Page(page)) => page,
        other => panic!("expected a JSON page, got {:?}", other),
    }
}

#[tokio::test]
async fn test_list_pages_in_store_order() {
    let h = Harness::new(ListExecutor::new(Vec::new()));
    let mut ids = Vec::new();
    for name in ["p0", "p1", "p2", "p3", "p4"] {
        ids.push(h.person(&[name], json!({})).await.uuid);
    }
    // Store order differs from insertion order.
    ids.reverse();
    h.serve(ids.clone());

    let reply = h
        .service
        .list(&ctx("http://testserver/api/person/?limit=2&offset=2", None))
        .await
        .unwrap();
    assert_eq!(reply.status, 200);
    let body = page(reply.body);
    let names: Vec<&str> = body.results.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["p2", "p1"]);
    assert_eq!(
        body.next.as_deref(),
        Some("http://testserver/api/person/?limit=2&offset=4")
    );
    assert_eq!(
        body.previous.as_deref(),
        Some("http://testserver/api/person/?limit=2&offset=0")
    );

    let last = page(
        h.service
            .list(&ctx("http://testserver/api/person/?limit=2&offset=4", None))
            .await
            .unwrap()
            .body,
    );
    assert_eq!(last.results.len(), 1);
    assert_eq!(last.next, None);
}

#[tokio::test]
async fn test_list_first_page_has_no_previous() {
    let h = Harness::new(ListExecutor::new(Vec::new()));
    let a = h.person(&["a"], json!({"email": "a@b.com"})).await;
    h.serve(vec![a.uuid]);

    let body = page(
        h.service
            .list(&ctx("http://testserver/api/person/", None))
            .await
            .unwrap()
            .body,
    );
    assert_eq!(body.results[0].name, "a@b.com");
    assert_eq!(body.next, None);
    assert_eq!(body.previous, None);
}

#[tokio::test]
async fn test_csv_export_ignores_offset() {
    let h = Harness::new(ListExecutor::new(Vec::new()));
    let a = h.person(&["a"], json!({"plan": "pro"})).await;
    let b = h.person(&["b"], json!({})).await;
    h.serve(vec![a.uuid, b.uuid]);

    let reply = h
        .service
        .list(&ctx("http://testserver/api/person/?format=csv&offset=1&limit=1", None))
        .await
        .unwrap();
    match reply.body {
        Some(ListBody::Csv(csv)) => {
            assert_eq!(csv.lines().count(), 3);
            assert!(csv.lines().next().unwrap().contains("properties.plan"));
        }
        other => panic!("expected csv, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_funnel_requests_share_one_query() {
    let mut executor = ListExecutor::new(Vec::new());
    executor.delay = Duration::from_millis(50);
    let h = Harness::new(executor);
    let a = h.person(&["a"], json!({})).await;
    let b = h.person(&["b"], json!({})).await;
    h.serve(vec![a.uuid, b.uuid]);

    let body = json!({"events": [{"id": "signup"}, {"id": "purchase"}], "funnel_step": 2});
    let url = "http://testserver/api/person/funnel/";
    let (c1, c2, c3, c4) = (
        ctx(url, Some(body.clone())),
        ctx(url, Some(body.clone())),
        ctx(url, Some(body.clone())),
        ctx(url, Some(body)),
    );
    let (r1, r2, r3, r4) = tokio::join!(
        h.service.funnel(&c1),
        h.service.funnel(&c2),
        h.service.funnel(&c3),
        h.service.funnel(&c4),
    );
    let replies: Vec<_> = [r1, r2, r3, r4]
        .into_iter()
        .map(|r| r.unwrap().body.unwrap())
        .collect();

    assert_eq!(h.executor.executions.load(Ordering::SeqCst), 1);
    assert_eq!(replies.iter().filter(|r| !r.is_cached).count(), 1);
    for reply in &replies {
        assert_eq!(reply.results[0].count, 2);
        assert_eq!(reply.results[0].people, replies[0].results[0].people);
        assert_eq!(reply.last_refresh, replies[0].last_refresh);
        assert_eq!(reply.next, None);
        assert_eq!(reply.initial, "http://testserver/api/person/funnel/?limit=100&offset=0");
    }

    let refreshed = h
        .service
        .funnel(&ctx(
            "http://testserver/api/person/funnel/?refresh=true",
            Some(json!({"events": [{"id": "signup"}, {"id": "purchase"}], "funnel_step": 2})),
        ))
        .await
        .unwrap()
        .body
        .unwrap();
    assert!(!refreshed.is_cached);
    assert_eq!(h.executor.executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_funnel_correlation_needs_capability() {
    let h = Harness::new(ListExecutor::new(Vec::new()));
    let err = h
        .service
        .funnel(&ctx(
            "http://testserver/api/person/funnel/correlation/",
            Some(json!({
                "events": [{"id": "signup"}, {"id": "purchase"}],
                "funnel_correlation_person_entity": {"id": "signup", "type": "events"}
            })),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ResolverError::CapabilityUnavailable(_)));
    assert_eq!(error_reply(&err).status, 400);
}

#[tokio::test]
async fn test_lifecycle_missing_target_date() {
    let h = Harness::new(ListExecutor::new(Vec::new()));
    let err = h
        .service
        .lifecycle(&ctx(
            "http://testserver/api/person/lifecycle/?lifecycle_type=new",
            Some(json!({"events": [{"id": "$pageview"}]})),
        ))
        .await
        .unwrap_err();
    let reply = error_reply(&err);
    assert_eq!(reply.status, 400);
    let body = reply.body.unwrap();
    assert_eq!(body.message, "Missing parameter");
    assert_eq!(body.detail, "Must include specified date");
    assert_eq!(h.executor.executions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_delete_removes_actor_and_records_activity() {
    let h = Harness::new(ListExecutor::new(Vec::new()));
    let keep = h.person(&["keep"], json!({})).await;
    let gone = h.person(&["gone-1", "gone-2"], json!({})).await;
    // The columnar index still lists the deleted actor.
    h.serve(vec![gone.uuid, keep.uuid]);

    let reply = h
        .service
        .destroy(&ctx("http://testserver/api/person/", None), &gone.id.to_string())
        .await
        .unwrap();
    assert_eq!(reply.status, 204);
    assert!(reply.body.is_none());

    let body = page(
        h.service
            .list(&ctx("http://testserver/api/person/", None))
            .await
            .unwrap()
            .body,
    );
    let ids: Vec<i64> = body.results.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![keep.id]);

    let activity = h
        .service
        .all_activity(&ctx("http://testserver/api/person/activity/", None))
        .await
        .unwrap()
        .body
        .unwrap();
    assert_eq!(activity.total_count, 1);
    assert_eq!(activity.results[0].activity, "deleted");
    assert_eq!(activity.results[0].item_id, gone.id.to_string());

    let err = h
        .service
        .destroy(&ctx("http://testserver/api/person/", None), &gone.id.to_string())
        .await
        .unwrap_err();
    assert_eq!(error_reply(&err).status, 404);

    let mut h = h;
    let handled = h.worker.drain(&mut h.tasks).await.unwrap();
    assert_eq!(handled, 1);
    let calls = h.index.calls.lock().unwrap();
    assert_eq!(calls[0].0, "remove");
    assert_eq!(calls[0].1, gone.uuid);
    assert_eq!(sorted(calls[0].2.clone()), vec!["gone-1", "gone-2"]);
}

#[tokio::test]
async fn test_merge_then_split_round_trip() {
    let mut h = Harness::new(ListExecutor::new(Vec::new()));
    let a = h.person(&["a1", "a2"], json!({"email": "a@b.com"})).await;
    let b = h.person(&["b1"], json!({"plan": "pro"})).await;

    let reply = h
        .service
        .merge(
            &ctx("http://testserver/api/person/merge/", Some(json!({"uuids": [b.uuid]}))),
            &a.id.to_string(),
        )
        .await
        .unwrap();
    assert_eq!(reply.status, 201);
    let merged = reply.body.unwrap();
    assert_eq!(sorted(merged.distinct_ids.clone()), vec!["a1", "a2", "b1"]);
    assert_eq!(merged.properties["plan"], "pro");
    assert!(matches!(
        h.get(ActorLookup::Uuid(b.uuid)).await,
        Err(ResolverError::NotFound(_))
    ));

    let merge_activity = h
        .service
        .activity(&ctx("http://testserver/api/person/activity/", None), &a.id.to_string())
        .await
        .unwrap()
        .body
        .unwrap();
    assert_eq!(merge_activity.results[0].activity, "people_merged_into");

    let reply = h
        .service
        .split(
            &ctx(
                "http://testserver/api/person/split/",
                Some(json!({"main_distinct_id": "a1"})),
            ),
            &a.id.to_string(),
        )
        .await
        .unwrap();
    assert_eq!(reply.status, 201);
    assert!(reply.body.unwrap().success);
    // Nothing moves until a worker picks the task up.
    assert_eq!(h.get(ActorLookup::Id(a.id)).await.unwrap().distinct_ids.len(), 3);

    h.worker.drain(&mut h.tasks).await.unwrap();
    let retained = h.get(ActorLookup::Id(a.id)).await.unwrap();
    assert_eq!(retained.distinct_ids, vec!["a1"]);

    let mut split_off = Vec::new();
    for alias in ["a2", "b1"] {
        let actor = h
            .get(ActorLookup::Uuid(split_actor_uuid(TEAM, alias)))
            .await
            .unwrap();
        assert_eq!(actor.distinct_ids, vec![alias]);
        assert!(actor.properties.is_empty());
        split_off.push(actor.uuid);
    }

    let restored = h
        .service
        .merge(
            &ctx("http://testserver/api/person/merge/", Some(json!({"uuids": split_off}))),
            &a.id.to_string(),
        )
        .await
        .unwrap()
        .body
        .unwrap();
    assert_eq!(sorted(restored.distinct_ids), vec!["a1", "a2", "b1"]);
}

#[tokio::test]
async fn test_split_rejects_foreign_main_distinct_id() {
    let h = Harness::new(ListExecutor::new(Vec::new()));
    let a = h.person(&["a1", "a2"], json!({})).await;
    let err = h
        .service
        .split(
            &ctx(
                "http://testserver/api/person/split/",
                Some(json!({"main_distinct_id": "zzz"})),
            ),
            &a.id.to_string(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ResolverError::Validation { .. }));
}

#[tokio::test]
async fn test_property_writes_go_through_events() {
    let mut h = Harness::new(ListExecutor::new(Vec::new()));
    let a = h.person(&["a1"], json!({"plan": "free", "beta": true})).await;

    let reply = h
        .service
        .delete_property(
            &ctx("http://testserver/api/person/delete_property/", Some(json!({"$unset": "beta"}))),
            &a.id.to_string(),
        )
        .await
        .unwrap();
    assert_eq!(reply.status, 201);
    let event = h.events.try_recv().unwrap();
    assert_eq!(event.event, "$delete_person_property");
    assert_eq!(event.distinct_id, "a1");
    assert_eq!(event.properties, json!({"$unset": ["beta"]}));

    let reply = h
        .service
        .update(
            &ctx("http://testserver/api/person/", Some(json!({"properties": {"plan": "pro"}}))),
            &a.id.to_string(),
        )
        .await
        .unwrap();
    assert_eq!(reply.status, 204);
    let event = h.events.try_recv().unwrap();
    assert_eq!(event.event, "$set");
    assert_eq!(event.properties, json!({"$set": {"plan": "pro"}}));

    let activity = h
        .service
        .activity(&ctx("http://testserver/api/person/activity/?limit=1", None), &a.id.to_string())
        .await
        .unwrap()
        .body
        .unwrap();
    assert_eq!(activity.total_count, 2);
    assert_eq!(activity.results.len(), 1);
    assert_eq!(activity.results[0].activity, "updated");
    assert_eq!(
        activity.next.as_deref(),
        Some("http://testserver/api/person/activity/?limit=1&page=2")
    );
    assert_eq!(activity.previous, None);

    let err = h
        .service
        .delete_property(&ctx("http://testserver/api/person/delete_property/", None), &a.id.to_string())
        .await
        .unwrap_err();
    assert_eq!(error_reply(&err).status, 400);
}

#[tokio::test]
async fn test_activity_for_missing_person_is_404() {
    let h = Harness::new(ListExecutor::new(Vec::new()));
    let err = h
        .service
        .activity(&ctx("http://testserver/api/person/activity/", None), "4242")
        .await
        .unwrap_err();
    let reply = error_reply(&err);
    assert_eq!(reply.status, 404);
    assert!(reply.body.is_none());
}
