use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use people_resolver::config::Settings;
use people_resolver::db::{init_pool, run_migrations, PgCatalog, PgStore, PgTaskQueue, PgTaskSource};
use people_resolver::events::{CaptureClient, ChannelEventSink, EventSink};
use people_resolver::execution::{ClickHouseExecutor, ColumnarExecutor};
use people_resolver::observability::QueryMetrics;
use people_resolver::resolver::{ActorResolver, StaticCapabilities};
use people_resolver::service::person::ListBody;
use people_resolver::service::{
    error_reply, PersonService, PropertyDefinitionService, RequestContext, TeamScope,
};
use people_resolver::tasks::TaskWorker;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "people-resolver")]
#[command(about = "Actor resolution and pagination for product analytics")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply the Postgres migrations
    Migrate,

    /// Check that both stores are reachable
    Health,

    /// Process queued split / index tasks until interrupted
    Worker,

    /// Run a read endpoint and print its JSON reply
    Get {
        #[arg(value_enum)]
        endpoint: Endpoint,

        /// Absolute request URL, query string included
        url: String,

        #[arg(long)]
        team: i64,

        #[arg(long, default_value_t = Uuid::nil())]
        organization: Uuid,

        /// Person id for per-person endpoints
        #[arg(long)]
        person: Option<String>,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Endpoint {
    List,
    Funnel,
    Path,
    Values,
    Properties,
    Lifecycle,
    Retention,
    Stickiness,
    Activity,
    PropertyDefinitions,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = Settings::from_env();

    match args.command {
        Command::Migrate => {
            let pool = init_pool(&settings).await?;
            run_migrations(&pool).await?;
            info!("migrations applied");
        }
        Command::Health => {
            init_pool(&settings).await.context("postgres unreachable")?;
            let clickhouse = ClickHouseExecutor::new(&settings);
            if !clickhouse.health_check().await? {
                anyhow::bail!("clickhouse health check failed");
            }
            println!("ok");
        }
        Command::Worker => {
            let pool = init_pool(&settings).await?;
            let store = Arc::new(PgStore::new(pool.clone()));
            let index = Arc::new(ClickHouseExecutor::new(&settings));
            let worker = TaskWorker::new(store, index);
            let source = PgTaskSource::new(pool, settings.task_poll_interval);
            info!("task worker started");
            worker.run(source).await?;
        }
        Command::Get {
            endpoint,
            url,
            team,
            organization,
            person,
        } => {
            let team = TeamScope {
                team_id: team,
                organization_id: organization,
            };
            let ctx = RequestContext::new(team, None, &url, None)?;
            run_endpoint(&settings, endpoint, &ctx, person.as_deref()).await?;
        }
    }
    Ok(())
}

async fn run_endpoint(
    settings: &Settings,
    endpoint: Endpoint,
    ctx: &RequestContext,
    person: Option<&str>,
) -> Result<()> {
    let pool = init_pool(settings).await?;
    let store = Arc::new(PgStore::new(pool.clone()));
    let resolver = ActorResolver::new(
        Arc::new(ClickHouseExecutor::new(settings)),
        QueryMetrics::new(),
        settings.query_timeout,
    );
    let service = PersonService::new(
        settings,
        resolver,
        store.clone(),
        store,
        Arc::new(PgTaskQueue::new(pool.clone())),
        event_sink(settings),
        Arc::new(StaticCapabilities::from_settings(settings)),
    );

    match endpoint {
        Endpoint::List => match service.list(ctx).await {
            Ok(reply) => match reply.body {
                Some(ListBody::Csv(csv)) => {
                    print!("{}", csv);
                    Ok(())
                }
                body => print_json(reply.status, &body),
            },
            Err(err) => print_reply::<()>(Err(err)),
        },
        Endpoint::Funnel => print_reply(service.funnel(ctx).await),
        Endpoint::Path => print_reply(service.path(ctx).await),
        Endpoint::Values => print_reply(service.values(ctx).await),
        Endpoint::Properties => print_reply(service.properties(ctx).await),
        Endpoint::Lifecycle => print_reply(service.lifecycle(ctx).await),
        Endpoint::Retention => print_reply(service.retention(ctx).await),
        Endpoint::Stickiness => print_reply(service.stickiness(ctx).await),
        Endpoint::Activity => match person {
            Some(id) => print_reply(service.activity(ctx, id).await),
            None => print_reply(service.all_activity(ctx).await),
        },
        Endpoint::PropertyDefinitions => {
            let definitions = PropertyDefinitionService::new(settings, Arc::new(PgCatalog::new(pool)));
            print_reply(definitions.list(ctx).await)
        }
    }
}

/// Capture endpoint when configured; otherwise events are only logged.
fn event_sink(settings: &Settings) -> Arc<dyn EventSink> {
    match (&settings.capture_url, &settings.capture_api_key) {
        (Some(url), Some(key)) => Arc::new(CaptureClient::new(url.clone(), key.clone())),
        _ => {
            let (sink, mut events) = ChannelEventSink::new();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    debug!(event = event.event.as_str(), team_id = event.team_id, "internal event");
                }
            });
            Arc::new(sink)
        }
    }
}

fn print_reply<T: Serialize>(
    outcome: people_resolver::error::Result<people_resolver::service::Reply<T>>,
) -> Result<()> {
    match outcome {
        Ok(reply) => print_json(reply.status, &reply.body),
        Err(err) => {
            error!("request failed: {}", err);
            let reply = error_reply(&err);
            print_json(reply.status, &reply.body)
        }
    }
}

fn print_json<T: Serialize>(status: u16, body: &T) -> Result<()> {
    println!("{}", status);
    println!("{}", serde_json::to_string_pretty(body)?);
    Ok(())
}
