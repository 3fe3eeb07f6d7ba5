mod auth;
mod batch;
mod collectors;
mod config;
mod db;
mod error;
mod models;
mod queue;
mod routes;
mod skills;
mod store;
mod task_creator;
mod tracker;
mod workers;

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use clap::Parser;
use sqlx::PgPool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::auth::AdminToken;
use crate::collectors::AdapterRegistry;
use crate::config::{Command, Config};
use crate::models::execution::Trigger;
use crate::queue::{Dispatcher, PgTaskQueue, QueueClient, QueueName, TaskQueue};
use crate::skills::LlmSkillExtractor;
use crate::store::{PgStore, Store};
use crate::task_creator::{ScheduleOutcome, TaskCreator};
use crate::tracker::ExecutionTracker;
use crate::workers::{EnrichmentWorker, FetchWorker};

/// Rows per transaction the Postgres store accepts in one commit.
const PG_MAX_BATCH_SIZE: usize = 500;

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(pool: PgPool) -> impl IntoResponse {
    let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(&pool).await;
    match result {
        Ok(_) => (StatusCode::OK, "ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
    }
}

struct Services {
    store: Arc<dyn Store>,
    backend: Arc<dyn TaskQueue>,
    queues: QueueClient,
    tracker: Arc<ExecutionTracker>,
    fetch_worker: Arc<FetchWorker>,
    enrichment_worker: Option<Arc<EnrichmentWorker>>,
    creator: Arc<TaskCreator>,
}

fn build_services(config: &Config, pool: &PgPool) -> anyhow::Result<Services> {
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone(), PG_MAX_BATCH_SIZE));
    let backend: Arc<dyn TaskQueue> = Arc::new(PgTaskQueue::new(pool.clone()));
    let queues = QueueClient::new(
        backend.clone(),
        config.fetch_settings(),
        config.enrichment_settings(),
    );
    let tracker = Arc::new(ExecutionTracker::new(store.clone(), queues.clone()));

    let http = collectors::http_client()?;
    let adapters = AdapterRegistry::with_defaults(http.clone());
    tracing::info!(providers = ?adapters.providers(), "Provider adapters registered");

    let fetch_worker = Arc::new(FetchWorker::new(
        store.clone(),
        queues.clone(),
        adapters,
        tracker.clone(),
        config.write_batch_size,
    ));

    let enrichment_worker = match config.llm_api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        Some(api_key) => {
            let extractor =
                LlmSkillExtractor::new(http, &config.llm_api_url, api_key, &config.llm_model);
            Some(Arc::new(EnrichmentWorker::new(
                store.clone(),
                Arc::new(extractor),
                tracker.clone(),
            )))
        }
        None => {
            tracing::warn!("LLM_API_KEY not set; enrichment messages will wait in the queue");
            None
        }
    };

    let creator = Arc::new(TaskCreator::new(
        store.clone(),
        queues.clone(),
        config.write_batch_size,
        config.stale_execution_after(),
    ));

    Ok(Services {
        store,
        backend,
        queues,
        tracker,
        fetch_worker,
        enrichment_worker,
        creator,
    })
}

fn spawn_dispatchers(
    config: &Config,
    services: &Services,
    shutdown: &CancellationToken,
    tasks: &mut JoinSet<anyhow::Result<()>>,
) {
    let fetch = Dispatcher::new(
        services.backend.clone(),
        services.fetch_worker.clone(),
        services.queues.settings(QueueName::Fetch).clone(),
        config.poll_interval(),
    );
    tasks.spawn(fetch.run(shutdown.clone()));

    if let Some(worker) = &services.enrichment_worker {
        let enrich = Dispatcher::new(
            services.backend.clone(),
            worker.clone(),
            services.queues.settings(QueueName::Enrichment).clone(),
            config.poll_interval(),
        );
        tasks.spawn(enrich.run(shutdown.clone()));
    }
}

fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {e}");
        }
        tracing::info!("Shutdown requested");
        shutdown.cancel();
    });
}

async fn join_dispatchers(mut tasks: JoinSet<anyhow::Result<()>>) -> anyhow::Result<()> {
    while let Some(result) = tasks.join_next().await {
        result??;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("jobqueue=info,tower_http=info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let pool_size = config.pool_size();
    tracing::info!(pool_size, "Connecting to database...");
    let pool = db::create_pool(&config.database_url, pool_size).await?;

    if config.run_migrations {
        tracing::info!("Running database migrations...");
        db::run_migrations(&pool).await?;
        tracing::info!("Migrations complete");
    }

    let services = build_services(&config, &pool)?;
    let sources = Arc::new(config.load_sources()?);
    let shutdown = CancellationToken::new();

    match config.resolved_command() {
        Command::Serve {
            listen_addr,
            no_workers,
        } => {
            let admin_token = AdminToken::new(config.admin_token.as_deref());
            if !admin_token.is_enabled() {
                tracing::warn!("ADMIN_TOKEN not set; management API is unauthenticated");
            }

            let mut dispatchers = JoinSet::new();
            if !no_workers {
                spawn_dispatchers(&config, &services, &shutdown, &mut dispatchers);
            }

            let state = routes::AppState {
                store: services.store.clone(),
                queues: services.queues.clone(),
                creator: services.creator.clone(),
                tracker: services.tracker.clone(),
                fetch_worker: services.fetch_worker.clone(),
                sources,
                admin_token,
            };

            let readyz_pool = pool.clone();
            let app = Router::new()
                .route("/healthz", get(healthz))
                .route("/readyz", get(move || readyz(readyz_pool.clone())))
                .merge(routes::api::router(state))
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive());

            cancel_on_ctrl_c(shutdown.clone());
            let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
            tracing::info!("Listening on {}", listen_addr);
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                .await?;

            shutdown.cancel();
            join_dispatchers(dispatchers).await?;
        }
        Command::Work => {
            let mut dispatchers = JoinSet::new();
            spawn_dispatchers(&config, &services, &shutdown, &mut dispatchers);
            cancel_on_ctrl_c(shutdown.clone());
            join_dispatchers(dispatchers).await?;
        }
        Command::CreateTasks { force } => {
            match services
                .creator
                .run_scheduled(&sources, force, Trigger::Scheduled)
                .await?
            {
                ScheduleOutcome::Created(batch) => tracing::info!(
                    execution_id = ?batch.execution_id,
                    batch_id = ?batch.batch_id,
                    tasks_created = batch.tasks_created,
                    "Task creation finished"
                ),
                ScheduleOutcome::Skipped {
                    running_execution_id,
                } => tracing::info!(
                    running_execution_id = %running_execution_id,
                    "Execution still running; no tasks created"
                ),
            }
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
