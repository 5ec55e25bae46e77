// Flowline worker
// Decision: every worker runs the scheduler loops; job leases keep runs from overlapping
// Decision: node execution is delegated to the action service over HTTP

use std::sync::Arc;

use anyhow::{Context, Result};
use flowline_durable::{
    Dispatch, Dispatcher, EventGateway, ExecutionRunner, ExecutionStore, PostgresDefinitionSource,
    PostgresExecutionStore, ReconciliationJobs, ReconciliationScheduler,
};
use flowline_worker::{routes, ActionServiceClient, AppState, WorkerConfig};
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via RUST_LOG (default: "flowline_worker=info,flowline_durable=info")
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowline_worker=info,flowline_durable=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("flowline-worker starting...");

    let config = WorkerConfig::from_env()?;
    tracing::info!(
        worker_id = %config.worker_id,
        http_addr = %config.http_addr,
        action_service = %config.action_service_url,
        "Loaded worker configuration"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Connected to database");

    let postgres = PostgresExecutionStore::new(pool.clone());
    postgres
        .migrate()
        .await
        .context("Failed to run migrations")?;
    let store: Arc<dyn ExecutionStore> = Arc::new(postgres);

    let actions = Arc::new(
        ActionServiceClient::new(
            config.action_service_url.clone(),
            config.action_service_timeout,
        )
        .context("Failed to build action service client")?,
    );

    let runner = Arc::new(
        ExecutionRunner::new(
            store.clone(),
            Arc::new(PostgresDefinitionSource::new(pool)),
            actions.clone(),
            actions,
        )
        .with_config(config.engine.clone()),
    );
    let dispatcher: Arc<dyn Dispatch> = Arc::new(Dispatcher::new(runner.clone()));
    let gateway = Arc::new(EventGateway::new(store.clone(), dispatcher.clone()));

    let jobs = Arc::new(
        ReconciliationJobs::new(store.clone(), dispatcher.clone())
            .with_config(config.scheduler.clone())
            .with_holder(config.worker_id.clone()),
    );
    let scheduler = ReconciliationScheduler::new(jobs);
    let scheduler_handle = scheduler.spawn();

    let app = routes(AppState {
        store,
        runner,
        dispatcher,
        gateway,
    })
    .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("HTTP server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Received shutdown signal");
        })
        .await
        .context("Server error")?;

    scheduler.shutdown();
    if let Err(e) = scheduler_handle.await {
        tracing::error!(error = %e, "Scheduler task failed");
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
