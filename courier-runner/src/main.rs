use std::sync::Arc;

use anyhow::Result;
use courier_api::server::run as run_api;
use courier_core::{Config, EngineContext};
use courier_orchestrator::consumer::run as run_orchestrator;
use courier_providers::Adapters;
use courier_sweeper::poller::run as run_sweeper;
use courier_sweeper::refresher::run as run_refresher;
use courier_workers::Dispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting Courier notification engine");

    // Load configuration
    let config = Config::from_env();
    let ctx = EngineContext::new(config).await?;

    // One adapter set and dispatcher shared by the consumer, the sweeper,
    // and the worker endpoints.
    let adapters = Arc::new(Adapters::new(&ctx.config.providers, ctx.store.clone())?);
    let dispatcher = Arc::new(Dispatcher::new(
        ctx.store.clone(),
        adapters,
        Some(ctx.redis_pool.clone()),
    ));

    tracing::info!("Engine context initialized");

    // Spawn all loops as parallel tasks
    let ctx_clone = ctx.clone();
    let dispatcher_clone = dispatcher.clone();
    tokio::spawn(async move {
        if let Err(e) = run_orchestrator(ctx_clone, dispatcher_clone).await {
            tracing::error!("Job consumer error: {}", e);
        }
    });

    let ctx_clone = ctx.clone();
    let dispatcher_clone = dispatcher.clone();
    tokio::spawn(async move {
        if let Err(e) = run_sweeper(ctx_clone, dispatcher_clone).await {
            tracing::error!("Outbox sweeper error: {}", e);
        }
    });

    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = run_refresher(ctx_clone).await {
            tracing::error!("Credential refresher error: {}", e);
        }
    });

    // API server runs in main task
    tracing::info!("Starting API server");
    run_api(ctx, dispatcher).await?;

    Ok(())
}
