use anyhow::Result;
use axum::{
    extract::Extension,
    middleware,
    routing::{get, post},
    Router,
};
use courier_core::EngineContext;
use courier_workers::Dispatcher;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use crate::auth;
use crate::handlers;
use crate::link;
use crate::webhooks;
use crate::workers;

pub fn router(ctx: EngineContext, dispatcher: Arc<Dispatcher>, cors_layer: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/auth/token", post(handlers::generate_token))
        .route("/api/v1/jobs", post(handlers::create_job))
        .route("/api/v1/jobs/:id", get(handlers::get_job))
        .route("/api/v1/jobs/:id/deliveries", get(handlers::get_job_deliveries))
        .route("/api/v1/workers/:channel", post(workers::invoke))
        .route("/api/v1/webhooks/zalo", post(webhooks::zalo))
        .route("/api/v1/webhooks/viber", post(webhooks::viber))
        .route("/api/v1/link/codes", post(link::issue_code))
        .route("/api/v1/link/events", post(link::link_event))
        .route("/api/v1/inbox", get(handlers::get_inbox))
        .route("/api/v1/inbox/counts", get(handlers::get_inbox_counts))
        .route("/api/v1/inbox/:id/read", post(handlers::mark_inbox_read))
        .layer(
            ServiceBuilder::new()
                .layer(Extension(ctx))
                .layer(Extension(dispatcher))
                .layer(middleware::from_fn(auth::auth_middleware))
                .layer(cors_layer),
        )
}

pub async fn run(ctx: EngineContext, dispatcher: Arc<Dispatcher>) -> Result<()> {
    // Configure CORS - allow specific origins or all if CORS_ORIGINS not set
    let cors_layer = if let Ok(origins) = env::var("CORS_ORIGINS") {
        let origin_list: Vec<&str> = origins.split(',').map(|s| s.trim()).collect();
        let mut cors = CorsLayer::new();
        for origin in origin_list {
            if let Ok(parsed) = origin.parse::<axum::http::HeaderValue>() {
                cors = cors.allow_origin(parsed);
            }
        }
        cors.allow_methods(Any)
            .allow_headers(Any)
            .allow_credentials(true)
    } else {
        tracing::warn!("CORS_ORIGINS not set, using permissive CORS. Set CORS_ORIGINS for production!");
        CorsLayer::permissive()
    };

    let addr: SocketAddr = format!(
        "{}:{}",
        ctx.config.server.host, ctx.config.server.api_port
    )
    .parse()?;
    let app = router(ctx, dispatcher, cors_layer);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
