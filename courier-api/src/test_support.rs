use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;

use courier_core::config::{
    Config, DatabaseConfig, DispatchConfig, KafkaConfig, ProviderConfig, RedisConfig,
    RefreshConfig, ServerConfig, SweepConfig,
};
use courier_core::kafka::create_producer;
use courier_core::store::DynStore;
use courier_core::EngineContext;
use courier_providers::Adapters;
use courier_workers::Dispatcher;

/// Endpoints that point nowhere: Kafka and Redis handles are created
/// lazily, so a context built from this config works for every route that
/// does not actually produce or cache.
pub fn test_config() -> Config {
    Config {
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 1,
        },
        redis: RedisConfig {
            url: "redis://127.0.0.1:1/".to_string(),
            max_connections: 1,
        },
        kafka: KafkaConfig {
            brokers: "127.0.0.1:1".to_string(),
            consumer_group: "courier-test".to_string(),
            jobs_topic: "notification.jobs".to_string(),
        },
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            api_port: 0,
            jwt_secret: "test-jwt-secret".to_string(),
            link_events_secret: "test-link-secret".to_string(),
        },
        dispatch: DispatchConfig {
            default_language: "vi".to_string(),
            default_timezone: "UTC".to_string(),
            complete_dispatched_jobs: false,
            link_code_length: 6,
            link_code_ttl_minutes: 10,
        },
        sweep: SweepConfig {
            poll_interval_secs: 10,
            batch_size: 50,
            max_attempts: 5,
            backoff_base_secs: 30,
            backoff_cap_secs: 3600,
        },
        refresh: RefreshConfig {
            interval_secs: 2700,
            expiry_margin_secs: 600,
        },
        providers: ProviderConfig {
            fcm_server_key: None,
            fcm_api_base: "http://127.0.0.1:9/fcm".to_string(),
            resend_api_key: None,
            resend_from_email: None,
            resend_api_base: "http://127.0.0.1:9".to_string(),
            sms_gateway_url: None,
            sms_api_key: None,
            sms_sender_id: None,
            zalo_app_id: None,
            zalo_secret_key: None,
            zalo_api_base: "http://127.0.0.1:9/zalo".to_string(),
            zalo_oauth_base: "http://127.0.0.1:9/zalo-oauth".to_string(),
            viber_auth_token: None,
            viber_sender_name: None,
            viber_api_base: "http://127.0.0.1:9/viber".to_string(),
        },
    }
}

pub fn test_context(store: DynStore) -> EngineContext {
    let config = test_config();
    let redis_pool = Arc::new(redis::Client::open(config.redis.url.as_str()).unwrap());
    let kafka_producer = create_producer(&config.kafka).unwrap();
    EngineContext {
        config: Arc::new(config),
        store,
        redis_pool,
        kafka_producer,
    }
}

/// Full application router over the given store, with permissive CORS and
/// no Redis behind the in-app worker.
pub fn app(store: DynStore) -> (Router, EngineContext) {
    let ctx = test_context(store);
    let adapters = Arc::new(Adapters::new(&ctx.config.providers, ctx.store.clone()).unwrap());
    let dispatcher = Arc::new(Dispatcher::new(ctx.store.clone(), adapters, None));
    let router = crate::server::router(ctx.clone(), dispatcher, CorsLayer::permissive());
    (router, ctx)
}

pub fn bearer(uid: &str) -> String {
    let token = crate::auth::generate_token(uid, "test-jwt-secret", 1).unwrap();
    format!("Bearer {}", token)
}
