use std::sync::Arc;

use crate::config::Config;
use crate::db::create_pool as create_db_pool;
use crate::kafka::{create_consumer, create_producer, KafkaConsumer, KafkaProducer};
use crate::redis::{create_pool as create_redis_pool, RedisPool};
use crate::store::{DynStore, PgStore};

/// Shared handles for every service in the engine. Cheap to clone; the store
/// is behind a trait object so tests can swap in the in-memory backend.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<Config>,
    pub store: DynStore,
    pub redis_pool: RedisPool,
    pub kafka_producer: KafkaProducer,
}

impl EngineContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let db_pool = create_db_pool(&config.database).await?;
        let redis_pool = create_redis_pool(&config.redis).await?;
        let kafka_producer = create_producer(&config.kafka)?;

        Ok(EngineContext {
            config: Arc::new(config),
            store: Arc::new(PgStore::new(db_pool)),
            redis_pool,
            kafka_producer,
        })
    }

    pub fn create_consumer(&self, group_id: Option<&str>) -> anyhow::Result<KafkaConsumer> {
        create_consumer(&self.config.kafka, group_id)
    }
}
