pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod kafka;
pub mod quiet_hours;
pub mod redis;
pub mod schema;
pub mod store;
pub mod template;
pub mod types;

pub use config::Config;
pub use context::EngineContext;
pub use db::DbPool;
pub use error::{EngineError, EngineResult};
pub use kafka::{KafkaConsumer, KafkaProducer};
pub use redis::RedisPool;
pub use store::{DynStore, LinkRedemption, MemoryStore, PgStore, Store};
