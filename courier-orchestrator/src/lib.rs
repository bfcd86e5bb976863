pub mod audience;
pub mod consumer;
pub mod service;

pub use audience::{AudienceResolver, AudienceResolvers, UserResolver};
pub use service::Orchestrator;
