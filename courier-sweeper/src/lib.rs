//! Background loops that drain the durable outbox and keep provider
//! credentials fresh. Both run inside the main process, spawned by the
//! runner next to the orchestrator consumer.

pub mod poller;
pub mod refresher;

pub use poller::Sweeper;
pub use refresher::Refresher;
