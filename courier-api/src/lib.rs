//! HTTP surface of the engine: job intake, direct worker invocation,
//! provider status webhooks, account linking, and the in-app inbox.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod link;
pub mod server;
pub mod webhooks;
pub mod workers;

#[cfg(test)]
mod test_support;
