pub mod dispatcher;
pub mod inapp;
pub mod provider;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use inapp::InappWorker;
pub use provider::ProviderWorker;
