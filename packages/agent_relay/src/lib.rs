//! Live event relay for agent sessions.
//!
//! Streams session lifecycle, tool-execution and activity events from a
//! long-running agent engine to every connected client of the session's
//! owner, with bounded per-session replay for clients that join late.

pub mod activity;
pub mod bus;
pub mod channel;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod replay;
pub mod tasks;

#[cfg(test)]
pub(crate) mod test_helpers;

use std::sync::Arc;

pub use bus::{EventBus, Subscription};
pub use config::{RelayConfig, RelayFileConfig};
pub use error::{ChannelError, RelayError};
pub use metrics::RelayMetrics;
pub use relay::Relay;

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub metrics: Arc<RelayMetrics>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let metrics = Arc::new(RelayMetrics::new());
        let relay = Arc::new(Relay::with_metrics(config, metrics.clone()));
        Self { relay, metrics }
    }
}
