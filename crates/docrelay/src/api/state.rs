//! Application state shared across handlers.

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::relay::Upstream;
use crate::tracker::ProgressClient;

#[derive(Clone)]
pub struct AppState {
    /// Backend the relay forwards to.
    pub upstream: Arc<dyn Upstream>,
    pub relay: Arc<RelayConfig>,
    /// Progress client without a credential; handlers attach the caller's.
    pub progress: ProgressClient,
}

impl AppState {
    pub fn new(upstream: Arc<dyn Upstream>, relay: RelayConfig, progress: ProgressClient) -> Self {
        Self {
            upstream,
            relay: Arc::new(relay),
            progress,
        }
    }
}
