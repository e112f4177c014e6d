//! Hub State
//!
//! Shared state accessible by all hub handlers.

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::registry::ConnectionRegistry;
use crate::config::HubConfig;
use crate::source::Source;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Streams of the competition hierarchy
    pub source: Source,
    pub config: Arc<HubConfig>,
    /// Live connections
    pub registry: Arc<ConnectionRegistry>,
    /// Root scope; every connection scope is a child of it
    pub shutdown: CancellationToken,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    pub fn new(source: Source, config: HubConfig) -> Self {
        Self::with_shutdown(source, config, CancellationToken::new())
    }

    pub fn with_shutdown(source: Source, config: HubConfig, shutdown: CancellationToken) -> Self {
        Self {
            source,
            registry: Arc::new(ConnectionRegistry::new(config.max_connections)),
            config: Arc::new(config),
            shutdown,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.connection_count().await
    }
}
