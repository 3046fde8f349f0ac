//! Shared service context.
//!
//! Built once at startup and handed to every component by `Arc`. Nothing in
//! the crate reaches for global state.

use std::sync::Arc;

use crate::config::ControllerConfig;
use crate::metrics::TaskMetrics;
use crate::repository::TaskRepository;
use crate::transport::{BufferedPublisher, PublisherConfig, Transport};

/// Dependencies shared by the controller, signaler, trigger writer and pools.
pub struct ServiceContext {
    /// Persistent task state.
    pub repository: Arc<dyn TaskRepository>,
    /// Message transport.
    pub transport: Arc<dyn Transport>,
    /// Buffered publisher for monitoring records.
    pub publisher: BufferedPublisher,
    /// Metrics recorder.
    pub metrics: TaskMetrics,
    /// Controller configuration.
    pub config: ControllerConfig,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("publisher", &self.publisher)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ServiceContext {
    /// Builds the context and spawns the publisher's flusher.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        transport: Arc<dyn Transport>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let publisher = BufferedPublisher::spawn(
            Arc::clone(&transport),
            PublisherConfig {
                max_batch: config.olap_max_batch,
                flush_interval: config.olap_flush_interval,
                capacity: config.olap_max_batch.saturating_mul(10),
            },
        );

        Arc::new(Self {
            repository,
            transport,
            publisher,
            metrics: TaskMetrics::new(),
            config,
        })
    }
}
