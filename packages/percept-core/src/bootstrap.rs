//! Application bootstrap and dependency wiring.
//!
//! The composition root: the single place where the store, annotator, and
//! bridge are instantiated and wired together. The annotator notifies the
//! bridge through the [`AnnotationSink`](crate::services::AnnotationSink)
//! trait, so neither side holds an owning reference to the other's internals.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::DashboardBridge;
use crate::error::{HubError, HubResult};
use crate::services::{Annotator, FrameStore};
use crate::state::Config;

/// Container for all bootstrapped services.
#[derive(Clone)]
pub struct BootstrappedServices {
    /// Authoritative in-memory buffer of the active session.
    pub store: Arc<FrameStore>,
    /// Segmentation annotation worker.
    pub annotator: Arc<Annotator>,
    /// Viewer connection manager.
    pub bridge: Arc<DashboardBridge>,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
}

/// Constructs and wires all services.
pub fn bootstrap_services(config: &Config) -> HubResult<BootstrappedServices> {
    config.validate().map_err(HubError::Configuration)?;

    let store = Arc::new(FrameStore::new());
    let annotator = Arc::new(Annotator::new(&config.segmentation_host));
    let bridge = Arc::new(DashboardBridge::new(
        Arc::clone(&store),
        Arc::clone(&annotator),
    ));

    // Annotation results fan out to viewers through the bridge.
    annotator.set_sink(bridge.clone());

    Ok(BootstrappedServices {
        store,
        annotator,
        bridge,
        cancel_token: CancellationToken::new(),
    })
}

impl BootstrappedServices {
    /// Kicks off background work: the segmentation connection (with its
    /// retry loop if the service is down).
    pub async fn start_background_tasks(&self) {
        self.annotator.connect().await;
    }

    /// Initiates graceful shutdown of all services.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.cancel_token.cancel();
        self.store.stop_replay().await;
        self.annotator.close().await;
        log::info!("[Bootstrap] Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_wires_the_annotation_sink() {
        let services = bootstrap_services(&Config::default()).unwrap();

        // A result flowing into the annotator must reach the bridge's
        // broadcast path without panicking even with zero viewers.
        services
            .annotator
            .on_result(crate::proto::SegmentResponse::default());
        assert_eq!(services.annotator.completed_count(), 1);
        assert_eq!(services.bridge.connection_count(), 0);
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_config() {
        let config = Config {
            segmentation_host: "not-a-url".into(),
            ..Default::default()
        };
        assert!(bootstrap_services(&config).is_err());
    }

    #[tokio::test]
    async fn shutdown_is_clean_without_background_tasks() {
        let services = bootstrap_services(&Config::default()).unwrap();
        services.shutdown().await;
        assert!(!services.annotator.is_connected());
    }
}
