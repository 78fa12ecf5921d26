//! HTTP/WebSocket API layer.
//!
//! Thin handlers that delegate to the store and annotator, plus router
//! construction and server startup. The "one producer at a time" rule is
//! enforced here: the ingress handler and the playback endpoints are the only
//! places that flip the store's source.

use std::sync::Arc;

use thiserror::Error;

pub mod dashboard;
pub mod http;
pub mod ingress;

pub use dashboard::DashboardBridge;

use crate::services::{Annotator, FrameStore};
use crate::state::Config;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),

    /// No available ports in the specified range.
    #[error("No available ports in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },
}

/// Shared application state for the API layer.
///
/// A thin wrapper holding references to the services; all business logic
/// lives in the services themselves.
#[derive(Clone)]
pub struct AppState {
    /// Authoritative in-memory buffer of the active session.
    pub store: Arc<FrameStore>,
    /// Segmentation annotation worker.
    pub annotator: Arc<Annotator>,
    /// Viewer connection manager.
    pub bridge: Arc<DashboardBridge>,
    /// Application configuration.
    pub config: Arc<Config>,
}

impl AppState {
    /// Builds the state from bootstrapped services.
    pub fn new(services: &crate::bootstrap::BootstrappedServices, config: Arc<Config>) -> Self {
        Self {
            store: Arc::clone(&services.store),
            annotator: Arc::clone(&services.annotator),
            bridge: Arc::clone(&services.bridge),
            config,
        }
    }
}

async fn find_available_port(
    start: u16,
    end: u16,
) -> Result<(u16, tokio::net::TcpListener), ServerError> {
    for port in start..=end {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => return Ok((port, listener)),
            Err(_) => continue,
        }
    }
    Err(ServerError::NoAvailablePort { start, end })
}

/// Starts the HTTP server on the configured or auto-discovered port.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let preferred_port = state.config.preferred_port;
    let (port, listener) = if preferred_port > 0 {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], preferred_port));
        (preferred_port, tokio::net::TcpListener::bind(&addr).await?)
    } else {
        find_available_port(
            crate::constants::PORT_RANGE_START,
            crate::constants::PORT_RANGE_END,
        )
        .await?
    };

    log::info!("Server listening on http://0.0.0.0:{}", port);
    let app = http::create_router(state);

    // Enable ConnectInfo<SocketAddr> extraction for the ingress handler.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}
