//! Percept Server - Standalone headless server for Percept Hub.
//!
//! Runs the ingestion/replay/annotation hub as a background daemon: device
//! and dashboard WebSockets, the REST control plane, and the segmentation
//! annotator, with graceful shutdown on SIGINT/SIGTERM.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use percept_core::{bootstrap_services, start_server, AppState};
use tokio::signal;

use crate::config::ServerConfig;

/// Percept Server - Headless AR perception stream hub.
#[derive(Parser, Debug)]
#[command(name = "percept-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "PERCEPT_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "PERCEPT_BIND_PORT")]
    port: Option<u16>,

    /// Recordings directory (overrides config file).
    #[arg(short = 'r', long, env = "PERCEPT_RECORDINGS_DIR")]
    recordings_dir: Option<PathBuf>,

    /// Segmentation service base URL (overrides config file).
    #[arg(short = 's', long, env = "PERCEPT_SEGMENTATION_HOST")]
    segmentation_host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Percept Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(dir) = args.recordings_dir {
        config.recordings_dir = dir;
    }
    if let Some(host) = args.segmentation_host {
        config.segmentation_host = host;
    }

    log::info!(
        "Configuration: bind_port={}, recordings_dir={}, segmentation_host={}",
        config.bind_port,
        config.recordings_dir.display(),
        config.segmentation_host
    );

    std::fs::create_dir_all(&config.recordings_dir).with_context(|| {
        format!(
            "Failed to create recordings directory {}",
            config.recordings_dir.display()
        )
    })?;

    // Bootstrap services
    let core_config = Arc::new(config.to_core_config());
    let services = bootstrap_services(&core_config).context("Failed to bootstrap services")?;

    log::info!("Services bootstrapped successfully");

    // Connect to the segmentation service (retries in background if down)
    services.start_background_tasks().await;

    // Spawn the HTTP server on the main runtime
    let app_state = AppState::new(&services, Arc::clone(&core_config));
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state).await {
            log::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Graceful shutdown
    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Completes when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
