//! Percept Core - shared library for Percept Hub.
//!
//! This crate provides the core functionality for Percept Hub, a real-time
//! ingestion, replay, and annotation server for perception data streamed from
//! mobile AR devices. Devices push per-frame messages (camera image, optional
//! depth, intrinsics/pose, IMU) over a binary WebSocket; the hub buffers the
//! session in memory, fans the stream out to dashboard viewers, persists
//! sessions as length-delimited logs, replays them with original timing, and
//! drives an external segmentation service whose per-frame mask annotations
//! land in sidecar logs and on viewer screens as they arrive.
//!
//! # Architecture
//!
//! - [`proto`]: wire message types for frames and segmentation
//! - [`protolog`]: length-delimited log codec with corruption recovery
//! - [`services`]: frame store, annotator, and segmentation client
//! - [`api`]: HTTP/WebSocket surface (ingress, dashboard, control plane)
//! - [`state`]: configuration
//! - [`error`]: centralized error types
//! - [`bootstrap`]: composition root
//!
//! At most one producer (live device or file replay) drives the store at a
//! time; the ingress and playback handlers enforce the transition order
//! (stop replay, clear, retag) so viewers never observe mixed sessions.

#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod constants;
pub mod error;
pub mod proto;
pub mod protolog;
pub mod services;
pub mod state;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, DashboardBridge, ServerError};
pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use error::{HubError, HubResult};
pub use proto::{FrameId, FrameKey, SegmentRequest, SegmentResponse, SensorFrame};
pub use protolog::{ProtoLog, ReadSummary};
pub use services::{sidecar_path, AnnotationSink, Annotator, FrameStore, Source, StoreStats};
pub use state::Config;
