//! REST control plane.
//!
//! Thin handlers that delegate to the store and annotator. Data-plane errors
//! never surface here; these endpoints only fail on control-plane problems
//! (unknown recording, bad filename) mapped through [`HubError`].

use std::path::PathBuf;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::dashboard::dashboard_handler;
use crate::api::ingress::ingress_handler;
use crate::api::AppState;
use crate::constants::{RECORDING_EXTENSION, SIDECAR_EXTENSION};
use crate::error::{HubError, HubResult};

/// Request body for starting playback. `filename` stays optional at the
/// serde layer so its absence maps to a 400, not a deserialization reject.
#[derive(Deserialize)]
struct PlaybackStartRequest {
    #[serde(default)]
    filename: Option<String>,
    #[serde(default = "default_speed")]
    speed: f64,
    #[serde(default, rename = "loop")]
    looping: bool,
}

fn default_speed() -> f64 {
    1.0
}

/// Request body for saving the buffered session.
#[derive(Deserialize)]
struct SaveRequest {
    filename: String,
}

/// Resolves a recording filename inside the configured directory, rejecting
/// anything that could escape it.
fn recording_path(state: &AppState, filename: &str) -> HubResult<PathBuf> {
    if filename.is_empty() {
        return Err(HubError::InvalidRequest("missing filename".into()));
    }
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return Err(HubError::InvalidRequest(format!(
            "invalid filename: {filename}"
        )));
    }
    if !filename.ends_with(&format!(".{RECORDING_EXTENSION}")) {
        return Err(HubError::InvalidRequest(format!(
            "expected a .{RECORDING_EXTENSION} file, got {filename}"
        )));
    }
    Ok(state.config.recordings_dir.join(filename))
}

/// Shared load-annotate-replay sequence for playback start and upload. The
/// steps run back to back so a viewer never observes partial state.
async fn load_and_replay(
    state: &AppState,
    path: &std::path::Path,
    speed: f64,
    looping: bool,
) -> HubResult<(usize, usize)> {
    state.store.stop_replay().await;
    let frames = state.store.load_recording(path)?;
    let annotations = state.annotator.load_annotations(path)?;
    state.annotator.annotate_recording(&state.store.all_frames());
    state.store.start_replay(speed, looping).await;
    Ok((frames, annotations))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut body = json!({
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "dashboard_connections": state.bridge.connection_count(),
        "segmentation": state.annotator.get_status().await,
    });
    if let (Some(map), Ok(stats)) = (
        body.as_object_mut(),
        serde_json::to_value(state.store.stats()),
    ) {
        if let serde_json::Value::Object(stats) = stats {
            map.extend(stats);
        }
    }
    Json(body)
}

async fn stream_stats(State(state): State<AppState>) -> Json<crate::services::StoreStats> {
    Json(state.store.stats())
}

async fn list_recordings(State(state): State<AppState>) -> HubResult<Json<serde_json::Value>> {
    let dir = &state.config.recordings_dir;
    let mut recordings = Vec::new();
    if dir.exists() {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(&format!(".{RECORDING_EXTENSION}"))
                || name.ends_with(&format!(".{SIDECAR_EXTENSION}"))
            {
                continue;
            }
            let meta = entry.metadata()?;
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            recordings.push(json!({
                "filename": name,
                "size_mb": (meta.len() as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
                "modified": modified,
            }));
        }
    }
    recordings.sort_by_key(|r| std::cmp::Reverse(r["modified"].as_u64().unwrap_or(0)));
    Ok(Json(json!({ "recordings": recordings })))
}

async fn start_playback(
    State(state): State<AppState>,
    Json(request): Json<PlaybackStartRequest>,
) -> HubResult<Json<serde_json::Value>> {
    let filename = request
        .filename
        .ok_or_else(|| HubError::InvalidRequest("missing filename".into()))?;
    let path = recording_path(&state, &filename)?;
    if !path.exists() {
        return Err(HubError::RecordingNotFound(filename));
    }

    let (frames, annotations) =
        load_and_replay(&state, &path, request.speed, request.looping).await?;
    Ok(Json(json!({
        "status": "started",
        "filename": filename,
        "frames": frames,
        "annotations": annotations,
    })))
}

async fn stop_playback(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.store.stop_replay().await;
    state.annotator.stop().await;
    Json(json!({ "status": "stopped" }))
}

async fn playback_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "is_replaying": state.store.is_replaying(),
        "source": state.store.source(),
    }))
}

async fn upload_recording(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    body: Bytes,
) -> HubResult<Json<serde_json::Value>> {
    let path = recording_path(&state, &filename)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, &body)?;
    log::info!(
        "[Api] Uploaded {} ({:.1} KB)",
        filename,
        body.len() as f64 / 1024.0
    );

    let (frames, annotations) = load_and_replay(&state, &path, 1.0, false).await?;
    Ok(Json(json!({
        "status": "uploaded_and_playing",
        "filename": filename,
        "size": body.len(),
        "frames": frames,
        "annotations": annotations,
    })))
}

async fn save_recording(
    State(state): State<AppState>,
    Json(request): Json<SaveRequest>,
) -> HubResult<Json<serde_json::Value>> {
    if state.store.frame_count() == 0 {
        return Err(HubError::InvalidRequest("no frames buffered".into()));
    }
    let path = recording_path(&state, &request.filename)?;
    let frames = state.store.save(&path)?;
    Ok(Json(json!({
        "status": "saved",
        "filename": request.filename,
        "frames": frames,
    })))
}

/// Builds the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stream", get(stream_stats))
        .route("/api/recordings", get(list_recordings))
        .route("/api/recordings/save", post(save_recording))
        .route("/api/recordings/{filename}", post(upload_recording))
        .route("/api/playback/start", post(start_playback))
        .route("/api/playback/stop", post(stop_playback))
        .route("/api/playback/status", get(playback_status))
        .route("/ws/device", get(ingress_handler))
        .route("/ws/dashboard", get(dashboard_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Annotator;

    fn app_state(dir: &std::path::Path) -> AppState {
        let config = std::sync::Arc::new(crate::state::Config {
            recordings_dir: dir.to_path_buf(),
            ..Default::default()
        });
        let store = std::sync::Arc::new(crate::services::FrameStore::new());
        let annotator = std::sync::Arc::new(Annotator::new("http://127.0.0.1:1"));
        let bridge = std::sync::Arc::new(crate::api::dashboard::DashboardBridge::new(
            store.clone(),
            annotator.clone(),
        ));
        AppState {
            store,
            annotator,
            bridge,
            config,
        }
    }

    #[test]
    fn recording_path_rejects_traversal_and_wrong_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path());

        assert!(recording_path(&state, "ok.pb").is_ok());
        assert!(recording_path(&state, "").is_err());
        assert!(recording_path(&state, "../evil.pb").is_err());
        assert!(recording_path(&state, "sub/dir.pb").is_err());
        assert!(recording_path(&state, "notes.txt").is_err());
    }

    #[tokio::test]
    async fn start_playback_without_filename_is_a_400() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path());

        // An empty body must survive deserialization and reach the handler,
        // which maps the missing filename to an invalid-request error.
        let request: PlaybackStartRequest = serde_json::from_str("{}").unwrap();
        assert!(request.filename.is_none());

        let err = start_playback(State(state), Json(request)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }
}
