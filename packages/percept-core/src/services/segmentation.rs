//! Connection half of the annotator: HTTP session management and the binary
//! WebSocket to the segmentation service.
//!
//! The service is a black box reached two ways: an HTTP endpoint that opens
//! sessions and reports status, and a WebSocket (carrying the session id)
//! that accepts [`SegmentRequest`]s and emits [`SegmentResponse`]s. The
//! client holds the write half; the read half is handed back to the caller so
//! the annotator can own its reader task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::SinkExt;
use prost::Message as _;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::constants::{SESSION_OPEN_TIMEOUT_SECS, STATUS_PROBE_TIMEOUT_SECS};
use crate::error::{HubError, HubResult};
use crate::proto::SegmentRequest;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Read half of the segmentation WebSocket, handed to the annotator's reader
/// task.
pub type SegmentationReader = SplitStream<WsStream>;

type SegmentationWriter = SplitSink<WsStream, WsMessage>;

#[derive(Deserialize)]
struct SessionStart {
    session_id: String,
}

/// Owns the HTTP client session and the WebSocket write half to the
/// segmentation service.
pub struct SegmentationClient {
    http: reqwest::Client,
    host: String,
    ws_base: String,
    writer: tokio::sync::Mutex<Option<SegmentationWriter>>,
    session_id: parking_lot::Mutex<Option<String>>,
    connected: AtomicBool,
}

impl SegmentationClient {
    pub fn new(host: &str) -> Self {
        let host = host.trim_end_matches('/').to_string();
        let ws_base = host
            .replacen("http://", "ws://", 1)
            .replacen("https://", "wss://", 1);
        Self {
            http: reqwest::Client::new(),
            host,
            ws_base,
            writer: tokio::sync::Mutex::new(None),
            session_id: parking_lot::Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Marks the connection dead. Called by the reader task when the stream
    /// ends; the retry loop takes it from there.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Probes the service status endpoint. Any non-success or timeout counts
    /// as unreachable.
    pub async fn probe(&self) -> bool {
        let url = format!("{}/segment/status", self.host);
        match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(STATUS_PROBE_TIMEOUT_SECS))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Opens a segmentation session and its WebSocket.
    ///
    /// Returns the read half for the caller's reader task; the write half is
    /// retained internally for [`send`](Self::send).
    pub async fn open(&self) -> HubResult<SegmentationReader> {
        let url = format!("{}/segment/session/start", self.host);
        let start: SessionStart = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(SESSION_OPEN_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| HubError::Segmentation(format!("session start failed: {e}")))?
            .json()
            .await
            .map_err(|e| HubError::Segmentation(format!("bad session start reply: {e}")))?;

        let ws_url = format!(
            "{}/segment/stream?session_id={}",
            self.ws_base, start.session_id
        );
        let (stream, _) = tokio::time::timeout(
            Duration::from_secs(SESSION_OPEN_TIMEOUT_SECS),
            connect_async(&ws_url),
        )
        .await
        .map_err(|_| HubError::Segmentation("WebSocket connect timed out".into()))?
        .map_err(|e| HubError::Segmentation(format!("WebSocket connect failed: {e}")))?;

        use futures::StreamExt;
        let (writer, reader) = stream.split();
        *self.writer.lock().await = Some(writer);
        *self.session_id.lock() = Some(start.session_id.clone());
        self.connected.store(true, Ordering::SeqCst);
        log::info!(
            "[Segmentation] Stream connected (session {})",
            start.session_id
        );
        Ok(reader)
    }

    /// Sends one segmentation request. Silently a no-op while disconnected;
    /// send failures are tolerated (the reconnect loop will notice).
    pub async fn send(&self, request: &SegmentRequest) {
        if !self.is_connected() {
            return;
        }
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return;
        };
        let payload = request.encode_to_vec();
        if let Err(e) = writer.send(WsMessage::Binary(payload.into())).await {
            log::debug!("[Segmentation] Send failed: {}", e);
        }
    }

    /// Fetches the service's status JSON, tagged with a connectivity flag.
    pub async fn get_status(&self) -> serde_json::Value {
        if !self.is_connected() {
            return serde_json::json!({ "connected": false });
        }
        let url = format!("{}/segment/status", self.host);
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(SESSION_OPEN_TIMEOUT_SECS))
            .send()
            .await;
        if let Ok(resp) = resp {
            if resp.status().is_success() {
                if let Ok(mut status) = resp.json::<serde_json::Value>().await {
                    if let Some(map) = status.as_object_mut() {
                        map.insert("connected".into(), serde_json::Value::Bool(true));
                        return status;
                    }
                }
            }
        }
        serde_json::json!({ "connected": false })
    }

    /// Closes the WebSocket and deletes the remote session. Best-effort.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.send(WsMessage::Close(None)).await;
        }
        let session_id = self.session_id.lock().take();
        if let Some(id) = session_id {
            let url = format!("{}/segment/session/{}", self.host, id);
            if let Err(e) = self
                .http
                .delete(&url)
                .timeout(Duration::from_secs(SESSION_OPEN_TIMEOUT_SECS))
                .send()
                .await
            {
                log::debug!("[Segmentation] Session delete failed: {}", e);
            }
        }
    }
}
