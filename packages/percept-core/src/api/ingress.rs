//! Device ingress: the WebSocket that AR devices push frame protos over.
//!
//! Accepting a live device takes over the store: any running replay is
//! stopped and the session cleared before the source flips to live, so a
//! viewer never sees replayed and live frames interleaved. Parse failures are
//! per-message and never drop the connection.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use prost::Message as _;

use crate::api::AppState;
use crate::proto::SensorFrame;
use crate::services::Source;

/// WebSocket upgrade handler for the device stream.
pub async fn ingress_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ingress(socket, state, addr))
}

async fn handle_ingress(mut socket: WebSocket, state: AppState, addr: SocketAddr) {
    log::info!("[Ingress] Device connected: {}", addr);

    state.store.stop_replay().await;
    state.store.clear();
    state.store.set_source(Source::Live, None);

    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Binary(data)) => match SensorFrame::decode(&data[..]) {
                Ok(frame) => state.store.push(frame),
                Err(e) => log::warn!("[Ingress] Frame parse error from {}: {}", addr, e),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    log::info!(
        "[Ingress] Device disconnected: {} (pushed {} frames)",
        addr,
        state.store.frame_count()
    );
    // Frames stay buffered for save; only the source tag resets.
    state.store.set_source(Source::None, None);
}
