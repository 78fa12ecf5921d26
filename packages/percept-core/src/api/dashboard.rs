//! Dashboard bridge: binary WebSocket protocol for viewer connections.
//!
//! Server -> viewer (binary), one-byte prefix then a ProtoLog-encoded batch:
//!   `0x01` + length-delimited frame records
//!   `0x02` + length-delimited annotation records
//!
//! Viewer -> server (text JSON): `{"action": "get_stats"}`,
//! `{"action": "seek", "start": N, "end": M}`, `{"action": "get_annotations"}`.
//!
//! Every outbound message goes through a per-connection mailbox drained by a
//! writer task, so frames reach one viewer in push order and a slow or dead
//! viewer is simply evicted on send failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use dashmap::DashMap;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::constants::VIEWER_READ_TIMEOUT_SECS;
use crate::proto::{SegmentResponse, SensorFrame};
use crate::protolog::ProtoLog;
use crate::services::{AnnotationSink, Annotator, FrameStore};

/// Binary message prefix for frame batches.
pub const PREFIX_FRAME: u8 = 0x01;
/// Binary message prefix for annotation batches.
pub const PREFIX_ANNOTATION: u8 = 0x02;

fn frame_payload<'a, I>(frames: I) -> Bytes
where
    I: IntoIterator<Item = &'a SensorFrame>,
{
    let mut buf = vec![PREFIX_FRAME];
    buf.extend_from_slice(&ProtoLog::<SensorFrame>::new().encode(frames));
    buf.into()
}

fn annotation_payload<'a, I>(annotations: I) -> Bytes
where
    I: IntoIterator<Item = &'a SegmentResponse>,
{
    let mut buf = vec![PREFIX_ANNOTATION];
    buf.extend_from_slice(&ProtoLog::<SegmentResponse>::new().encode(annotations));
    buf.into()
}

/// Incoming viewer actions. Unknown actions fail to parse and are ignored.
#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ViewerRequest {
    GetStats,
    Seek {
        #[serde(default)]
        start: usize,
        #[serde(default)]
        end: Option<usize>,
    },
    GetAnnotations,
}

/// Manages dashboard WebSocket connections.
pub struct DashboardBridge {
    store: Arc<FrameStore>,
    annotator: Arc<Annotator>,
    connections: DashMap<u64, mpsc::UnboundedSender<Message>>,
    next_id: AtomicU64,
}

impl DashboardBridge {
    pub fn new(store: Arc<FrameStore>, annotator: Arc<Annotator>) -> Self {
        Self {
            store,
            annotator,
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Pushes one annotation to every connected viewer, evicting connections
    /// whose mailbox is gone.
    pub fn broadcast_annotation(&self, annotation: &SegmentResponse) {
        let payload = annotation_payload(std::iter::once(annotation));
        let mut dead = Vec::new();
        for entry in self.connections.iter() {
            if entry
                .value()
                .send(Message::Binary(payload.clone()))
                .is_err()
            {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.connections.remove(&id);
        }
    }

    /// Full lifecycle of a single viewer connection.
    pub async fn handle_connection(self: Arc<Self>, socket: WebSocket) {
        let (mut socket_tx, mut socket_rx) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(id, tx.clone());
        log::info!(
            "[Dashboard] Viewer connected (total: {})",
            self.connections.len()
        );

        // Writer task: the only place that touches the socket sink. Mailbox
        // order is delivery order.
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if socket_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Catch-up: latest frame first so the UI is never blank, then the
        // whole annotation history, before any live frame can be enqueued.
        if let Some(latest) = self.store.latest() {
            let _ = tx.send(Message::Binary(frame_payload([latest.as_ref()])));
        }
        let annotations = self.annotator.all_annotations();
        log::info!(
            "[Dashboard] Viewer catch-up: {} existing annotations",
            annotations.len()
        );
        if !annotations.is_empty() {
            let _ = tx.send(Message::Binary(annotation_payload(annotations.iter())));
        }

        // Live frames: one 0x01 batch per frame, through this connection's
        // mailbox.
        let live_tx = tx.clone();
        let subscription = self.store.subscribe(move |frame| {
            let live_tx = live_tx.clone();
            async move {
                let _ = live_tx.send(Message::Binary(frame_payload([frame.as_ref()])));
            }
        });

        loop {
            let inbound = tokio::time::timeout(
                Duration::from_secs(VIEWER_READ_TIMEOUT_SECS),
                socket_rx.next(),
            )
            .await;
            match inbound {
                Err(_) => continue, // keepalive tick
                Ok(Some(Ok(Message::Text(text)))) => {
                    match serde_json::from_str::<ViewerRequest>(&text) {
                        Ok(request) => self.handle_request(&tx, request),
                        Err(_) => {} // malformed or unknown action
                    }
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => break,
                Ok(Some(Ok(_))) => {}
            }
        }

        subscription.unsubscribe();
        self.connections.remove(&id);
        drop(tx);
        writer.abort();
        log::info!(
            "[Dashboard] Viewer disconnected (total: {})",
            self.connections.len()
        );
    }

    fn handle_request(&self, tx: &mpsc::UnboundedSender<Message>, request: ViewerRequest) {
        match request {
            ViewerRequest::GetStats => {
                let stats = self.store.stats();
                let mut value = match serde_json::to_value(&stats) {
                    Ok(v) => v,
                    Err(e) => {
                        log::warn!("[Dashboard] Failed to serialize stats: {}", e);
                        return;
                    }
                };
                if let Some(map) = value.as_object_mut() {
                    map.insert("type".into(), serde_json::Value::String("stats".into()));
                }
                if let Ok(text) = serde_json::to_string(&value) {
                    let _ = tx.send(Message::Text(text.into()));
                }
            }
            ViewerRequest::Seek { start, end } => {
                let end = end.unwrap_or(start + 1);
                let frames = self.store.get_range(start, end);
                if frames.is_empty() {
                    return;
                }
                let _ = tx.send(Message::Binary(frame_payload(
                    frames.iter().map(Arc::as_ref),
                )));

                // Annotations for exactly the frames in the batch, so the
                // segmentation pane stays in sync with the seek.
                let annotations: Vec<SegmentResponse> = frames
                    .iter()
                    .filter_map(|f| {
                        let (ts, fnum) = f.key();
                        self.annotator.get_annotation(ts, fnum)
                    })
                    .collect();
                log::info!(
                    "[Dashboard] seek [{}:{}] -> {} frames, {} annotations ({} known)",
                    start,
                    end,
                    frames.len(),
                    annotations.len(),
                    self.annotator.completed_count()
                );
                if !annotations.is_empty() {
                    let _ = tx.send(Message::Binary(annotation_payload(annotations.iter())));
                }
            }
            ViewerRequest::GetAnnotations => {
                let annotations = self.annotator.all_annotations();
                if !annotations.is_empty() {
                    let _ = tx.send(Message::Binary(annotation_payload(annotations.iter())));
                }
            }
        }
    }
}

impl AnnotationSink for DashboardBridge {
    fn publish(&self, annotation: SegmentResponse) {
        self.broadcast_annotation(&annotation);
    }
}

/// WebSocket upgrade handler for viewer connections.
pub async fn dashboard_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| state.bridge.handle_connection(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{FrameId, MaskAnnotation, TriggerType};

    fn frame(n: u64) -> SensorFrame {
        SensorFrame {
            id: Some(FrameId {
                device_id: "dev-1".into(),
                frame_number: n,
                timestamp_ns: n * 1_000_000,
            }),
            ..Default::default()
        }
    }

    fn annotation(n: u64) -> SegmentResponse {
        SegmentResponse {
            id: Some(FrameId {
                device_id: "dev-1".into(),
                frame_number: n,
                timestamp_ns: n * 1_000_000,
            }),
            trigger: TriggerType::PointPrompt as i32,
            masks: vec![MaskAnnotation {
                object_id: 1,
                mask_data: Bytes::from_static(b"m"),
                pixel_count: 4,
                confidence: 1.0,
            }],
        }
    }

    fn decode_frames(payload: &[u8]) -> Vec<SensorFrame> {
        assert_eq!(payload[0], PREFIX_FRAME);
        ProtoLog::<SensorFrame>::new().decode(&payload[1..])
    }

    fn decode_annotations(payload: &[u8]) -> Vec<SegmentResponse> {
        assert_eq!(payload[0], PREFIX_ANNOTATION);
        ProtoLog::<SegmentResponse>::new().decode(&payload[1..])
    }

    fn bridge() -> (Arc<DashboardBridge>, Arc<FrameStore>, Arc<Annotator>) {
        let store = Arc::new(FrameStore::new());
        let annotator = Arc::new(Annotator::new("http://127.0.0.1:1"));
        let bridge = Arc::new(DashboardBridge::new(store.clone(), annotator.clone()));
        (bridge, store, annotator)
    }

    fn register_test_viewer(
        bridge: &DashboardBridge,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = bridge.next_id.fetch_add(1, Ordering::Relaxed);
        bridge.connections.insert(id, tx);
        rx
    }

    #[test]
    fn frame_payload_is_prefixed_and_decodable() {
        let frames = vec![frame(1), frame(2)];
        let payload = frame_payload(frames.iter());
        assert_eq!(decode_frames(&payload), frames);
    }

    #[test]
    fn annotation_payload_is_prefixed_and_decodable() {
        let payload = annotation_payload([annotation(3)].iter());
        assert_eq!(decode_annotations(&payload), vec![annotation(3)]);
    }

    #[tokio::test]
    async fn seek_sends_frame_batch_then_matching_annotations() {
        let (bridge, store, annotator) = bridge();
        for n in 0..10 {
            store.push(frame(n));
        }
        for n in [2u64, 4, 7] {
            annotator.on_result(annotation(n));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge.handle_request(
            &tx,
            ViewerRequest::Seek {
                start: 3,
                end: Some(8),
            },
        );

        let first = rx.recv().await.unwrap();
        let Message::Binary(bytes) = first else {
            panic!("expected binary frame batch")
        };
        let frames = decode_frames(&bytes);
        assert_eq!(
            frames
                .iter()
                .map(|f| f.id.as_ref().unwrap().frame_number)
                .collect::<Vec<_>>(),
            vec![3, 4, 5, 6, 7]
        );

        let second = rx.recv().await.unwrap();
        let Message::Binary(bytes) = second else {
            panic!("expected binary annotation batch")
        };
        let mut got: Vec<u64> = decode_annotations(&bytes)
            .iter()
            .map(|a| a.id.as_ref().unwrap().frame_number)
            .collect();
        got.sort_unstable();
        assert_eq!(got, vec![4, 7]);
    }

    #[tokio::test]
    async fn seek_outside_buffer_sends_nothing() {
        let (bridge, store, _annotator) = bridge();
        store.push(frame(0));

        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge.handle_request(
            &tx,
            ViewerRequest::Seek {
                start: 10,
                end: Some(20),
            },
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn get_stats_replies_with_tagged_json() {
        let (bridge, store, _annotator) = bridge();
        store.push(frame(0));

        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge.handle_request(&tx, ViewerRequest::GetStats);

        let Message::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text stats reply")
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "stats");
        assert_eq!(value["frame_count"], 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_viewer_and_evicts_dead_ones() {
        let (bridge, _store, _annotator) = bridge();
        let mut alive = register_test_viewer(&bridge);
        let dead = register_test_viewer(&bridge);
        drop(dead);
        assert_eq!(bridge.connection_count(), 2);

        bridge.broadcast_annotation(&annotation(1));

        let Message::Binary(bytes) = alive.recv().await.unwrap() else {
            panic!("expected binary annotation")
        };
        assert_eq!(decode_annotations(&bytes).len(), 1);
        assert_eq!(bridge.connection_count(), 1);
    }

    #[tokio::test]
    async fn unknown_actions_are_ignored() {
        let parsed = serde_json::from_str::<ViewerRequest>("{\"action\":\"reboot\"}");
        assert!(parsed.is_err());
    }

    #[test]
    fn seek_request_defaults() {
        let req: ViewerRequest = serde_json::from_str("{\"action\":\"seek\"}").unwrap();
        let ViewerRequest::Seek { start, end } = req else {
            panic!("expected seek")
        };
        assert_eq!(start, 0);
        assert_eq!(end, None);
    }
}
