//! In-memory buffer of the active session with pub/sub, random access,
//! recording I/O, and timed replay.
//!
//! The store owns every frame of the current session. Producers (`push`) never
//! suspend: subscriber delivery goes through per-subscriber mailboxes drained
//! by forwarder tasks, which also guarantees that a single subscriber sees
//! frames in push order. The buffer grows without bound for the session -- a
//! deliberate choice so viewers can seek anywhere. At 30 fps with ~100 KiB
//! JPEG payloads that is roughly 180 MiB per minute; operators cap session
//! length rather than the store dropping frames.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::REPLAY_MAX_GAP_SECS;
use crate::error::HubResult;
use crate::proto::{CameraIntrinsics, SensorFrame};
use crate::protolog::ProtoLog;

/// Which producer currently drives the store. At most one at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    None,
    Live,
    File,
}

struct SubscriberEntry {
    id: u64,
    tx: mpsc::UnboundedSender<Arc<SensorFrame>>,
}

struct ReplayHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    frames: Vec<Arc<SensorFrame>>,
    subscribers: Vec<SubscriberEntry>,
    next_subscriber_id: u64,
    source: Source,
    device_id: Option<String>,
    started_at: Option<Instant>,
    cached_intrinsics: Option<CameraIntrinsics>,
    current_file: Option<PathBuf>,
    replay: Option<ReplayHandle>,
}

/// Stores all frames of the current session/recording in memory.
pub struct FrameStore {
    inner: Arc<Mutex<Inner>>,
}

/// Handle returned by [`FrameStore::subscribe`]. Unsubscribing is idempotent
/// and safe to call after the store has been cleared.
pub struct Subscription {
    id: u64,
    inner: Weak<Mutex<Inner>>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().subscribers.retain(|s| s.id != self.id);
        }
    }
}

/// Snapshot of store state for dashboards and the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub source: Source,
    pub device_id: Option<String>,
    pub frame_count: usize,
    pub buffered_frames: usize,
    pub fps: f64,
    pub recording_fps: f64,
    pub is_replaying: bool,
    pub intrinsics: Option<IntrinsicsSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntrinsicsSummary {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub image_width: u32,
    pub image_height: u32,
    pub depth_width: u32,
    pub depth_height: u32,
}

impl From<&CameraIntrinsics> for IntrinsicsSummary {
    fn from(intr: &CameraIntrinsics) -> Self {
        Self {
            fx: intr.fx,
            fy: intr.fy,
            cx: intr.cx,
            cy: intr.cy,
            image_width: intr.image_width,
            image_height: intr.image_height,
            depth_width: intr.depth_width,
            depth_height: intr.depth_height,
        }
    }
}

fn frame_log() -> ProtoLog<SensorFrame> {
    ProtoLog::new()
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                frames: Vec::new(),
                subscribers: Vec::new(),
                next_subscriber_id: 1,
                source: Source::None,
                device_id: None,
                started_at: None,
                cached_intrinsics: None,
                current_file: None,
                replay: None,
            })),
        }
    }

    // ── Produce ──────────────────────────────────────────────────────────────

    /// Tags the current session's producer. The device id, if given, is
    /// latched until `clear()`.
    pub fn set_source(&self, source: Source, device_id: Option<&str>) {
        let mut inner = self.inner.lock();
        inner.source = source;
        if let Some(id) = device_id {
            inner.device_id = Some(id.to_string());
        }
    }

    /// Accepts a new frame, updates session state, and hands the frame to
    /// every subscriber mailbox. Never suspends and never fails.
    pub fn push(&self, frame: SensorFrame) {
        let frame = Arc::new(frame);
        let senders: Vec<mpsc::UnboundedSender<Arc<SensorFrame>>> = {
            let mut inner = self.inner.lock();
            if inner.frames.is_empty() {
                inner.started_at = Some(Instant::now());
            }
            if inner.device_id.is_none() {
                if let Some(id) = &frame.id {
                    if !id.device_id.is_empty() {
                        inner.device_id = Some(id.device_id.clone());
                    }
                }
            }
            if let Some(intr) = &frame.intrinsics {
                inner.cached_intrinsics = Some(intr.clone());
            }
            inner.frames.push(Arc::clone(&frame));
            inner.subscribers.iter().map(|s| s.tx.clone()).collect()
        };
        for tx in senders {
            // A closed mailbox means the forwarder ended; unsubscribe cleans
            // the entry up, so a failed send here is not an error.
            let _ = tx.send(Arc::clone(&frame));
        }
    }

    /// Delivers an already-stored frame to subscribers (replay path).
    fn dispatch(&self, frame: Arc<SensorFrame>) {
        let senders: Vec<mpsc::UnboundedSender<Arc<SensorFrame>>> = {
            let inner = self.inner.lock();
            inner.subscribers.iter().map(|s| s.tx.clone()).collect()
        };
        for tx in senders {
            let _ = tx.send(Arc::clone(&frame));
        }
    }

    /// Resets to an idle state. Subscribers are preserved.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.frames.clear();
        inner.started_at = None;
        inner.device_id = None;
        inner.source = Source::None;
        inner.cached_intrinsics = None;
        inner.current_file = None;
    }

    // ── Consume ──────────────────────────────────────────────────────────────

    pub fn latest(&self) -> Option<Arc<SensorFrame>> {
        self.inner.lock().frames.last().cloned()
    }

    pub fn get_frame(&self, index: usize) -> Option<Arc<SensorFrame>> {
        self.inner.lock().frames.get(index).cloned()
    }

    /// Returns frames in the half-open range `[start, end)`, clamped to the
    /// buffer.
    pub fn get_range(&self, start: usize, end: usize) -> Vec<Arc<SensorFrame>> {
        let inner = self.inner.lock();
        let end = end.min(inner.frames.len());
        if start >= end {
            return Vec::new();
        }
        inner.frames[start..end].to_vec()
    }

    pub fn all_frames(&self) -> Vec<Arc<SensorFrame>> {
        self.inner.lock().frames.clone()
    }

    pub fn source(&self) -> Source {
        self.inner.lock().source
    }

    pub fn device_id(&self) -> Option<String> {
        self.inner.lock().device_id.clone()
    }

    pub fn frame_count(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn cached_intrinsics(&self) -> Option<CameraIntrinsics> {
        self.inner.lock().cached_intrinsics.clone()
    }

    pub fn current_file(&self) -> Option<PathBuf> {
        self.inner.lock().current_file.clone()
    }

    pub fn is_replaying(&self) -> bool {
        self.inner
            .lock()
            .replay
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }

    // ── Subscribe ────────────────────────────────────────────────────────────

    /// Registers an async subscriber invoked for every subsequently pushed or
    /// replayed frame. Delivery to one subscriber is strictly in push order.
    /// Returns an unsubscribe handle.
    pub fn subscribe<F, Fut>(&self, callback: F) -> Subscription
    where
        F: Fn(Arc<SensorFrame>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<SensorFrame>>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                callback(frame).await;
            }
        });

        let mut inner = self.inner.lock();
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.push(SubscriberEntry { id, tx });
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ── Recording I/O ────────────────────────────────────────────────────────

    /// Loads all frames from a recording into memory, replacing the current
    /// session. Returns the frame count.
    pub fn load_recording(&self, path: &Path) -> HubResult<usize> {
        self.clear();
        let summary = frame_log().read_file(path)?;

        let mut inner = self.inner.lock();
        inner.current_file = Some(path.to_path_buf());
        inner.source = Source::File;
        inner.started_at = Some(Instant::now());
        for frame in summary.messages {
            if inner.device_id.is_none() {
                if let Some(id) = &frame.id {
                    if !id.device_id.is_empty() {
                        inner.device_id = Some(id.device_id.clone());
                    }
                }
            }
            if let Some(intr) = &frame.intrinsics {
                inner.cached_intrinsics = Some(intr.clone());
            }
            inner.frames.push(Arc::new(frame));
        }
        let count = inner.frames.len();
        log::info!("[Store] Loaded {} frames from {}", count, path.display());
        Ok(count)
    }

    /// Appends every buffered frame to a length-delimited recording file.
    pub fn save(&self, path: &Path) -> HubResult<usize> {
        let frames = self.all_frames();
        let count = frame_log().write_file(path, frames.iter().map(Arc::as_ref))?;
        log::info!("[Store] Saved {} frames to {}", count, path.display());
        Ok(count)
    }

    // ── Replay ───────────────────────────────────────────────────────────────

    /// Replays already-loaded frames through subscribers at timed intervals.
    /// Callers must `load_recording()` first; an empty store is a no-op.
    pub async fn start_replay(self: &Arc<Self>, speed: f64, looping: bool) {
        self.stop_replay().await;

        let frames = self.all_frames();
        if frames.is_empty() {
            return;
        }

        let cancel = CancellationToken::new();
        let store = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            store.run_replay(frames, speed, looping, token).await;
        });
        self.inner.lock().replay = Some(ReplayHandle { cancel, task });
    }

    /// Cancels a running replay task and awaits its cleanup.
    pub async fn stop_replay(&self) {
        let handle = self.inner.lock().replay.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
    }

    async fn run_replay(
        self: Arc<Self>,
        frames: Vec<Arc<SensorFrame>>,
        speed: f64,
        looping: bool,
        cancel: CancellationToken,
    ) {
        log::info!("[Store] Replay start  speed={}x  loop={}", speed, looping);
        'replay: loop {
            let mut prev_ts: Option<u64> = None;
            for frame in &frames {
                let ts = frame.id.as_ref().map(|id| id.timestamp_ns).unwrap_or(0);
                if let Some(prev) = prev_ts {
                    if ts > prev {
                        let gap = ((ts - prev) as f64 / 1e9 / speed).min(REPLAY_MAX_GAP_SECS);
                        tokio::select! {
                            _ = cancel.cancelled() => break 'replay,
                            _ = tokio::time::sleep(Duration::from_secs_f64(gap)) => {}
                        }
                    }
                }
                prev_ts = Some(ts);
                self.dispatch(Arc::clone(frame));
            }
            if !looping || cancel.is_cancelled() {
                break;
            }
        }
        log::info!("[Store] Replay done");
        let mut inner = self.inner.lock();
        if inner.source == Source::File {
            inner.source = Source::None;
        }
    }

    // ── Stats ────────────────────────────────────────────────────────────────

    /// Live wall-clock frame rate since the session started.
    pub fn fps(&self) -> f64 {
        let inner = self.inner.lock();
        match inner.started_at {
            Some(started) => {
                let elapsed = started.elapsed().as_secs_f64();
                if elapsed > 1e-3 {
                    inner.frames.len() as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    /// Native frame rate of the buffered frames, computed from first/last
    /// timestamps. Defaults to 30 when there is too little data.
    pub fn recording_fps(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.frames.len() < 2 {
            return 30.0;
        }
        let first = inner.frames[0]
            .id
            .as_ref()
            .map(|id| id.timestamp_ns)
            .unwrap_or(0);
        let last = inner.frames[inner.frames.len() - 1]
            .id
            .as_ref()
            .map(|id| id.timestamp_ns)
            .unwrap_or(0);
        let duration_s = last.saturating_sub(first) as f64 / 1e9;
        if duration_s < 1e-3 {
            return 30.0;
        }
        (inner.frames.len() - 1) as f64 / duration_s
    }

    pub fn stats(&self) -> StoreStats {
        let fps = round1(self.fps());
        let recording_fps = round1(self.recording_fps());
        let is_replaying = self.is_replaying();
        let inner = self.inner.lock();
        StoreStats {
            source: inner.source,
            device_id: inner.device_id.clone(),
            frame_count: inner.frames.len(),
            buffered_frames: inner.frames.len(),
            fps,
            recording_fps,
            is_replaying,
            intrinsics: inner.cached_intrinsics.as_ref().map(IntrinsicsSummary::from),
        }
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
