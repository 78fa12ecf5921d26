//! Protocol-level constants shared across the hub.

/// Maximum size of one serialized log record. Anything larger read from disk
/// is treated as a corruption sentinel, and the device stream never produces
/// frames beyond it.
pub const RECORD_SIZE_LIMIT: usize = 10 * 1024 * 1024;

/// Conventional suffix for frame recordings.
pub const RECORDING_EXTENSION: &str = "pb";

/// Suffix substituted onto a recording path to derive its annotation sidecar.
pub const SIDECAR_EXTENSION: &str = "seg.pb";

/// Viewer inbound read timeout. Expiry is a keepalive tick, not an error.
pub const VIEWER_READ_TIMEOUT_SECS: u64 = 30;

/// How long the annotation worker waits for the first segmentation result.
pub const RESULT_WAIT_TIMEOUT_SECS: u64 = 300;

/// Timeout for the segmentation service status probe.
pub const STATUS_PROBE_TIMEOUT_SECS: u64 = 3;

/// Timeout for opening a segmentation session and its WebSocket.
pub const SESSION_OPEN_TIMEOUT_SECS: u64 = 5;

/// Cadence of the segmentation reconnect loop.
pub const RECONNECT_INTERVAL_SECS: u64 = 5;

/// Backoff applied by the annotation worker while disconnected.
pub const DISCONNECTED_BACKOFF_SECS: u64 = 2;

/// Upper bound on the inter-frame replay sleep, so pauses in the source
/// recording don't stall playback.
pub const REPLAY_MAX_GAP_SECS: f64 = 0.5;

/// Port range scanned when no port is configured.
pub const PORT_RANGE_START: u16 = 49500;
pub const PORT_RANGE_END: u16 = 49510;
