//! Wire message types for the device stream and the segmentation protocol.
//!
//! These are hand-written prost structs rather than build-script output so the
//! wire layout is reviewable in one place. Tags are frozen: recordings on disk
//! depend on them.

use bytes::Bytes;

/// Correlation key shared by frames and annotations: `(timestamp_ns, frame_number)`.
///
/// `device_id` is informational and intentionally not part of the key.
pub type FrameKey = (u64, u64);

/// Identity of a single frame within a session.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FrameId {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(uint64, tag = "2")]
    pub frame_number: u64,
    #[prost(uint64, tag = "3")]
    pub timestamp_ns: u64,
}

impl FrameId {
    /// Returns the correlation key for annotation lookup.
    pub fn key(&self) -> FrameKey {
        (self.timestamp_ns, self.frame_number)
    }
}

/// Encoding of an image payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ImageFormat {
    Jpeg = 0,
    Rgb888 = 1,
}

/// Encoding of a depth payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum DepthFormat {
    /// 32-bit float meters, row-major.
    F32Meters = 0,
    /// 16-bit unsigned millimeters, row-major.
    U16Millimeters = 1,
}

/// A camera image payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ImageFrame {
    #[prost(enumeration = "ImageFormat", tag = "1")]
    pub format: i32,
    #[prost(bytes = "bytes", tag = "2")]
    pub data: Bytes,
    #[prost(uint32, tag = "3")]
    pub width: u32,
    #[prost(uint32, tag = "4")]
    pub height: u32,
}

/// A depth map payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DepthFrame {
    #[prost(enumeration = "DepthFormat", tag = "1")]
    pub format: i32,
    #[prost(bytes = "bytes", tag = "2")]
    pub data: Bytes,
}

/// Pinhole camera intrinsics, carried once per session on the first frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CameraIntrinsics {
    #[prost(float, tag = "1")]
    pub fx: f32,
    #[prost(float, tag = "2")]
    pub fy: f32,
    #[prost(float, tag = "3")]
    pub cx: f32,
    #[prost(float, tag = "4")]
    pub cy: f32,
    #[prost(uint32, tag = "5")]
    pub image_width: u32,
    #[prost(uint32, tag = "6")]
    pub image_height: u32,
    #[prost(uint32, tag = "7")]
    pub depth_width: u32,
    #[prost(uint32, tag = "8")]
    pub depth_height: u32,
}

/// Device pose in world coordinates: translation + unit quaternion.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CameraPose {
    #[prost(float, tag = "1")]
    pub tx: f32,
    #[prost(float, tag = "2")]
    pub ty: f32,
    #[prost(float, tag = "3")]
    pub tz: f32,
    #[prost(float, tag = "4")]
    pub qx: f32,
    #[prost(float, tag = "5")]
    pub qy: f32,
    #[prost(float, tag = "6")]
    pub qz: f32,
    #[prost(float, tag = "7")]
    pub qw: f32,
}

/// One inertial sample accompanying a frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ImuSample {
    #[prost(float, tag = "1")]
    pub accel_x: f32,
    #[prost(float, tag = "2")]
    pub accel_y: f32,
    #[prost(float, tag = "3")]
    pub accel_z: f32,
    #[prost(float, tag = "4")]
    pub gyro_x: f32,
    #[prost(float, tag = "5")]
    pub gyro_y: f32,
    #[prost(float, tag = "6")]
    pub gyro_z: f32,
    #[prost(uint64, tag = "7")]
    pub timestamp_ns: u64,
}

/// The atomic unit of the live stream: one per-frame message from a device.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SensorFrame {
    #[prost(message, optional, tag = "1")]
    pub id: Option<FrameId>,
    #[prost(message, optional, tag = "2")]
    pub image: Option<ImageFrame>,
    #[prost(message, optional, tag = "3")]
    pub depth: Option<DepthFrame>,
    #[prost(message, optional, tag = "4")]
    pub intrinsics: Option<CameraIntrinsics>,
    #[prost(message, optional, tag = "5")]
    pub pose: Option<CameraPose>,
    #[prost(message, optional, tag = "6")]
    pub imu: Option<ImuSample>,
}

impl SensorFrame {
    /// Correlation key of this frame. Frames without an identifier map to the
    /// zero key; well-formed producers always carry one.
    pub fn key(&self) -> FrameKey {
        self.id.as_ref().map(FrameId::key).unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Segmentation protocol
// ─────────────────────────────────────────────────────────────────────────────

/// What caused the segmentation service to produce an annotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum TriggerType {
    PointPrompt = 0,
    TextPrompt = 1,
    AutoGrid = 2,
    Propagated = 3,
}

/// Request sent to the segmentation service: identifier plus the image only.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SegmentRequest {
    #[prost(message, optional, tag = "1")]
    pub id: Option<FrameId>,
    #[prost(message, optional, tag = "2")]
    pub image: Option<ImageFrame>,
}

/// A single segmented object within an annotation.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MaskAnnotation {
    #[prost(uint32, tag = "1")]
    pub object_id: u32,
    #[prost(bytes = "bytes", tag = "2")]
    pub mask_data: Bytes,
    #[prost(uint32, tag = "3")]
    pub pixel_count: u32,
    #[prost(float, tag = "4")]
    pub confidence: f32,
}

/// Annotation returned by the segmentation service, keyed by the same
/// identifier as the originating frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SegmentResponse {
    #[prost(message, optional, tag = "1")]
    pub id: Option<FrameId>,
    #[prost(enumeration = "TriggerType", tag = "2")]
    pub trigger: i32,
    #[prost(message, repeated, tag = "3")]
    pub masks: Vec<MaskAnnotation>,
}

impl SegmentResponse {
    pub fn key(&self) -> FrameKey {
        self.id.as_ref().map(FrameId::key).unwrap_or_default()
    }
}
