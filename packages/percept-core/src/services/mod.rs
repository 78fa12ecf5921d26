//! Core services: the frame store, the annotator, and the segmentation
//! service client.

pub mod annotator;
pub mod frame_store;
pub mod segmentation;

pub use annotator::{sidecar_path, AnnotationSink, Annotator};
pub use frame_store::{FrameStore, Source, StoreStats, Subscription};
pub use segmentation::SegmentationClient;
