//! Argus vision services - camera handling and two-stage detection.
//!
//! The capture side ([`camera::Camera`]) hands out an exclusive handle
//! over a pluggable [`camera::FrameSource`] driver; the inference side
//! ([`pipeline::DetectionPipeline`]) consumes frames through a bounded
//! drop-oldest queue, runs the detector and segmenter behind the
//! [`model::Detector`] / [`model::Segmenter`] capability traits, and
//! persists surviving results into the platform crate's result store.

pub mod camera;
pub mod config;
pub mod model;
pub mod pipeline;

// Re-export main types
pub use camera::{Camera, CameraError, CameraHandle, CameraStats, Frame, FrameSource, SyntheticCamera};
pub use config::{CameraConfig, PipelineConfig, SyntheticConfig, VisionConfig, VisionConfigError};
pub use model::{
    Detection, Detector, InferenceError, NoopDetector, NoopSegmenter, SegmentOutput, Segmenter,
};
pub use pipeline::{DetectionPipeline, FrameQueue, PipelineError, PipelineStats, PushOutcome, TaggedFrame};
