//! Configuration for the camera and detection pipeline.

use serde::Deserialize;
use std::time::Duration;

/// Vision-side configuration of the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    /// Maximum queue size for frames pending inference.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of inference workers consuming the frame queue.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Confidence multiplier applied when stage 2 fails (must be < 1).
    #[serde(default = "default_degradation_factor")]
    pub degradation_factor: f32,

    /// Camera acquisition behaviour.
    #[serde(default)]
    pub camera: CameraConfig,

    /// Synthetic frame source used in loopback mode.
    #[serde(default)]
    pub synthetic: SyntheticConfig,
}

/// Camera open/retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Maximum attempts to open the camera driver.
    #[serde(default = "default_open_max_attempts")]
    pub open_max_attempts: u32,

    /// Base delay between open attempts in milliseconds.
    #[serde(default = "default_open_base_delay_ms")]
    pub open_base_delay_ms: u64,

    /// Maximum delay between open attempts in milliseconds.
    #[serde(default = "default_open_max_delay_ms")]
    pub open_max_delay_ms: u64,
}

/// Synthetic camera settings for running without hardware.
#[derive(Debug, Clone, Deserialize)]
pub struct SyntheticConfig {
    #[serde(default = "default_synthetic_width")]
    pub width: u32,

    #[serde(default = "default_synthetic_height")]
    pub height: u32,

    /// Delay between synthetic frames in milliseconds.
    #[serde(default = "default_synthetic_interval_ms")]
    pub frame_interval_ms: u64,
}

/// Pipeline knobs handed to [`crate::pipeline::DetectionPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub num_workers: usize,
    pub degradation_factor: f32,
}

fn default_queue_capacity() -> usize {
    64
}
fn default_num_workers() -> usize {
    2
}
fn default_degradation_factor() -> f32 {
    0.5
}
fn default_open_max_attempts() -> u32 {
    3
}
fn default_open_base_delay_ms() -> u64 {
    250
}
fn default_open_max_delay_ms() -> u64 {
    2000
}
fn default_synthetic_width() -> u32 {
    640
}
fn default_synthetic_height() -> u32 {
    480
}
fn default_synthetic_interval_ms() -> u64 {
    100
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            open_max_attempts: default_open_max_attempts(),
            open_base_delay_ms: default_open_base_delay_ms(),
            open_max_delay_ms: default_open_max_delay_ms(),
        }
    }
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: default_synthetic_width(),
            height: default_synthetic_height(),
            frame_interval_ms: default_synthetic_interval_ms(),
        }
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            num_workers: default_num_workers(),
            degradation_factor: default_degradation_factor(),
            camera: CameraConfig::default(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl CameraConfig {
    pub fn open_base_delay(&self) -> Duration {
        Duration::from_millis(self.open_base_delay_ms)
    }

    pub fn open_max_delay(&self) -> Duration {
        Duration::from_millis(self.open_max_delay_ms)
    }
}

impl SyntheticConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl VisionConfig {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            queue_capacity: self.queue_capacity,
            num_workers: self.num_workers,
            degradation_factor: self.degradation_factor,
        }
    }

    pub fn validate(&self) -> Result<(), VisionConfigError> {
        if self.queue_capacity == 0 {
            return Err(VisionConfigError::InvalidValue {
                field: "vision.queue_capacity",
                message: "must be at least 1".to_string(),
            });
        }
        if self.num_workers == 0 {
            return Err(VisionConfigError::InvalidValue {
                field: "vision.num_workers",
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.degradation_factor) {
            return Err(VisionConfigError::InvalidValue {
                field: "vision.degradation_factor",
                message: "must be within [0, 1)".to_string(),
            });
        }
        if self.camera.open_max_attempts == 0 {
            return Err(VisionConfigError::InvalidValue {
                field: "vision.camera.open_max_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Vision configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum VisionConfigError {
    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}
