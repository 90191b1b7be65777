//! Model capability interfaces for the two-stage inference pipeline.
//!
//! Stage 1 ([`Detector`]) produces bounding boxes, stage 2 ([`Segmenter`])
//! turns each box into a mask with a refined confidence. The pipeline
//! depends only on these traits, so concrete model backends are swappable
//! without touching pipeline code.

use crate::camera::Frame;
use argus_platform::types::{BoundingBox, Mask};
use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by model inference.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model inference failed: {0}")]
    ModelFailure(String),

    #[error("invalid model input: {0}")]
    BadInput(String),
}

/// A stage-1 detection: one box with its class and raw confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_name: String,
    /// Raw detector confidence, before stage-2 refinement.
    pub confidence: f32,
}

/// A stage-2 output for one box: the mask plus a refined confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentOutput {
    pub mask: Mask,
    pub refined_confidence: f32,
}

/// Stage 1: frame to bounding boxes. An empty result is valid (no
/// objects in the frame).
#[async_trait]
pub trait Detector: Send + Sync {
    async fn infer(&self, frame: &Frame) -> Result<Vec<Detection>, InferenceError>;
}

/// Stage 2: boxes to masks, one output per input box in the same order.
#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn segment(
        &self,
        frame: &Frame,
        detections: &[Detection],
    ) -> Result<Vec<SegmentOutput>, InferenceError>;
}

/// Detector that never finds anything. The loopback-mode backend when no
/// model weights are deployed on the device.
pub struct NoopDetector;

#[async_trait]
impl Detector for NoopDetector {
    async fn infer(&self, _frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        Ok(Vec::new())
    }
}

/// Segmenter that returns a full-box mask per detection, echoing the
/// detector confidence. The loopback-mode stage-2 backend.
pub struct NoopSegmenter;

#[async_trait]
impl Segmenter for NoopSegmenter {
    async fn segment(
        &self,
        frame: &Frame,
        detections: &[Detection],
    ) -> Result<Vec<SegmentOutput>, InferenceError> {
        Ok(detections
            .iter()
            .map(|d| SegmentOutput {
                mask: full_box_mask(frame, &d.bbox),
                refined_confidence: d.confidence,
            })
            .collect())
    }
}

/// Rasterize a bounding box into a frame-sized binary mask.
pub fn full_box_mask(frame: &Frame, bbox: &BoundingBox) -> Mask {
    let width = frame.width;
    let height = frame.height;
    let mut data = vec![0u8; (width * height) as usize];

    let x0 = bbox.x.max(0.0) as u32;
    let y0 = bbox.y.max(0.0) as u32;
    let x1 = ((bbox.x + bbox.width).max(0.0) as u32).min(width);
    let y1 = ((bbox.y + bbox.height).max(0.0) as u32).min(height);

    for y in y0..y1 {
        for x in x0..x1 {
            data[(y * width + x) as usize] = 255;
        }
    }

    Mask {
        width,
        height,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Instant;

    fn test_frame(width: u32, height: u32) -> Frame {
        Frame {
            data: Bytes::from(vec![0u8; (width * height * 3) as usize]),
            width,
            height,
            pixel_format: "RGB24".to_string(),
            sequence: 0,
            captured_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_noop_detector_finds_nothing() {
        let frame = test_frame(8, 8);
        let detections = NoopDetector.infer(&frame).await.unwrap();
        assert!(detections.is_empty());
    }

    #[tokio::test]
    async fn test_noop_segmenter_one_output_per_box() {
        let frame = test_frame(8, 8);
        let detections = vec![
            Detection {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 4.0,
                    height: 4.0,
                },
                class_name: "a".to_string(),
                confidence: 0.9,
            },
            Detection {
                bbox: BoundingBox {
                    x: 4.0,
                    y: 4.0,
                    width: 4.0,
                    height: 4.0,
                },
                class_name: "b".to_string(),
                confidence: 0.6,
            },
        ];

        let outputs = NoopSegmenter.segment(&frame, &detections).await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].refined_confidence, 0.9);
        assert_eq!(outputs[1].refined_confidence, 0.6);
    }

    #[test]
    fn test_full_box_mask_coverage() {
        let frame = test_frame(8, 8);
        let mask = full_box_mask(
            &frame,
            &BoundingBox {
                x: 2.0,
                y: 2.0,
                width: 4.0,
                height: 4.0,
            },
        );
        assert_eq!(mask.coverage(), 16);
        assert_eq!(mask.width, 8);
    }

    #[test]
    fn test_full_box_mask_clamps_to_frame() {
        let frame = test_frame(8, 8);
        let mask = full_box_mask(
            &frame,
            &BoundingBox {
                x: 6.0,
                y: 6.0,
                width: 10.0,
                height: 10.0,
            },
        );
        assert_eq!(mask.coverage(), 4);
    }
}
