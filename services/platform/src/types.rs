//! Core data model for detection results and upload batches.
//!
//! These types are shared between the vision pipeline (which creates
//! results), the local result store (which persists them) and the batch
//! upload coordinator (which checks them out and commits them).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Axis-aligned bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

/// Binary segmentation mask covering one detected object.
///
/// One byte per pixel, 0 = background, 255 = object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Mask {
    /// Number of foreground pixels in the mask.
    pub fn coverage(&self) -> usize {
        self.data.iter().filter(|&&p| p > 0).count()
    }
}

/// A detected object with its final (post-segmentation) confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub bbox: BoundingBox,
    pub class_name: String,
    pub confidence: f32,
}

/// Upload lifecycle of a single detection result.
///
/// Transitions move forward only: `Pending -> Reserved -> Committed` or
/// `Reserved -> Failed`. The two recovery edges back to `Pending`
/// (`Reserved -> Pending` when a batch fails, `Failed -> Pending` on
/// operator requeue) are the only exceptions; `Committed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Pending,
    Reserved,
    Committed,
    Failed,
}

impl UploadState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition(self, next: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (self, next),
            (Pending, Reserved)
                | (Reserved, Committed)
                | (Reserved, Failed)
                | (Reserved, Pending)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Committed)
    }
}

/// One detection result produced by the two-stage inference pipeline.
///
/// Immutable after creation except for `upload_state`, which only the
/// result store may advance (on behalf of the upload coordinator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub id: Uuid,
    /// Session the frame was captured under, if any. Results produced
    /// while the pipeline runs outside a maintenance session carry `None`.
    pub session_id: Option<Uuid>,
    pub device_id: String,
    /// Relative path of the media blob inside the store's data directory.
    /// Assigned by the store on insert.
    pub image_ref: String,
    pub boxes: Vec<DetectedObject>,
    /// One mask per box when stage 2 succeeded; empty otherwise.
    pub masks: Vec<Mask>,
    /// Highest final confidence among the surviving boxes.
    pub confidence: f32,
    /// False when the segmenter failed and the result was emitted degraded.
    pub stage2_ok: bool,
    pub created_at: DateTime<Utc>,
    /// Per-pipeline creation sequence, used to preserve insertion order.
    pub sequence: u64,
    pub upload_state: UploadState,
}

/// Lifecycle of an upload batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Open,
    Reserved,
    Committing,
    Committed,
    Failed,
}

impl BatchStatus {
    pub fn can_transition(self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Open, Reserved)
                | (Open, Failed)
                | (Reserved, Committing)
                | (Reserved, Failed)
                | (Committing, Committed)
                | (Committing, Failed)
        )
    }

    /// A batch still holding reservations on its results.
    pub fn is_live(self) -> bool {
        !matches!(self, BatchStatus::Committed | BatchStatus::Failed)
    }
}

/// A checked-out group of detection results committed as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadBatch {
    pub id: Uuid,
    pub result_ids: Vec<Uuid>,
    /// Client-generated token echoed to the platform so retried commits
    /// of the same batch are deduplicated server-side.
    pub checkout_token: Uuid,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
}

impl UploadBatch {
    pub fn new(result_ids: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            result_ids,
            checkout_token: Uuid::new_v4(),
            status: BatchStatus::Open,
            created_at: Utc::now(),
            committed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_state_forward_transitions() {
        use UploadState::*;
        assert!(Pending.can_transition(Reserved));
        assert!(Reserved.can_transition(Committed));
        assert!(Reserved.can_transition(Failed));
        assert!(Reserved.can_transition(Pending));
        assert!(Failed.can_transition(Pending));
    }

    #[test]
    fn test_upload_state_rejects_backward_transitions() {
        use UploadState::*;
        assert!(!Committed.can_transition(Pending));
        assert!(!Committed.can_transition(Reserved));
        assert!(!Committed.can_transition(Failed));
        assert!(!Pending.can_transition(Committed));
        assert!(!Pending.can_transition(Failed));
    }

    #[test]
    fn test_batch_status_lifecycle() {
        use BatchStatus::*;
        assert!(Open.can_transition(Reserved));
        assert!(Reserved.can_transition(Committing));
        assert!(Committing.can_transition(Committed));
        assert!(Committing.can_transition(Failed));
        assert!(!Committed.can_transition(Committing));
        assert!(!Failed.can_transition(Committing));
    }

    #[test]
    fn test_batch_liveness() {
        assert!(BatchStatus::Open.is_live());
        assert!(BatchStatus::Reserved.is_live());
        assert!(BatchStatus::Committing.is_live());
        assert!(!BatchStatus::Committed.is_live());
        assert!(!BatchStatus::Failed.is_live());
    }

    #[test]
    fn test_committed_is_the_only_terminal_state() {
        assert!(UploadState::Committed.is_terminal());
        assert!(!UploadState::Pending.is_terminal());
        assert!(!UploadState::Reserved.is_terminal());
        assert!(!UploadState::Failed.is_terminal());
    }

    #[test]
    fn test_bounding_box_area() {
        let bbox = BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 4.0,
            height: 2.5,
        };
        assert_eq!(bbox.area(), 10.0);
    }

    #[test]
    fn test_mask_coverage() {
        let mask = Mask {
            width: 2,
            height: 2,
            data: vec![0, 255, 255, 0],
        };
        assert_eq!(mask.coverage(), 2);
    }

    #[test]
    fn test_new_batch_starts_open() {
        let batch = UploadBatch::new(vec![Uuid::new_v4()]);
        assert_eq!(batch.status, BatchStatus::Open);
        assert!(batch.committed_at.is_none());
        assert_ne!(batch.id, batch.checkout_token);
    }
}
