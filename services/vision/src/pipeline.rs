//! Two-stage detection pipeline over a bounded frame queue.
//!
//! A capture producer reads frames from the camera handle into a bounded
//! queue; N workers pop frames, run the detector and then the segmenter,
//! and persist surviving results into the local store. The queue drops the
//! *oldest* frame on overflow: for a real-time feed an unprocessed old
//! frame is worthless, and the capture side must never block.
//!
//! The pipeline is gated by a lane: the session manager resumes it with a
//! camera handle when a session opens and pauses it when the session
//! closes. Pausing refuses new frames immediately but lets inference that
//! already started finish and store its result.

use crate::camera::{CameraHandle, Frame};
use crate::config::PipelineConfig;
use crate::model::{Detection, Detector, Segmenter};
use argus_platform::status_sync::PlatformStatusSync;
use argus_platform::store::LocalResultStore;
use argus_platform::types::{DetectedObject, DetectionResult, Mask, UploadState};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors raised by pipeline lane management.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("a pipeline lane is already active")]
    LaneActive,
}

/// A frame queued for inference, tagged with the lane that accepted it.
#[derive(Debug, Clone)]
pub struct TaggedFrame {
    pub frame: Frame,
    pub session_id: Option<Uuid>,
    pub lane_epoch: u64,
}

/// Outcome of pushing a frame into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; the oldest frame was evicted to make room.
    EvictedOldest,
    /// The queue is closed; the frame was refused.
    Refused,
}

struct QueueInner {
    frames: VecDeque<TaggedFrame>,
    closed: bool,
}

/// Bounded frame queue with drop-oldest overflow.
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Push a frame; never blocks the producer.
    pub fn push(&self, tagged: TaggedFrame) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Refused;
            }
            let outcome = if inner.frames.len() >= self.capacity {
                inner.frames.pop_front();
                PushOutcome::EvictedOldest
            } else {
                PushOutcome::Queued
            };
            inner.frames.push_back(tagged);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Pop the next frame, waiting when the queue is empty. Returns `None`
    /// once the queue is closed and drained.
    pub async fn pop(&self) -> Option<TaggedFrame> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(frame) = inner.frames.pop_front() {
                    // Wake a sibling in case more frames are queued.
                    self.notify.notify_one();
                    return Some(frame);
                }
                if inner.closed {
                    self.notify.notify_one();
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Statistics for the pipeline.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct PipelineStats {
    pub frames_processed: u64,
    /// Oldest-frame evictions under backpressure.
    pub frames_dropped: u64,
    /// Frames discarded because their lane closed before inference began.
    pub stale_frames: u64,
    pub empty_frames: u64,
    pub results_stored: u64,
    pub stage1_failures: u64,
    /// Results emitted degraded because stage 2 failed.
    pub stage2_degraded: u64,
    pub boxes_below_threshold: u64,
    /// Frames whose every box fell below the threshold.
    pub filtered_out_frames: u64,
    pub capture_errors: u64,
}

struct Lane {
    session_id: Option<Uuid>,
    cancel: CancellationToken,
    handle_slot: Arc<AsyncMutex<Option<CameraHandle>>>,
    capture_task: JoinHandle<()>,
}

/// Two-stage detection pipeline: detector, then segmenter, then store.
pub struct DetectionPipeline {
    detector: Arc<dyn Detector>,
    segmenter: Arc<dyn Segmenter>,
    store: Arc<LocalResultStore>,
    sync: Arc<PlatformStatusSync>,
    device_id: String,
    config: PipelineConfig,
    queue: Arc<FrameQueue>,
    lane: AsyncMutex<Option<Lane>>,
    lane_epoch: Arc<AtomicU64>,
    result_seq: Arc<AtomicU64>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<RwLock<PipelineStats>>,
}

impl DetectionPipeline {
    pub fn new(
        detector: Arc<dyn Detector>,
        segmenter: Arc<dyn Segmenter>,
        store: Arc<LocalResultStore>,
        sync: Arc<PlatformStatusSync>,
        device_id: impl Into<String>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let queue = Arc::new(FrameQueue::new(config.queue_capacity));
        Arc::new(Self {
            detector,
            segmenter,
            store,
            sync,
            device_id: device_id.into(),
            config,
            queue,
            lane: AsyncMutex::new(None),
            lane_epoch: Arc::new(AtomicU64::new(0)),
            result_seq: Arc::new(AtomicU64::new(0)),
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            stats: Arc::new(RwLock::new(PipelineStats::default())),
        })
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn is_lane_active(&self) -> bool {
        self.lane.lock().await.is_some()
    }

    /// Spawn the inference workers. Idempotent per process lifetime; the
    /// workers exit once [`Self::shutdown`] closes the queue.
    pub fn spawn_workers(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock();
        for worker_id in 0..self.config.num_workers {
            let pipeline = self.clone();
            workers.push(tokio::spawn(async move {
                debug!(worker_id, "Pipeline worker started");
                while let Some(tagged) = pipeline.queue.pop().await {
                    pipeline.process_frame(tagged).await;
                }
                debug!(worker_id, "Pipeline worker stopped");
            }));
        }
        info!(
            workers = self.config.num_workers,
            queue_capacity = self.config.queue_capacity,
            "Detection pipeline started"
        );
    }

    /// Close the queue; workers drain what is left and exit.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.close();
    }

    /// Open a pipeline lane: start capturing frames from `handle` under
    /// the given session (or none, for out-of-session operation).
    pub async fn resume(
        self: &Arc<Self>,
        session_id: Option<Uuid>,
        handle: CameraHandle,
    ) -> Result<(), PipelineError> {
        let mut lane = self.lane.lock().await;
        if lane.is_some() {
            return Err(PipelineError::LaneActive);
        }

        let epoch = self.lane_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let handle_slot = Arc::new(AsyncMutex::new(Some(handle)));

        let capture_task = tokio::spawn(Self::capture_loop(
            self.queue.clone(),
            handle_slot.clone(),
            cancel.clone(),
            epoch,
            session_id,
            self.stats.clone(),
        ));

        *lane = Some(Lane {
            session_id,
            cancel,
            handle_slot,
            capture_task,
        });

        info!(session_id = ?session_id, epoch, "Pipeline lane resumed");
        Ok(())
    }

    /// Close the active lane and hand the camera handle back.
    ///
    /// New frames are refused immediately (queued frames of the closed
    /// lane are discarded at dequeue time), but inference that already
    /// started is left to finish and store its result.
    pub async fn pause(&self) -> Option<CameraHandle> {
        let mut lane_guard = self.lane.lock().await;
        let lane = lane_guard.take()?;

        lane.cancel.cancel();
        // Invalidate frames the closed lane already queued.
        self.lane_epoch.fetch_add(1, Ordering::SeqCst);

        let _ = lane.capture_task.await;
        let handle = lane.handle_slot.lock().await.take();

        info!(session_id = ?lane.session_id, "Pipeline lane paused");
        handle
    }

    async fn capture_loop(
        queue: Arc<FrameQueue>,
        handle_slot: Arc<AsyncMutex<Option<CameraHandle>>>,
        cancel: CancellationToken,
        epoch: u64,
        session_id: Option<Uuid>,
        stats: Arc<RwLock<PipelineStats>>,
    ) {
        loop {
            let read = async {
                let guard = handle_slot.lock().await;
                match guard.as_ref() {
                    Some(handle) => handle.read_frame().await,
                    None => Ok(None),
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = read => match result {
                    Ok(Some(frame)) => {
                        let outcome = queue.push(TaggedFrame {
                            frame,
                            session_id,
                            lane_epoch: epoch,
                        });
                        match outcome {
                            PushOutcome::Queued => {}
                            PushOutcome::EvictedOldest => {
                                stats.write().frames_dropped += 1;
                                metrics::counter!("pipeline.frames.dropped").increment(1);
                                debug!("Frame queue full, oldest frame dropped");
                            }
                            PushOutcome::Refused => break,
                        }
                    }
                    Ok(None) => {
                        info!("Camera end of stream");
                        break;
                    }
                    Err(e) => {
                        stats.write().capture_errors += 1;
                        warn!(error = %e, "Frame capture failed, stopping lane capture");
                        break;
                    }
                }
            }
        }
    }

    async fn process_frame(&self, tagged: TaggedFrame) {
        // A closed lane's frames are discarded here; inference that is
        // already past this point runs to completion.
        if tagged.lane_epoch != self.lane_epoch.load(Ordering::SeqCst) {
            self.stats.write().stale_frames += 1;
            return;
        }

        let TaggedFrame {
            frame, session_id, ..
        } = tagged;

        let detections = match self.detector.infer(&frame).await {
            Ok(detections) => detections,
            Err(e) => {
                self.stats.write().stage1_failures += 1;
                warn!(sequence = frame.sequence, error = %e, "Stage-1 inference failed, frame skipped");
                return;
            }
        };
        self.stats.write().frames_processed += 1;

        if detections.is_empty() {
            self.stats.write().empty_frames += 1;
            return;
        }

        let threshold = self.sync.current_config().confidence_threshold;

        let (boxes, masks, stage2_ok) = match self.segmenter.segment(&frame, &detections).await {
            Ok(outputs) if outputs.len() == detections.len() => {
                let mut boxes = Vec::new();
                let mut masks = Vec::new();
                for (detection, output) in detections.iter().zip(outputs) {
                    // Conservative combine: a weak stage-2 result must not
                    // inflate a weak stage-1 box.
                    let confidence = detection.confidence.min(output.refined_confidence);
                    if confidence < threshold {
                        self.stats.write().boxes_below_threshold += 1;
                        continue;
                    }
                    boxes.push(DetectedObject {
                        bbox: detection.bbox,
                        class_name: detection.class_name.clone(),
                        confidence,
                    });
                    masks.push(output.mask);
                }
                (boxes, masks, true)
            }
            Ok(outputs) => {
                warn!(
                    expected = detections.len(),
                    produced = outputs.len(),
                    "Segmenter output arity mismatch, emitting degraded result"
                );
                self.degrade(&detections, threshold)
            }
            Err(e) => {
                warn!(sequence = frame.sequence, error = %e, "Stage-2 inference failed, emitting degraded result");
                self.degrade(&detections, threshold)
            }
        };

        if boxes.is_empty() {
            self.stats.write().filtered_out_frames += 1;
            return;
        }

        let confidence = boxes.iter().map(|b| b.confidence).fold(0.0f32, f32::max);
        let result = DetectionResult {
            id: Uuid::new_v4(),
            session_id,
            device_id: self.device_id.clone(),
            image_ref: String::new(),
            boxes,
            masks,
            confidence,
            stage2_ok,
            created_at: Utc::now(),
            sequence: self.result_seq.fetch_add(1, Ordering::SeqCst),
            upload_state: UploadState::Pending,
        };

        match self.store.insert(result, &frame.data) {
            Ok(id) => {
                self.stats.write().results_stored += 1;
                metrics::counter!("pipeline.results.stored").increment(1);
                debug!(result_id = %id, confidence, stage2_ok, "Detection result stored");
            }
            Err(e) => {
                error!(error = %e, "Failed to store detection result");
            }
        }
    }

    /// Stage-2 failure path: keep every box, scale its raw confidence by
    /// the degradation factor, attach no masks. Never drop the frame.
    fn degrade(
        &self,
        detections: &[Detection],
        threshold: f32,
    ) -> (Vec<DetectedObject>, Vec<Mask>, bool) {
        self.stats.write().stage2_degraded += 1;
        let mut boxes = Vec::new();
        for detection in detections {
            let confidence = detection.confidence * self.config.degradation_factor;
            if confidence < threshold {
                self.stats.write().boxes_below_threshold += 1;
                continue;
            }
            boxes.push(DetectedObject {
                bbox: detection.bbox,
                class_name: detection.class_name.clone(),
                confidence,
            });
        }
        (boxes, Vec::new(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Camera, SyntheticCamera};
    use crate::config::CameraConfig;
    use crate::model::{full_box_mask, InferenceError, SegmentOutput};
    use argus_platform::client::{
        BatchUploadAck, BatchUploadRequest, DeviceConfig, Endpoint, PlatformClient,
        PlatformError, StatusUpdate,
    };
    use argus_platform::status_sync::StatusSyncConfig;
    use argus_platform::types::BoundingBox;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct IdleClient;

    #[async_trait]
    impl PlatformClient for IdleClient {
        async fn push_status(
            &self,
            _endpoint: &Endpoint,
            _update: &StatusUpdate,
        ) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn fetch_config(
            &self,
            _endpoint: &Endpoint,
            _device_id: &str,
        ) -> Result<DeviceConfig, PlatformError> {
            Err(PlatformError::Transient("offline".into()))
        }

        async fn upload_batch(
            &self,
            _endpoint: &Endpoint,
            payload: &BatchUploadRequest,
        ) -> Result<BatchUploadAck, PlatformError> {
            Ok(BatchUploadAck {
                batch_id: payload.batch_id,
                accepted: payload.results.len(),
            })
        }
    }

    /// Detector returning a fixed set of boxes for every frame.
    struct ScriptedDetector {
        detections: Vec<Detection>,
    }

    #[async_trait]
    impl Detector for ScriptedDetector {
        async fn infer(&self, _frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
            Ok(self.detections.clone())
        }
    }

    /// Segmenter returning scripted refined confidences, or failing.
    struct ScriptedSegmenter {
        refined: Vec<f32>,
        fail: bool,
    }

    #[async_trait]
    impl Segmenter for ScriptedSegmenter {
        async fn segment(
            &self,
            frame: &Frame,
            detections: &[Detection],
        ) -> Result<Vec<SegmentOutput>, InferenceError> {
            if self.fail {
                return Err(InferenceError::ModelFailure("segmenter crashed".into()));
            }
            Ok(detections
                .iter()
                .zip(self.refined.iter())
                .map(|(d, &refined_confidence)| SegmentOutput {
                    mask: full_box_mask(frame, &d.bbox),
                    refined_confidence,
                })
                .collect())
        }
    }

    fn detection(confidence: f32) -> Detection {
        Detection {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 8.0,
                height: 8.0,
            },
            class_name: "crate".to_string(),
            confidence,
        }
    }

    fn test_frame() -> Frame {
        Frame {
            data: Bytes::from(vec![100u8; 16 * 16 * 3]),
            width: 16,
            height: 16,
            pixel_format: "RGB24".to_string(),
            sequence: 0,
            captured_at: Instant::now(),
        }
    }

    fn sync_with_threshold(threshold: f32) -> Arc<PlatformStatusSync> {
        PlatformStatusSync::new(
            StatusSyncConfig {
                device_id: "edge-001".to_string(),
                primary: Endpoint::new("primary", "http://platform.local"),
                fallback: None,
                failover_threshold: 100,
                push_base_delay: Duration::from_millis(5),
                push_max_delay: Duration::from_millis(20),
                config_refresh_interval: Duration::from_secs(3600),
                initial_config: DeviceConfig {
                    confidence_threshold: threshold,
                    config_version: 0,
                },
            },
            Arc::new(IdleClient),
        )
    }

    fn pipeline_with(
        dir: &TempDir,
        detector: ScriptedDetector,
        segmenter: ScriptedSegmenter,
        threshold: f32,
    ) -> (Arc<DetectionPipeline>, Arc<LocalResultStore>) {
        let store = Arc::new(LocalResultStore::open(dir.path()).unwrap());
        let pipeline = DetectionPipeline::new(
            Arc::new(detector),
            Arc::new(segmenter),
            store.clone(),
            sync_with_threshold(threshold),
            "edge-001",
            PipelineConfig {
                queue_capacity: 8,
                num_workers: 2,
                degradation_factor: 0.5,
            },
        );
        (pipeline, store)
    }

    fn tagged(frame: Frame) -> TaggedFrame {
        TaggedFrame {
            frame,
            session_id: None,
            lane_epoch: 0,
        }
    }

    #[test]
    fn test_queue_drops_oldest_on_overflow() {
        let queue = FrameQueue::new(3);
        for sequence in 0..5u64 {
            let mut frame = test_frame();
            frame.sequence = sequence;
            let outcome = queue.push(tagged(frame));
            if sequence < 3 {
                assert_eq!(outcome, PushOutcome::Queued);
            } else {
                assert_eq!(outcome, PushOutcome::EvictedOldest);
            }
        }
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_queue_pop_preserves_order_after_eviction() {
        let queue = FrameQueue::new(2);
        for sequence in 0..4u64 {
            let mut frame = test_frame();
            frame.sequence = sequence;
            queue.push(tagged(frame));
        }
        // Frames 0 and 1 were evicted.
        assert_eq!(queue.pop().await.unwrap().frame.sequence, 2);
        assert_eq!(queue.pop().await.unwrap().frame.sequence, 3);

        queue.close();
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_both_stages_succeed_min_combine_and_filter() {
        // Three boxes: 0.9/0.8 -> 0.8 kept, 0.7/0.9 -> 0.7 kept,
        // 0.6/0.3 -> 0.3 dropped at threshold 0.5.
        let dir = TempDir::new().unwrap();
        let (pipeline, store) = pipeline_with(
            &dir,
            ScriptedDetector {
                detections: vec![detection(0.9), detection(0.7), detection(0.6)],
            },
            ScriptedSegmenter {
                refined: vec![0.8, 0.9, 0.3],
                fail: false,
            },
            0.5,
        );

        pipeline.process_frame(tagged(test_frame())).await;

        let pending = store.pending();
        assert_eq!(pending.len(), 1);
        let result = &pending[0];
        assert!(result.stage2_ok);
        assert_eq!(result.boxes.len(), 2);
        assert_eq!(result.masks.len(), 2);
        assert_eq!(result.boxes[0].confidence, 0.8);
        assert_eq!(result.boxes[1].confidence, 0.7);
        assert_eq!(result.confidence, 0.8);
        assert_eq!(pipeline.stats().boxes_below_threshold, 1);
    }

    #[tokio::test]
    async fn test_segmenter_failure_emits_degraded_result() {
        // raw 0.9 * degradation 0.5 = 0.45, kept at threshold 0.4.
        let dir = TempDir::new().unwrap();
        let (pipeline, store) = pipeline_with(
            &dir,
            ScriptedDetector {
                detections: vec![detection(0.9)],
            },
            ScriptedSegmenter {
                refined: vec![],
                fail: true,
            },
            0.4,
        );

        pipeline.process_frame(tagged(test_frame())).await;

        let pending = store.pending();
        assert_eq!(pending.len(), 1, "degraded result must never be dropped");
        let result = &pending[0];
        assert!(!result.stage2_ok);
        assert!(result.masks.is_empty());
        assert!((result.confidence - 0.45).abs() < 1e-6);
        assert_eq!(pipeline.stats().stage2_degraded, 1);
    }

    #[tokio::test]
    async fn test_empty_detection_is_valid_and_stores_nothing() {
        let dir = TempDir::new().unwrap();
        let (pipeline, store) = pipeline_with(
            &dir,
            ScriptedDetector { detections: vec![] },
            ScriptedSegmenter {
                refined: vec![],
                fail: false,
            },
            0.5,
        );

        pipeline.process_frame(tagged(test_frame())).await;

        assert!(store.pending().is_empty());
        assert_eq!(pipeline.stats().empty_frames, 1);
    }

    #[tokio::test]
    async fn test_all_boxes_below_threshold_stores_nothing() {
        let dir = TempDir::new().unwrap();
        let (pipeline, store) = pipeline_with(
            &dir,
            ScriptedDetector {
                detections: vec![detection(0.3)],
            },
            ScriptedSegmenter {
                refined: vec![0.2],
                fail: false,
            },
            0.5,
        );

        pipeline.process_frame(tagged(test_frame())).await;

        assert!(store.pending().is_empty());
        assert_eq!(pipeline.stats().filtered_out_frames, 1);
    }

    #[tokio::test]
    async fn test_stale_lane_frames_discarded() {
        let dir = TempDir::new().unwrap();
        let (pipeline, store) = pipeline_with(
            &dir,
            ScriptedDetector {
                detections: vec![detection(0.9)],
            },
            ScriptedSegmenter {
                refined: vec![0.9],
                fail: false,
            },
            0.5,
        );

        // The frame was accepted by an older lane epoch.
        pipeline.lane_epoch.store(3, Ordering::SeqCst);
        let mut stale = tagged(test_frame());
        stale.lane_epoch = 2;
        pipeline.process_frame(stale).await;

        assert!(store.pending().is_empty());
        assert_eq!(pipeline.stats().stale_frames, 1);
    }

    #[tokio::test]
    async fn test_resume_capture_pause_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (pipeline, store) = pipeline_with(
            &dir,
            ScriptedDetector {
                detections: vec![detection(0.9)],
            },
            ScriptedSegmenter {
                refined: vec![0.9],
                fail: false,
            },
            0.5,
        );
        pipeline.spawn_workers();

        let camera = Camera::new(
            Box::new(SyntheticCamera::new(
                16,
                16,
                Duration::from_millis(2),
                Some(3),
            )),
            CameraConfig {
                open_max_attempts: 3,
                open_base_delay_ms: 1,
                open_max_delay_ms: 5,
            },
        );
        let handle = camera.acquire().await.unwrap();

        let session_id = Uuid::new_v4();
        pipeline.resume(Some(session_id), handle).await.unwrap();
        assert!(pipeline.is_lane_active().await);

        // A second resume while the lane is open must be refused.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let handle = pipeline.pause().await.expect("handle returned on pause");
        handle.release().await;
        assert!(!camera.is_held());
        assert!(!pipeline.is_lane_active().await);

        let pending = store.pending();
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|r| r.session_id == Some(session_id)));

        pipeline.shutdown();
    }

    #[tokio::test]
    async fn test_second_resume_rejected_while_lane_active() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _store) = pipeline_with(
            &dir,
            ScriptedDetector { detections: vec![] },
            ScriptedSegmenter {
                refined: vec![],
                fail: false,
            },
            0.5,
        );

        let camera = Camera::new(
            Box::new(SyntheticCamera::new(16, 16, Duration::from_millis(5), None)),
            CameraConfig {
                open_max_attempts: 3,
                open_base_delay_ms: 1,
                open_max_delay_ms: 5,
            },
        );
        let first = camera.acquire().await.unwrap();
        pipeline.resume(None, first).await.unwrap();

        let second_camera = Camera::new(
            Box::new(SyntheticCamera::new(16, 16, Duration::from_millis(5), None)),
            CameraConfig {
                open_max_attempts: 3,
                open_base_delay_ms: 1,
                open_max_delay_ms: 5,
            },
        );
        let second = second_camera.acquire().await.unwrap();
        let err = pipeline.resume(None, second).await.unwrap_err();
        assert!(matches!(err, PipelineError::LaneActive));

        if let Some(handle) = pipeline.pause().await {
            handle.release().await;
        }
    }
}
