//! Batch checkout and commit of pending detection results.
//!
//! Checkout reserves results into a batch (single or bulk); commit uploads
//! the batch to the platform with bounded retry and only deletes local
//! media after the platform acknowledged the whole batch. A failed commit
//! releases the results back to `Pending` and preserves their media for
//! operator inspection.

use crate::client::{BatchUploadAck, BatchUploadRequest, PlatformClient, UploadedResult};
use crate::status_sync::PlatformStatusSync;
use crate::store::{LocalResultStore, StoreError};
use crate::types::{BatchStatus, UploadBatch};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Errors surfaced by checkout and commit operations.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// The requested results overlap a live reservation, or the batch is
    /// not in a committable state. Never retried automatically.
    #[error("checkout conflict: {0}")]
    Conflict(String),

    #[error("no pending results to check out")]
    NothingPending,

    #[error("a commit is already in flight for batch {0}")]
    CommitInFlight(Uuid),

    #[error("unknown batch: {0}")]
    UnknownBatch(Uuid),

    #[error("batch {batch_id} failed after {attempts} attempts: {last_error}")]
    UploadFailed {
        batch_id: Uuid,
        attempts: u32,
        last_error: String,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for CheckoutError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { id, state, action } => CheckoutError::Conflict(format!(
                "result {} is {:?}, cannot {}",
                id, state, action
            )),
            other => CheckoutError::Store(other),
        }
    }
}

/// Retry policy for batch commits.
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Counters describing coordinator activity.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct CheckoutStats {
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub results_committed: u64,
    pub results_unuploadable: u64,
    pub upload_attempts: u64,
}

/// Groups pending results into batches and commits them to the platform.
pub struct BatchUploadCoordinator {
    store: Arc<LocalResultStore>,
    sync: Arc<PlatformStatusSync>,
    client: Arc<dyn PlatformClient>,
    config: CheckoutConfig,
    device_id: String,
    in_flight: Mutex<HashSet<Uuid>>,
    stats: RwLock<CheckoutStats>,
}

impl BatchUploadCoordinator {
    pub fn new(
        store: Arc<LocalResultStore>,
        sync: Arc<PlatformStatusSync>,
        client: Arc<dyn PlatformClient>,
        config: CheckoutConfig,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            sync,
            client,
            config,
            device_id: device_id.into(),
            in_flight: Mutex::new(HashSet::new()),
            stats: RwLock::new(CheckoutStats::default()),
        }
    }

    pub fn stats(&self) -> CheckoutStats {
        self.stats.read().clone()
    }

    /// Reserve exactly one pending result into a new batch.
    pub fn checkout_single(&self, result_id: Uuid) -> Result<UploadBatch, CheckoutError> {
        self.checkout(vec![result_id])
    }

    /// Reserve every currently pending result (snapshot at call time)
    /// into one batch.
    pub fn checkout_bulk(&self) -> Result<UploadBatch, CheckoutError> {
        let pending: Vec<Uuid> = self.store.pending().iter().map(|r| r.id).collect();
        if pending.is_empty() {
            return Err(CheckoutError::NothingPending);
        }
        self.checkout(pending)
    }

    fn checkout(&self, result_ids: Vec<Uuid>) -> Result<UploadBatch, CheckoutError> {
        self.store.reserve(&result_ids)?;

        let batch = UploadBatch::new(result_ids.clone());
        if let Err(e) = self
            .store
            .insert_batch(&batch)
            .and_then(|_| self.store.update_batch_status(batch.id, BatchStatus::Reserved))
        {
            // Undo the reservation; the batch record never became live.
            if let Err(release_err) = self.store.release(&result_ids) {
                error!(error = %release_err, "Failed to release reservation after checkout error");
            }
            return Err(e.into());
        }

        let batch = self
            .store
            .get_batch(batch.id)
            .ok_or(CheckoutError::UnknownBatch(batch.id))?;
        info!(
            batch_id = %batch.id,
            results = batch.result_ids.len(),
            "Batch checked out"
        );
        Ok(batch)
    }

    /// Upload a reserved batch to the platform.
    ///
    /// Exactly one commit may be in flight per batch; concurrent calls for
    /// the same batch are rejected. Transient failures are retried with
    /// exponential backoff up to `max_attempts`; exhaustion (or a platform
    /// rejection) fails the batch and releases its results.
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn commit(&self, batch_id: Uuid) -> Result<BatchUploadAck, CheckoutError> {
        {
            let mut in_flight = self.in_flight.lock();
            if !in_flight.insert(batch_id) {
                return Err(CheckoutError::CommitInFlight(batch_id));
            }
        }
        let outcome = self.commit_inner(batch_id).await;
        self.in_flight.lock().remove(&batch_id);
        outcome
    }

    async fn commit_inner(&self, batch_id: Uuid) -> Result<BatchUploadAck, CheckoutError> {
        let batch = self
            .store
            .get_batch(batch_id)
            .ok_or(CheckoutError::UnknownBatch(batch_id))?;
        if batch.status != BatchStatus::Reserved {
            return Err(CheckoutError::Conflict(format!(
                "batch {} is {:?}, not committable",
                batch_id, batch.status
            )));
        }

        self.store
            .update_batch_status(batch_id, BatchStatus::Committing)?;

        // Assemble the payload. Results whose media blob disappeared can
        // never be uploaded; they are marked failed and dropped from the
        // batch instead of aborting it.
        let mut results = Vec::new();
        let mut uploadable_ids = Vec::new();
        for id in &batch.result_ids {
            let record = match self.store.get(*id) {
                Some(record) => record,
                None => {
                    warn!(result_id = %id, "Result record vanished, skipping");
                    continue;
                }
            };
            match self.store.read_media(*id) {
                Ok(media) => {
                    results.push(UploadedResult {
                        id: record.id,
                        session_id: record.session_id,
                        created_at: record.created_at,
                        boxes: record.boxes.clone(),
                        masks: record.masks.clone(),
                        confidence: record.confidence,
                        stage2_ok: record.stage2_ok,
                        media_b64: BASE64.encode(&media),
                    });
                    uploadable_ids.push(*id);
                }
                Err(e) => {
                    warn!(result_id = %id, error = %e, "Media blob missing, marking result failed");
                    self.store.mark_failed(*id)?;
                    self.stats.write().results_unuploadable += 1;
                }
            }
        }

        if results.is_empty() {
            self.store.update_batch_status(batch_id, BatchStatus::Failed)?;
            return Err(CheckoutError::Conflict(format!(
                "batch {} has no uploadable results",
                batch_id
            )));
        }

        let payload = BatchUploadRequest {
            batch_id,
            checkout_token: batch.checkout_token,
            device_id: self.device_id.clone(),
            results,
        };

        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.base_delay,
            max_interval: self.config.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            self.stats.write().upload_attempts += 1;
            let endpoint = self.sync.active_endpoint();

            match self.client.upload_batch(&endpoint, &payload).await {
                Ok(ack) => {
                    self.sync.report_endpoint_success();
                    self.store
                        .update_batch_status(batch_id, BatchStatus::Committed)?;
                    self.store.commit(&uploadable_ids)?;

                    let mut stats = self.stats.write();
                    stats.batches_committed += 1;
                    stats.results_committed += uploadable_ids.len() as u64;
                    drop(stats);
                    metrics::counter!("checkout.batches.committed").increment(1);

                    info!(
                        batch_id = %batch_id,
                        results = uploadable_ids.len(),
                        attempts,
                        endpoint = %endpoint.name,
                        "Batch committed"
                    );
                    return Ok(ack);
                }
                Err(e) if e.is_transient() && attempts < self.config.max_attempts => {
                    self.sync.report_endpoint_failure();
                    let delay = backoff.next_backoff().unwrap_or(self.config.max_delay);
                    warn!(
                        batch_id = %batch_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        endpoint = %endpoint.name,
                        error = %e,
                        "Batch upload failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        self.sync.report_endpoint_failure();
                    }
                    self.store.update_batch_status(batch_id, BatchStatus::Failed)?;
                    self.store.release(&uploadable_ids)?;
                    self.stats.write().batches_failed += 1;
                    metrics::counter!("checkout.batches.failed").increment(1);

                    error!(
                        batch_id = %batch_id,
                        attempts,
                        error = %e,
                        "Batch upload failed permanently, results released"
                    );
                    return Err(CheckoutError::UploadFailed {
                        batch_id,
                        attempts,
                        last_error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Bulk checkout followed by an immediate commit. The operator-facing
    /// "upload everything" action.
    pub async fn checkout_and_commit_all(&self) -> Result<BatchUploadAck, CheckoutError> {
        let batch = self.checkout_bulk()?;
        self.commit(batch.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{DeviceConfig, Endpoint, PlatformError, StatusUpdate};
    use crate::status_sync::StatusSyncConfig;
    use crate::types::{BoundingBox, DetectedObject, DetectionResult, UploadState};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct FlakyUploadClient {
        /// Upload attempts that fail transiently before succeeding.
        failures_remaining: AtomicU32,
        uploads: Mutex<Vec<BatchUploadRequest>>,
        reject: std::sync::atomic::AtomicBool,
    }

    impl FlakyUploadClient {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_remaining: AtomicU32::new(failures),
                uploads: Mutex::new(Vec::new()),
                reject: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl PlatformClient for FlakyUploadClient {
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
            Ok(DeviceConfig::default())
        }

        async fn upload_batch(
            &self,
            _endpoint: &Endpoint,
            payload: &BatchUploadRequest,
        ) -> Result<BatchUploadAck, PlatformError> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(PlatformError::Rejected {
                    status: 422,
                    message: "unprocessable".into(),
                });
            }
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(PlatformError::Transient("gateway timeout".into()));
            }
            self.uploads.lock().push(payload.clone());
            Ok(BatchUploadAck {
                batch_id: payload.batch_id,
                accepted: payload.results.len(),
            })
        }
    }

    fn test_result(sequence: u64) -> DetectionResult {
        DetectionResult {
            id: Uuid::new_v4(),
            session_id: None,
            device_id: "edge-001".to_string(),
            image_ref: String::new(),
            boxes: vec![DetectedObject {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 64.0,
                    height: 64.0,
                },
                class_name: "pallet".to_string(),
                confidence: 0.75,
            }],
            masks: vec![],
            confidence: 0.75,
            stage2_ok: true,
            created_at: Utc::now(),
            sequence,
            upload_state: UploadState::Pending,
        }
    }

    fn sync_for(client: Arc<dyn PlatformClient>) -> Arc<PlatformStatusSync> {
        PlatformStatusSync::new(
            StatusSyncConfig {
                device_id: "edge-001".to_string(),
                primary: Endpoint::new("primary", "http://platform.local"),
                fallback: None,
                failover_threshold: 100,
                push_base_delay: Duration::from_millis(5),
                push_max_delay: Duration::from_millis(20),
                config_refresh_interval: Duration::from_secs(3600),
                initial_config: DeviceConfig::default(),
            },
            client,
        )
    }

    fn coordinator(
        store: Arc<LocalResultStore>,
        client: Arc<FlakyUploadClient>,
    ) -> BatchUploadCoordinator {
        let config = CheckoutConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
        };
        BatchUploadCoordinator::new(
            store,
            sync_for(client.clone()),
            client,
            config,
            "edge-001",
        )
    }

    #[tokio::test]
    async fn test_bulk_checkout_commits_after_transient_failures() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalResultStore::open(dir.path()).unwrap());
        let mut ids = Vec::new();
        for seq in 0..5 {
            ids.push(store.insert(test_result(seq), b"frame").unwrap());
        }

        // Three transient failures, then success on attempt four.
        let client = FlakyUploadClient::new(3);
        let coordinator = coordinator(store.clone(), client.clone());

        let batch = coordinator.checkout_bulk().unwrap();
        assert_eq!(batch.result_ids.len(), 5);

        let ack = coordinator.commit(batch.id).await.unwrap();
        assert_eq!(ack.accepted, 5);

        assert_eq!(
            store.get_batch(batch.id).unwrap().status,
            BatchStatus::Committed
        );
        for id in &ids {
            assert_eq!(store.get(*id).unwrap().upload_state, UploadState::Committed);
            assert!(!store.media_exists(*id), "media must be deleted after commit");
        }
        assert_eq!(coordinator.stats().upload_attempts, 4);
        assert_eq!(client.uploads.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_checkout_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalResultStore::open(dir.path()).unwrap());
        let id = store.insert(test_result(0), b"frame").unwrap();

        let client = FlakyUploadClient::new(0);
        let coordinator = coordinator(store.clone(), client);

        coordinator.checkout_single(id).unwrap();
        let err = coordinator.checkout_single(id).unwrap_err();
        assert!(matches!(err, CheckoutError::Conflict(_)));

        // The bulk path must also refuse: nothing is pending anymore.
        assert!(matches!(
            coordinator.checkout_bulk(),
            Err(CheckoutError::NothingPending)
        ));
    }

    #[tokio::test]
    async fn test_exhausted_retries_release_results_and_keep_media() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalResultStore::open(dir.path()).unwrap());
        let id = store.insert(test_result(0), b"frame").unwrap();

        let client = FlakyUploadClient::new(u32::MAX);
        let coordinator = coordinator(store.clone(), client);

        let batch = coordinator.checkout_single(id).unwrap();
        let err = coordinator.commit(batch.id).await.unwrap_err();
        assert!(matches!(err, CheckoutError::UploadFailed { attempts: 5, .. }));

        assert_eq!(store.get_batch(batch.id).unwrap().status, BatchStatus::Failed);
        assert_eq!(store.get(id).unwrap().upload_state, UploadState::Pending);
        assert!(store.media_exists(id), "media preserved for inspection");

        // A later checkout can retry the released result.
        let retry = coordinator.checkout_single(id).unwrap();
        assert_eq!(retry.result_ids, vec![id]);
    }

    #[tokio::test]
    async fn test_platform_rejection_fails_without_retry() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalResultStore::open(dir.path()).unwrap());
        let id = store.insert(test_result(0), b"frame").unwrap();

        let client = FlakyUploadClient::new(0);
        client.reject.store(true, Ordering::SeqCst);
        let coordinator = coordinator(store.clone(), client);

        let batch = coordinator.checkout_single(id).unwrap();
        let err = coordinator.commit(batch.id).await.unwrap_err();
        assert!(matches!(err, CheckoutError::UploadFailed { attempts: 1, .. }));
        assert_eq!(store.get(id).unwrap().upload_state, UploadState::Pending);
    }

    #[tokio::test]
    async fn test_commit_in_flight_guard() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalResultStore::open(dir.path()).unwrap());
        let id = store.insert(test_result(0), b"frame").unwrap();

        let client = FlakyUploadClient::new(0);
        let coordinator = Arc::new(coordinator(store.clone(), client));
        let batch = coordinator.checkout_single(id).unwrap();

        // Occupy the in-flight slot, then try a second commit.
        coordinator.in_flight.lock().insert(batch.id);
        let err = coordinator.commit(batch.id).await.unwrap_err();
        assert!(matches!(err, CheckoutError::CommitInFlight(_)));
        coordinator.in_flight.lock().remove(&batch.id);

        coordinator.commit(batch.id).await.unwrap();
        assert_eq!(store.get(id).unwrap().upload_state, UploadState::Committed);
    }

    #[tokio::test]
    async fn test_missing_media_marks_result_failed() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalResultStore::open(dir.path()).unwrap());
        let good = store.insert(test_result(0), b"frame").unwrap();
        let broken = store.insert(test_result(1), b"frame").unwrap();

        // Remove one blob behind the store's back.
        std::fs::remove_file(store.media_path(broken).unwrap()).unwrap();

        let client = FlakyUploadClient::new(0);
        let coordinator = coordinator(store.clone(), client.clone());

        let batch = coordinator.checkout_bulk().unwrap();
        let ack = coordinator.commit(batch.id).await.unwrap();
        assert_eq!(ack.accepted, 1);

        assert_eq!(store.get(good).unwrap().upload_state, UploadState::Committed);
        assert_eq!(store.get(broken).unwrap().upload_state, UploadState::Failed);
        assert_eq!(coordinator.stats().results_unuploadable, 1);
    }
}
