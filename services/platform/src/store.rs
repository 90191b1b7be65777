//! Durable local cache of detection results and upload batches.
//!
//! Results and batches are persisted as JSON records next to their media
//! blobs under a single data directory, with an in-memory index rebuilt by
//! scanning on open. The store survives process restarts; reservations held
//! by a crashed commit are released during recovery.
//!
//! # Layout
//!
//! ```text
//! <data_dir>/media/<result_id>.bin     raw frame bytes
//! <data_dir>/results/<result_id>.json  DetectionResult record
//! <data_dir>/batches/<batch_id>.json   UploadBatch record
//! ```

use crate::types::{BatchStatus, DetectionResult, UploadBatch, UploadState};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors raised by the result store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("unknown result: {0}")]
    UnknownResult(Uuid),

    #[error("unknown batch: {0}")]
    UnknownBatch(Uuid),

    #[error("result {id} is {state:?}, cannot {action}")]
    Conflict {
        id: Uuid,
        state: UploadState,
        action: &'static str,
    },

    #[error("illegal batch transition {from:?} -> {to:?} for {id}")]
    IllegalBatchTransition {
        id: Uuid,
        from: BatchStatus,
        to: BatchStatus,
    },

    #[error("a batch must contain at least one result")]
    EmptyBatch,
}

/// Counters describing the store contents.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct StoreStats {
    pub total_results: usize,
    pub pending: usize,
    pub reserved: usize,
    pub committed: usize,
    pub failed: usize,
    pub live_batches: usize,
}

struct StoreIndex {
    results: HashMap<Uuid, DetectionResult>,
    batches: HashMap<Uuid, UploadBatch>,
}

/// File-backed store for pending detection results and checkout batches.
pub struct LocalResultStore {
    root: PathBuf,
    index: RwLock<StoreIndex>,
}

impl LocalResultStore {
    /// Open the store at `root`, creating the directory layout if needed
    /// and rebuilding the index from the records on disk.
    ///
    /// Recovery: any batch left in a non-terminal status by a previous
    /// process is marked `Failed` and its reservations are released, so a
    /// crash mid-commit never strands results in `Reserved`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        for sub in ["media", "results", "batches"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|source| StoreError::Io { path: dir, source })?;
        }

        let mut index = StoreIndex {
            results: HashMap::new(),
            batches: HashMap::new(),
        };

        for entry in Self::scan_json(&root.join("results"))? {
            let result: DetectionResult = serde_json::from_slice(&entry)?;
            index.results.insert(result.id, result);
        }
        for entry in Self::scan_json(&root.join("batches"))? {
            let batch: UploadBatch = serde_json::from_slice(&entry)?;
            index.batches.insert(batch.id, batch);
        }

        let store = Self {
            root,
            index: RwLock::new(index),
        };
        store.recover()?;

        let stats = store.stats();
        info!(
            root = %store.root.display(),
            results = stats.total_results,
            pending = stats.pending,
            "Result store opened"
        );

        Ok(store)
    }

    fn scan_json(dir: &Path) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut records = Vec::new();
        let entries = fs::read_dir(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                let bytes = fs::read(&path).map_err(|source| StoreError::Io { path, source })?;
                records.push(bytes);
            }
        }
        Ok(records)
    }

    fn recover(&self) -> Result<(), StoreError> {
        let stranded: Vec<Uuid> = {
            let index = self.index.read();
            index
                .batches
                .values()
                .filter(|b| b.status.is_live())
                .map(|b| b.id)
                .collect()
        };

        for batch_id in stranded {
            warn!(batch_id = %batch_id, "Recovering stranded batch from previous run");
            let result_ids = {
                let mut index = self.index.write();
                let batch = index
                    .batches
                    .get_mut(&batch_id)
                    .ok_or(StoreError::UnknownBatch(batch_id))?;
                batch.status = BatchStatus::Failed;
                batch.result_ids.clone()
            };
            self.persist_batch(batch_id)?;

            for id in result_ids {
                let released = {
                    let mut index = self.index.write();
                    match index.results.get_mut(&id) {
                        Some(r) if r.upload_state == UploadState::Reserved => {
                            r.upload_state = UploadState::Pending;
                            true
                        }
                        _ => false,
                    }
                };
                if released {
                    self.persist_result(id)?;
                }
            }
        }
        Ok(())
    }

    // --- result operations ---------------------------------------------

    /// Persist a freshly created result together with its media blob.
    ///
    /// The store assigns `image_ref` (relative media path). The payload
    /// fields of the record are never rewritten afterwards.
    pub fn insert(&self, mut result: DetectionResult, media: &[u8]) -> Result<Uuid, StoreError> {
        let id = result.id;
        let media_rel = format!("media/{}.bin", id);
        let media_path = self.root.join(&media_rel);
        fs::write(&media_path, media).map_err(|source| StoreError::Io {
            path: media_path,
            source,
        })?;

        result.image_ref = media_rel;
        result.upload_state = UploadState::Pending;

        self.index.write().results.insert(id, result);
        self.persist_result(id)?;

        metrics::counter!("store.results.inserted").increment(1);
        debug!(result_id = %id, "Detection result stored");
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<DetectionResult> {
        self.index.read().results.get(&id).cloned()
    }

    /// All `Pending` results in creation order.
    pub fn pending(&self) -> Vec<DetectionResult> {
        let index = self.index.read();
        let mut pending: Vec<DetectionResult> = index
            .results
            .values()
            .filter(|r| r.upload_state == UploadState::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        pending
    }

    pub fn media_path(&self, id: Uuid) -> Option<PathBuf> {
        self.index
            .read()
            .results
            .get(&id)
            .map(|r| self.root.join(&r.image_ref))
    }

    pub fn media_exists(&self, id: Uuid) -> bool {
        self.media_path(id).is_some_and(|p| p.exists())
    }

    pub fn read_media(&self, id: Uuid) -> Result<Vec<u8>, StoreError> {
        let path = self.media_path(id).ok_or(StoreError::UnknownResult(id))?;
        fs::read(&path).map_err(|source| StoreError::Io { path, source })
    }

    /// Atomically reserve a set of results for checkout.
    ///
    /// All-or-nothing: if any member is not `Pending` the call fails with
    /// `Conflict` and no state changes, preventing double-upload of results
    /// already claimed by another batch.
    pub fn reserve(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Err(StoreError::EmptyBatch);
        }

        {
            let mut index = self.index.write();
            for id in ids {
                let result = index
                    .results
                    .get(id)
                    .ok_or(StoreError::UnknownResult(*id))?;
                if result.upload_state != UploadState::Pending {
                    return Err(StoreError::Conflict {
                        id: *id,
                        state: result.upload_state,
                        action: "reserve",
                    });
                }
            }
            for id in ids {
                if let Some(result) = index.results.get_mut(id) {
                    result.upload_state = UploadState::Reserved;
                }
            }
        }

        for id in ids {
            self.persist_result(*id)?;
        }
        Ok(())
    }

    /// Mark reserved results committed and delete their media blobs.
    ///
    /// Media is deleted here and nowhere else, so a blob disappears exactly
    /// once and only after the platform acknowledged the batch.
    pub fn commit(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        self.advance(ids, UploadState::Committed, "commit")?;
        for id in ids {
            let path = self.media_path(*id).ok_or(StoreError::UnknownResult(*id))?;
            fs::remove_file(&path).map_err(|source| StoreError::Io { path, source })?;
        }
        metrics::counter!("store.results.committed").increment(ids.len() as u64);
        Ok(())
    }

    /// Release reserved results back to `Pending` after a failed batch.
    /// Media blobs are preserved for operator inspection.
    pub fn release(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        self.advance(ids, UploadState::Pending, "release")
    }

    /// Mark a single reserved result permanently failed (e.g. its media
    /// blob is missing and the record can never be uploaded).
    pub fn mark_failed(&self, id: Uuid) -> Result<(), StoreError> {
        self.advance(&[id], UploadState::Failed, "fail")
    }

    /// Requeue a failed result so a later checkout can pick it up again.
    pub fn requeue(&self, id: Uuid) -> Result<(), StoreError> {
        self.advance(&[id], UploadState::Pending, "requeue")
    }

    fn advance(
        &self,
        ids: &[Uuid],
        next: UploadState,
        action: &'static str,
    ) -> Result<(), StoreError> {
        {
            let mut index = self.index.write();
            for id in ids {
                let result = index
                    .results
                    .get(id)
                    .ok_or(StoreError::UnknownResult(*id))?;
                if !result.upload_state.can_transition(next) {
                    return Err(StoreError::Conflict {
                        id: *id,
                        state: result.upload_state,
                        action,
                    });
                }
            }
            for id in ids {
                if let Some(result) = index.results.get_mut(id) {
                    result.upload_state = next;
                }
            }
        }
        for id in ids {
            self.persist_result(*id)?;
        }
        Ok(())
    }

    // --- batch operations ----------------------------------------------

    pub fn insert_batch(&self, batch: &UploadBatch) -> Result<(), StoreError> {
        if batch.result_ids.is_empty() {
            return Err(StoreError::EmptyBatch);
        }
        self.index.write().batches.insert(batch.id, batch.clone());
        self.persist_batch(batch.id)
    }

    pub fn get_batch(&self, id: Uuid) -> Option<UploadBatch> {
        self.index.read().batches.get(&id).cloned()
    }

    pub fn update_batch_status(&self, id: Uuid, next: BatchStatus) -> Result<(), StoreError> {
        {
            let mut index = self.index.write();
            let batch = index.batches.get_mut(&id).ok_or(StoreError::UnknownBatch(id))?;
            if !batch.status.can_transition(next) {
                return Err(StoreError::IllegalBatchTransition {
                    id,
                    from: batch.status,
                    to: next,
                });
            }
            batch.status = next;
            if next == BatchStatus::Committed {
                batch.committed_at = Some(chrono::Utc::now());
            }
        }
        self.persist_batch(id)
    }

    /// Batches that still hold reservations on their results.
    pub fn live_batches(&self) -> Vec<UploadBatch> {
        self.index
            .read()
            .batches
            .values()
            .filter(|b| b.status.is_live())
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let index = self.index.read();
        let mut stats = StoreStats {
            total_results: index.results.len(),
            ..Default::default()
        };
        for result in index.results.values() {
            match result.upload_state {
                UploadState::Pending => stats.pending += 1,
                UploadState::Reserved => stats.reserved += 1,
                UploadState::Committed => stats.committed += 1,
                UploadState::Failed => stats.failed += 1,
            }
        }
        stats.live_batches = index.batches.values().filter(|b| b.status.is_live()).count();
        stats
    }

    // --- persistence helpers -------------------------------------------

    fn persist_result(&self, id: Uuid) -> Result<(), StoreError> {
        let record = self
            .index
            .read()
            .results
            .get(&id)
            .cloned()
            .ok_or(StoreError::UnknownResult(id))?;
        let path = self.root.join("results").join(format!("{}.json", id));
        let bytes = serde_json::to_vec_pretty(&record)?;
        Self::write_atomic(&path, &bytes)
    }

    fn persist_batch(&self, id: Uuid) -> Result<(), StoreError> {
        let record = self
            .index
            .read()
            .batches
            .get(&id)
            .cloned()
            .ok_or(StoreError::UnknownBatch(id))?;
        let path = self.root.join("batches").join(format!("{}.json", id));
        let bytes = serde_json::to_vec_pretty(&record)?;
        Self::write_atomic(&path, &bytes)
    }

    // Write-then-rename so a crash never leaves a torn record behind.
    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
