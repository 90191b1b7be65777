//! Orchestrator adapters for the agent's components.
//!
//! Each adapter wraps one component as a [`Service`] so the orchestrator
//! can start, health-check and stop it. Registration (with the dependency
//! edges between them) happens in `main`.

use crate::orchestrator::Service;
use crate::session::SessionManager;
use argus_platform::checkout::BatchUploadCoordinator;
use argus_platform::status_sync::PlatformStatusSync;
use argus_platform::store::LocalResultStore;
use argus_vision::camera::Camera;
use argus_vision::pipeline::DetectionPipeline;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The local result store. Passive: healthy as long as its index answers.
pub struct StoreService {
    pub store: Arc<LocalResultStore>,
}

#[async_trait]
impl Service for StoreService {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn health_check(&self) -> bool {
        // The store was opened before registration; answering a stats
        // query means the index is intact.
        let _ = self.store.stats();
        true
    }
}

/// The camera. Probed when free; counted healthy while a session holds it.
pub struct CameraService {
    pub camera: Arc<Camera>,
}

#[async_trait]
impl Service for CameraService {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn health_check(&self) -> bool {
        self.camera.probe().await
    }
}

/// Status sync dispatcher and config refresher tasks.
pub struct StatusSyncService {
    pub sync: Arc<PlatformStatusSync>,
    cancel: Mutex<Option<CancellationToken>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl StatusSyncService {
    pub fn new(sync: Arc<PlatformStatusSync>) -> Self {
        Self {
            sync,
            cancel: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Service for StatusSyncService {
    async fn start(&self) -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let handles = self.sync.start(cancel.clone());
        *self.cancel.lock() = Some(cancel);
        *self.handles.lock() = handles;
        Ok(())
    }

    async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        self.handles.lock().clear();
    }

    async fn health_check(&self) -> bool {
        let handles = self.handles.lock();
        !handles.is_empty() && handles.iter().all(|h| !h.is_finished())
    }
}

/// The detection pipeline workers.
pub struct PipelineService {
    pub pipeline: Arc<DetectionPipeline>,
}

#[async_trait]
impl Service for PipelineService {
    async fn start(&self) -> anyhow::Result<()> {
        self.pipeline.spawn_workers();
        Ok(())
    }

    async fn stop(&self) {
        if let Some(handle) = self.pipeline.pause().await {
            handle.release().await;
        }
        self.pipeline.shutdown();
    }

    async fn health_check(&self) -> bool {
        self.pipeline.is_running()
    }
}

/// The session actor.
pub struct SessionService {
    pub manager: SessionManager,
}

#[async_trait]
impl Service for SessionService {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) {
        self.manager.shutdown().await;
    }

    async fn health_check(&self) -> bool {
        self.manager.snapshot().await.is_ok()
    }
}

/// The batch upload coordinator. Passive between checkouts.
pub struct CheckoutService {
    pub coordinator: Arc<BatchUploadCoordinator>,
}

#[async_trait]
impl Service for CheckoutService {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn health_check(&self) -> bool {
        let _ = self.coordinator.stats();
        true
    }
}
