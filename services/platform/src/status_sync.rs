//! Outbound status mirroring and dynamic-config cache.
//!
//! [`PlatformStatusSync`] owns the consistency contract with the remote
//! platform: every status push is retried until the platform acknowledges
//! it or a strictly newer push from the same device supersedes it, so
//! statuses are never applied out of order. It also maintains the
//! last-known-good dynamic device config, refreshed on a fixed interval
//! and read without blocking by the detection pipeline.

use crate::client::{DeviceConfig, DeviceStatus, Endpoint, PlatformClient, StatusUpdate};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the status sync client.
#[derive(Debug, Clone)]
pub struct StatusSyncConfig {
    pub device_id: String,
    pub primary: Endpoint,
    pub fallback: Option<Endpoint>,
    /// Consecutive transient failures before the active endpoint flips.
    pub failover_threshold: u32,
    pub push_base_delay: Duration,
    pub push_max_delay: Duration,
    pub config_refresh_interval: Duration,
    /// Config used until the first successful refresh.
    pub initial_config: DeviceConfig,
}

/// Counters describing sync activity.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct SyncStats {
    pub pushes_acked: u64,
    pub pushes_superseded: u64,
    pub pushes_rejected: u64,
    pub push_attempts_failed: u64,
    pub failovers: u64,
    pub config_refreshes: u64,
    pub config_refresh_failures: u64,
}

struct CachedConfig {
    config: DeviceConfig,
    stale: bool,
    refreshed_once: bool,
}

/// Client-side half of the platform status/config contract.
pub struct PlatformStatusSync {
    config: StatusSyncConfig,
    client: Arc<dyn PlatformClient>,
    endpoints: Vec<Endpoint>,
    active: AtomicUsize,
    consecutive_failures: AtomicU32,
    logical_ts: AtomicU64,
    tx: watch::Sender<Option<StatusUpdate>>,
    rx: Mutex<Option<watch::Receiver<Option<StatusUpdate>>>>,
    cache: RwLock<CachedConfig>,
    stats: RwLock<SyncStats>,
}

impl PlatformStatusSync {
    pub fn new(config: StatusSyncConfig, client: Arc<dyn PlatformClient>) -> Arc<Self> {
        let mut endpoints = vec![config.primary.clone()];
        if let Some(fallback) = &config.fallback {
            endpoints.push(fallback.clone());
        }
        let (tx, rx) = watch::channel(None);
        let initial = config.initial_config.clone();

        Arc::new(Self {
            config,
            client,
            endpoints,
            active: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            logical_ts: AtomicU64::new(0),
            tx,
            rx: Mutex::new(Some(rx)),
            cache: RwLock::new(CachedConfig {
                config: initial,
                stale: false,
                refreshed_once: false,
            }),
            stats: RwLock::new(SyncStats::default()),
        })
    }

    /// Spawn the push dispatcher and the periodic config refresher.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        // On a restart the original receiver is gone; a fresh subscription
        // picks up from the latest enqueued update.
        let rx = self
            .rx
            .lock()
            .take()
            .unwrap_or_else(|| self.tx.subscribe());

        let dispatcher = tokio::spawn(Self::run_dispatcher(self.clone(), rx, cancel.clone()));
        let refresher = tokio::spawn(Self::run_refresher(self.clone(), cancel));
        vec![dispatcher, refresher]
    }

    /// Enqueue a status push and return its logical timestamp.
    ///
    /// Returns immediately; delivery (with retry, failover and
    /// supersession) happens on the dispatcher task.
    pub fn push_status(&self, status: DeviceStatus) -> u64 {
        let logical_ts = self.logical_ts.fetch_add(1, Ordering::SeqCst) + 1;
        let update = StatusUpdate {
            device_id: self.config.device_id.clone(),
            status,
            logical_ts,
        };
        debug!(
            device_id = %update.device_id,
            status = ?status,
            logical_ts,
            "Status push enqueued"
        );
        self.tx.send_replace(Some(update));
        metrics::counter!("sync.status.enqueued").increment(1);
        logical_ts
    }

    /// The endpoint currently used for all platform traffic.
    pub fn active_endpoint(&self) -> Endpoint {
        self.endpoints[self.active.load(Ordering::SeqCst)].clone()
    }

    /// Last-known-good device config; never blocks.
    pub fn current_config(&self) -> DeviceConfig {
        self.cache.read().config.clone()
    }

    /// Whether the most recent refresh attempt failed.
    pub fn config_is_stale(&self) -> bool {
        self.cache.read().stale
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Record a transient failure against the active endpoint; flips to
    /// the fallback after `failover_threshold` consecutive failures.
    /// Shared with the upload coordinator, which talks to the same
    /// endpoints.
    pub fn report_endpoint_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.failover_threshold && self.endpoints.len() > 1 {
            let previous = self.active.load(Ordering::SeqCst);
            let next = (previous + 1) % self.endpoints.len();
            self.active.store(next, Ordering::SeqCst);
            self.consecutive_failures.store(0, Ordering::SeqCst);
            self.stats.write().failovers += 1;
            warn!(
                from = %self.endpoints[previous].name,
                to = %self.endpoints[next].name,
                failures,
                "Platform endpoint failover"
            );
        }
    }

    pub fn report_endpoint_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Fetch the device config from the active endpoint, updating the
    /// cache. A failure keeps the previous value and only marks it stale.
    pub async fn refresh_config_now(&self) -> Result<(), crate::client::PlatformError> {
        let endpoint = self.active_endpoint();
        match self
            .client
            .fetch_config(&endpoint, &self.config.device_id)
            .await
        {
            Ok(config) => {
                self.report_endpoint_success();
                let mut cache = self.cache.write();
                if !cache.refreshed_once || cache.config != config {
                    info!(
                        confidence_threshold = config.confidence_threshold,
                        config_version = config.config_version,
                        "Device config updated"
                    );
                }
                cache.config = config;
                cache.stale = false;
                cache.refreshed_once = true;
                self.stats.write().config_refreshes += 1;
                Ok(())
            }
            Err(e) => {
                if e.is_transient() {
                    self.report_endpoint_failure();
                }
                self.cache.write().stale = true;
                self.stats.write().config_refresh_failures += 1;
                Err(e)
            }
        }
    }

    async fn run_dispatcher(
        self: Arc<Self>,
        mut rx: watch::Receiver<Option<StatusUpdate>>,
        cancel: CancellationToken,
    ) {
        let mut last_acked: u64 = 0;

        loop {
            // Deliver whatever is current (covers a pending update found
            // right after a restart), then wait for the next change.
            'deliver: loop {
                let update = match rx.borrow_and_update().clone() {
                    Some(update) => update,
                    None => break 'deliver,
                };
                if update.logical_ts <= last_acked {
                    break 'deliver;
                }

                let mut backoff = ExponentialBackoff {
                    initial_interval: self.config.push_base_delay,
                    max_interval: self.config.push_max_delay,
                    max_elapsed_time: None,
                    ..Default::default()
                };

                loop {
                    let endpoint = self.active_endpoint();
                    match self.client.push_status(&endpoint, &update).await {
                        Ok(()) => {
                            last_acked = update.logical_ts;
                            self.report_endpoint_success();
                            self.stats.write().pushes_acked += 1;
                            metrics::counter!("sync.status.acked").increment(1);
                            debug!(
                                status = ?update.status,
                                logical_ts = update.logical_ts,
                                endpoint = %endpoint.name,
                                "Status push acknowledged"
                            );
                            continue 'deliver;
                        }
                        Err(e) if e.is_transient() => {
                            self.report_endpoint_failure();
                            self.stats.write().push_attempts_failed += 1;
                            let delay = backoff
                                .next_backoff()
                                .unwrap_or(self.config.push_max_delay);
                            warn!(
                                status = ?update.status,
                                logical_ts = update.logical_ts,
                                endpoint = %endpoint.name,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Status push failed, retrying"
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(delay) => {}
                                changed = rx.changed() => {
                                    if changed.is_err() {
                                        return;
                                    }
                                    self.stats.write().pushes_superseded += 1;
                                    debug!(
                                        logical_ts = update.logical_ts,
                                        "Stale status push abandoned"
                                    );
                                    continue 'deliver;
                                }
                            }
                        }
                        Err(e) => {
                            error!(
                                status = ?update.status,
                                logical_ts = update.logical_ts,
                                error = %e,
                                "Status push rejected by platform, dropping"
                            );
                            self.stats.write().pushes_rejected += 1;
                            last_acked = update.logical_ts;
                            continue 'deliver;
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn run_refresher(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.config_refresh_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.refresh_config_now().await {
                debug!(error = %e, "Config refresh failed, keeping last known value");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BatchUploadAck, BatchUploadRequest, PlatformError};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FakeClient {
        delivered: Mutex<Vec<StatusUpdate>>,
        /// Number of push attempts that fail transiently before succeeding.
        failing_attempts: AtomicU32,
        config_response: Mutex<Option<DeviceConfig>>,
    }

    impl FakeClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                failing_attempts: AtomicU32::new(0),
                config_response: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl PlatformClient for FakeClient {
        async fn push_status(
            &self,
            _endpoint: &Endpoint,
            update: &StatusUpdate,
        ) -> Result<(), PlatformError> {
            let remaining = self.failing_attempts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_attempts.fetch_sub(1, Ordering::SeqCst);
                return Err(PlatformError::Transient("connection refused".into()));
            }
            self.delivered.lock().push(update.clone());
            Ok(())
        }

        async fn fetch_config(
            &self,
            _endpoint: &Endpoint,
            _device_id: &str,
        ) -> Result<DeviceConfig, PlatformError> {
            match self.config_response.lock().clone() {
                Some(config) => Ok(config),
                None => Err(PlatformError::Transient("config unavailable".into())),
            }
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

    fn test_config() -> StatusSyncConfig {
        StatusSyncConfig {
            device_id: "edge-001".to_string(),
            primary: Endpoint::new("primary", "http://platform.local"),
            fallback: Some(Endpoint::new("fallback", "http://tunnel.remote")),
            failover_threshold: 2,
            push_base_delay: Duration::from_millis(5),
            push_max_delay: Duration::from_millis(20),
            config_refresh_interval: Duration::from_secs(3600),
            initial_config: DeviceConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_push_delivered_and_acked() {
        let client = FakeClient::new();
        let sync = PlatformStatusSync::new(test_config(), client.clone());
        let cancel = CancellationToken::new();
        sync.start(cancel.clone());

        let ts = sync.push_status(DeviceStatus::Maintenance);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let delivered = client.delivered.lock().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].status, DeviceStatus::Maintenance);
        assert_eq!(delivered[0].logical_ts, ts);
        assert_eq!(sync.stats().pushes_acked, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_stale_push_superseded_never_delivered() {
        let client = FakeClient::new();
        // Keep the first push failing until it is superseded.
        client.failing_attempts.store(u32::MAX, Ordering::SeqCst);
        let sync = PlatformStatusSync::new(test_config(), client.clone());
        let cancel = CancellationToken::new();
        sync.start(cancel.clone());

        sync.push_status(DeviceStatus::Maintenance);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Enqueue the newer push while the first is still failing, so the
        // first can only ever be abandoned, then let deliveries succeed.
        let newer_ts = sync.push_status(DeviceStatus::Active);
        client.failing_attempts.store(0, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let delivered = client.delivered.lock().clone();
        assert_eq!(delivered.len(), 1, "stale push must be abandoned");
        assert_eq!(delivered[0].status, DeviceStatus::Active);
        assert_eq!(delivered[0].logical_ts, newer_ts);
        assert!(sync.stats().pushes_superseded >= 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_failover_after_consecutive_failures() {
        let client = FakeClient::new();
        client.failing_attempts.store(2, Ordering::SeqCst);
        let sync = PlatformStatusSync::new(test_config(), client.clone());
        let cancel = CancellationToken::new();
        sync.start(cancel.clone());

        assert_eq!(sync.active_endpoint().name, "primary");
        sync.push_status(DeviceStatus::Maintenance);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(sync.active_endpoint().name, "fallback");
        assert_eq!(sync.stats().failovers, 1);
        assert_eq!(client.delivered.lock().len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_config_cache_survives_refresh_failure() {
        let client = FakeClient::new();
        let sync = PlatformStatusSync::new(test_config(), client.clone());

        // No response configured: refresh fails, last known value stays.
        assert!(sync.refresh_config_now().await.is_err());
        assert_eq!(sync.current_config().confidence_threshold, 0.5);
        assert!(sync.config_is_stale());

        *client.config_response.lock() = Some(DeviceConfig {
            confidence_threshold: 0.8,
            config_version: 3,
        });
        sync.refresh_config_now().await.unwrap();
        assert_eq!(sync.current_config().confidence_threshold, 0.8);
        assert!(!sync.config_is_stale());
    }

    #[tokio::test]
    async fn test_logical_ts_strictly_increasing() {
        let client = FakeClient::new();
        let sync = PlatformStatusSync::new(test_config(), client);

        let a = sync.push_status(DeviceStatus::Maintenance);
        let b = sync.push_status(DeviceStatus::Active);
        let c = sync.push_status(DeviceStatus::Maintenance);
        assert!(a < b && b < c);
    }
}
