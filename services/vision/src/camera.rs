//! Camera acquisition and frame reading.
//!
//! [`Camera`] wraps a boxed [`FrameSource`] driver behind an exclusive
//! handle: at most one holder at a time, acquisition opens the driver with
//! bounded retry, and releasing the handle closes it again. The session
//! manager acquires the camera when a maintenance session starts and
//! releases it when the session closes.

use crate::config::CameraConfig;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Errors raised by camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera open failed: {0}")]
    OpenFailed(String),

    #[error("frame read failed: {0}")]
    ReadFailed(String),

    #[error("camera is already in use")]
    Busy,

    #[error("camera disconnected")]
    Disconnected,
}

impl CameraError {
    /// True for failures of the device itself, as opposed to contention.
    pub fn is_hardware(&self) -> bool {
        matches!(
            self,
            CameraError::OpenFailed(_) | CameraError::ReadFailed(_) | CameraError::Disconnected
        )
    }
}

/// A raw frame captured from the camera.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame data as bytes
    pub data: Bytes,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Pixel format (e.g. "RGB24")
    pub pixel_format: String,

    /// Frame sequence number, assigned by the camera
    pub sequence: u64,

    /// Timestamp when the frame was captured
    pub captured_at: Instant,
}

/// The camera-driver contract.
///
/// `read_frame` returns `Ok(None)` at end of stream. Implementations do
/// not assign sequence numbers; the [`Camera`] does.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn open(&mut self) -> Result<(), CameraError>;

    async fn read_frame(&mut self) -> Result<Option<Frame>, CameraError>;

    async fn close(&mut self);
}

/// Statistics for the camera.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct CameraStats {
    pub acquisitions: u64,
    pub open_retries: u64,
    pub frames_read: u64,
    pub read_errors: u64,
}

/// Exclusive-access wrapper over a camera driver.
pub struct Camera {
    driver: Arc<AsyncMutex<Box<dyn FrameSource>>>,
    config: CameraConfig,
    in_use: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
    stats: Arc<RwLock<CameraStats>>,
}

impl Camera {
    pub fn new(driver: Box<dyn FrameSource>, config: CameraConfig) -> Self {
        Self {
            driver: Arc::new(AsyncMutex::new(driver)),
            config,
            in_use: Arc::new(AtomicBool::new(false)),
            sequence: Arc::new(AtomicU64::new(0)),
            stats: Arc::new(RwLock::new(CameraStats::default())),
        }
    }

    pub fn is_held(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CameraStats {
        self.stats.read().clone()
    }

    /// Acquire exclusive access, opening the driver with bounded
    /// exponential-backoff retry.
    ///
    /// Fails with [`CameraError::Busy`] if a handle is already held and
    /// with the underlying hardware error once open attempts are
    /// exhausted, in which case the camera is free to acquire again.
    pub async fn acquire(&self) -> Result<CameraHandle, CameraError> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CameraError::Busy);
        }

        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.open_base_delay(),
            max_interval: self.config.open_max_delay(),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempts = 0u32;
        loop {
            match self.driver.lock().await.open().await {
                Ok(()) => break,
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.open_max_attempts {
                        self.in_use.store(false, Ordering::SeqCst);
                        warn!(attempts, error = %e, "Camera open failed, giving up");
                        return Err(e);
                    }
                    self.stats.write().open_retries += 1;
                    let delay = backoff.next_backoff().unwrap_or(self.config.open_max_delay());
                    debug!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Camera open failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.stats.write().acquisitions += 1;
        info!("Camera acquired");

        Ok(CameraHandle {
            driver: self.driver.clone(),
            in_use: self.in_use.clone(),
            sequence: self.sequence.clone(),
            stats: self.stats.clone(),
            released: false,
        })
    }

    /// Health probe: when held, the camera is in active use and counts as
    /// healthy; when free, open and close the driver once.
    pub async fn probe(&self) -> bool {
        if self.is_held() {
            return true;
        }
        let mut driver = self.driver.lock().await;
        match driver.open().await {
            Ok(()) => {
                driver.close().await;
                true
            }
            Err(e) => {
                debug!(error = %e, "Camera probe failed");
                false
            }
        }
    }
}

/// Exclusive camera access, returned by [`Camera::acquire`].
pub struct CameraHandle {
    driver: Arc<AsyncMutex<Box<dyn FrameSource>>>,
    in_use: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
    stats: Arc<RwLock<CameraStats>>,
    released: bool,
}

impl CameraHandle {
    /// Read the next frame. `Ok(None)` signals end of stream.
    pub async fn read_frame(&self) -> Result<Option<Frame>, CameraError> {
        let mut driver = self.driver.lock().await;
        match driver.read_frame().await {
            Ok(Some(mut frame)) => {
                frame.sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
                self.stats.write().frames_read += 1;
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.stats.write().read_errors += 1;
                Err(e)
            }
        }
    }

    /// Close the driver and free the camera for the next holder.
    pub async fn release(mut self) {
        self.driver.lock().await.close().await;
        self.in_use.store(false, Ordering::SeqCst);
        self.released = true;
        info!("Camera released");
    }
}

impl std::fmt::Debug for CameraHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraHandle")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        if !self.released {
            // The driver stays open; the slot is freed so the camera can
            // recover on the next acquire.
            self.in_use.store(false, Ordering::SeqCst);
            warn!("Camera handle dropped without release");
        }
    }
}

/// In-tree frame source producing flat synthetic frames.
///
/// Used by the agent's loopback mode and by tests; no hardware required.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    frame_interval: Duration,
    /// Frames to produce before signalling end of stream; `None` = endless.
    frame_limit: Option<u64>,
    produced: u64,
    opened: bool,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32, frame_interval: Duration, frame_limit: Option<u64>) -> Self {
        Self {
            width,
            height,
            frame_interval,
            frame_limit,
            produced: 0,
            opened: false,
        }
    }
}

#[async_trait]
impl FrameSource for SyntheticCamera {
    async fn open(&mut self) -> Result<(), CameraError> {
        self.opened = true;
        self.produced = 0;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        if !self.opened {
            return Err(CameraError::ReadFailed("camera not open".to_string()));
        }
        if let Some(limit) = self.frame_limit {
            if self.produced >= limit {
                return Ok(None);
            }
        }
        if !self.frame_interval.is_zero() {
            tokio::time::sleep(self.frame_interval).await;
        }
        self.produced += 1;

        let size = (self.width * self.height * 3) as usize;
        Ok(Some(Frame {
            data: Bytes::from(vec![128u8; size]),
            width: self.width,
            height: self.height,
            pixel_format: "RGB24".to_string(),
            sequence: 0,
            captured_at: Instant::now(),
        }))
    }

    async fn close(&mut self) {
        self.opened = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Driver that fails a configurable number of open attempts.
    pub(crate) struct FlakyCamera {
        failures_remaining: u32,
        inner: SyntheticCamera,
    }

    impl FlakyCamera {
        pub(crate) fn new(failures: u32) -> Self {
            Self {
                failures_remaining: failures,
                inner: SyntheticCamera::new(32, 32, Duration::ZERO, None),
            }
        }
    }

    #[async_trait]
    impl FrameSource for FlakyCamera {
        async fn open(&mut self) -> Result<(), CameraError> {
            if self.failures_remaining > 0 {
                self.failures_remaining -= 1;
                return Err(CameraError::OpenFailed("device busy".to_string()));
            }
            self.inner.open().await
        }

        async fn read_frame(&mut self) -> Result<Option<Frame>, CameraError> {
            self.inner.read_frame().await
        }

        async fn close(&mut self) {
            self.inner.close().await
        }
    }

    fn test_config() -> CameraConfig {
        CameraConfig {
            open_max_attempts: 3,
            open_base_delay_ms: 1,
            open_max_delay_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_acquire_and_read() {
        let camera = Camera::new(
            Box::new(SyntheticCamera::new(16, 16, Duration::ZERO, Some(2))),
            test_config(),
        );

        let handle = camera.acquire().await.unwrap();
        assert!(camera.is_held());

        let first = handle.read_frame().await.unwrap().unwrap();
        let second = handle.read_frame().await.unwrap().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(first.data.len(), 16 * 16 * 3);

        // Frame limit reached: end of stream.
        assert!(handle.read_frame().await.unwrap().is_none());

        handle.release().await;
        assert!(!camera.is_held());
    }

    #[tokio::test]
    async fn test_second_acquire_is_busy() {
        let camera = Camera::new(
            Box::new(SyntheticCamera::new(16, 16, Duration::ZERO, None)),
            test_config(),
        );

        let handle = camera.acquire().await.unwrap();
        assert!(matches!(camera.acquire().await, Err(CameraError::Busy)));
        handle.release().await;

        // Free again after release.
        let handle = camera.acquire().await.unwrap();
        handle.release().await;
    }

    #[tokio::test]
    async fn test_open_retries_then_succeeds() {
        let camera = Camera::new(Box::new(FlakyCamera::new(2)), test_config());

        let handle = camera.acquire().await.unwrap();
        assert_eq!(camera.stats().open_retries, 2);
        handle.release().await;
    }

    #[tokio::test]
    async fn test_open_exhaustion_frees_slot() {
        let camera = Camera::new(Box::new(FlakyCamera::new(10)), test_config());

        let err = camera.acquire().await.unwrap_err();
        assert!(err.is_hardware());
        assert!(!camera.is_held(), "failed acquire must not leak the slot");
    }

    #[tokio::test]
    async fn test_probe_when_free() {
        let camera = Camera::new(
            Box::new(SyntheticCamera::new(16, 16, Duration::ZERO, None)),
            test_config(),
        );
        assert!(camera.probe().await);
        assert!(!camera.is_held());
    }
}
