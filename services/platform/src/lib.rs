//! Argus platform services - local result store, status sync and checkout.
//!
//! This crate owns everything the edge agent shares with the remote
//! platform:
//!
//! - Detection results and checkout batches, cached durably on disk until
//!   the platform has confirmed them ([`store::LocalResultStore`])
//! - Device status mirroring with strict ordering and endpoint failover
//!   ([`status_sync::PlatformStatusSync`])
//! - The single/bulk checkout commit protocol
//!   ([`checkout::BatchUploadCoordinator`])
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use argus_platform::{
//!     checkout::BatchUploadCoordinator,
//!     client::HttpPlatformClient,
//!     config::PlatformConfig,
//!     status_sync::PlatformStatusSync,
//!     store::LocalResultStore,
//! };
//!
//! fn build(config: &PlatformConfig) -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(LocalResultStore::open(&config.data_dir)?);
//!     let client = Arc::new(HttpPlatformClient::new(config.request_timeout())?);
//!     let sync = PlatformStatusSync::new(config.status_sync_config(), client.clone());
//!     let _coordinator = BatchUploadCoordinator::new(
//!         store,
//!         sync,
//!         client,
//!         config.checkout_config(),
//!         config.device_id.clone(),
//!     );
//!     Ok(())
//! }
//! ```

pub mod checkout;
pub mod client;
pub mod config;
pub mod status_sync;
pub mod store;
pub mod types;

// Re-export main types
pub use checkout::{BatchUploadCoordinator, CheckoutConfig, CheckoutError, CheckoutStats};
pub use client::{
    BatchUploadAck, BatchUploadRequest, DeviceConfig, DeviceStatus, Endpoint, HttpPlatformClient,
    PlatformClient, PlatformError, StatusUpdate, UploadedResult,
};
pub use config::{PlatformConfig, PlatformConfigError};
pub use status_sync::{PlatformStatusSync, StatusSyncConfig, SyncStats};
pub use store::{LocalResultStore, StoreError, StoreStats};
pub use types::{
    BatchStatus, BoundingBox, DetectedObject, DetectionResult, Mask, UploadBatch, UploadState,
};
