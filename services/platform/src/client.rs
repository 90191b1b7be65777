//! Remote platform client for status pushes, config pulls and batch uploads.
//!
//! The [`PlatformClient`] trait is the REST contract boundary; the rest of
//! the crate depends only on the trait so tests can script failures. Every
//! request carries a client-generated `x-request-id` header, which the
//! platform uses to deduplicate retried calls.

use crate::types::{DetectedObject, Mask};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by platform calls.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Connection, timeout or 5xx failure; safe to retry.
    #[error("transient network failure: {0}")]
    Transient(String),

    /// The platform refused the request; retrying will not help.
    #[error("request rejected by platform ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Transient(_))
    }
}

/// One reachable platform endpoint (e.g. local network vs. tunnel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub base_url: String,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
        }
    }
}

/// Device status as mirrored to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Normal unattended operation.
    Active,
    /// A remote maintenance session is open.
    Maintenance,
    Offline,
}

/// A status push with its device-local logical timestamp.
///
/// The platform applies pushes for a device in strictly increasing
/// `logical_ts` order; a stale push is abandoned client-side, never sent
/// after a newer one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub device_id: String,
    pub status: DeviceStatus,
    pub logical_ts: u64,
}

/// Dynamic per-device configuration pulled from the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Monotonic version assigned by the platform, for log correlation.
    #[serde(default)]
    pub config_version: u64,
}

fn default_confidence_threshold() -> f32 {
    0.5
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            config_version: 0,
        }
    }
}

/// One result inside a batch upload payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedResult {
    pub id: Uuid,
    pub session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub boxes: Vec<DetectedObject>,
    pub masks: Vec<Mask>,
    pub confidence: f32,
    pub stage2_ok: bool,
    /// Base64-encoded media blob.
    pub media_b64: String,
}

/// The body of `POST /uploads`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUploadRequest {
    pub batch_id: Uuid,
    pub checkout_token: Uuid,
    pub device_id: String,
    pub results: Vec<UploadedResult>,
}

/// Platform acknowledgement of a committed batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUploadAck {
    pub batch_id: Uuid,
    pub accepted: usize,
}

/// The remote platform REST contract.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// `PATCH {base}/devices/{id}/status`
    async fn push_status(
        &self,
        endpoint: &Endpoint,
        update: &StatusUpdate,
    ) -> Result<(), PlatformError>;

    /// `GET {base}/devices/{id}/config`
    async fn fetch_config(
        &self,
        endpoint: &Endpoint,
        device_id: &str,
    ) -> Result<DeviceConfig, PlatformError>;

    /// `POST {base}/uploads`
    async fn upload_batch(
        &self,
        endpoint: &Endpoint,
        payload: &BatchUploadRequest,
    ) -> Result<BatchUploadAck, PlatformError>;
}

/// `reqwest`-backed implementation of the platform contract.
pub struct HttpPlatformClient {
    http: reqwest::Client,
}

impl HttpPlatformClient {
    pub fn new(request_timeout: Duration) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PlatformError::Transient(e.to_string()))?;
        Ok(Self { http })
    }

    fn map_error(err: reqwest::Error) -> PlatformError {
        PlatformError::Transient(err.to_string())
    }

    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 {
            Err(PlatformError::Transient(format!("{}: {}", status, message)))
        } else {
            Err(PlatformError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn push_status(
        &self,
        endpoint: &Endpoint,
        update: &StatusUpdate,
    ) -> Result<(), PlatformError> {
        let url = format!("{}/devices/{}/status", endpoint.base_url, update.device_id);
        let response = self
            .http
            .patch(&url)
            .header("x-request-id", Uuid::new_v4().to_string())
            .json(update)
            .send()
            .await
            .map_err(Self::map_error)?;
        Self::check_response(response).await?;
        Ok(())
    }

    async fn fetch_config(
        &self,
        endpoint: &Endpoint,
        device_id: &str,
    ) -> Result<DeviceConfig, PlatformError> {
        let url = format!("{}/devices/{}/config", endpoint.base_url, device_id);
        let response = self
            .http
            .get(&url)
            .header("x-request-id", Uuid::new_v4().to_string())
            .send()
            .await
            .map_err(Self::map_error)?;
        let response = Self::check_response(response).await?;
        response
            .json::<DeviceConfig>()
            .await
            .map_err(|e| PlatformError::Transient(e.to_string()))
    }

    async fn upload_batch(
        &self,
        endpoint: &Endpoint,
        payload: &BatchUploadRequest,
    ) -> Result<BatchUploadAck, PlatformError> {
        let url = format!("{}/uploads", endpoint.base_url);
        let response = self
            .http
            .post(&url)
            .header("x-request-id", payload.checkout_token.to_string())
            .json(payload)
            .send()
            .await
            .map_err(Self::map_error)?;
        let response = Self::check_response(response).await?;
        response
            .json::<BatchUploadAck>()
            .await
            .map_err(|e| PlatformError::Transient(e.to_string()))
    }
}
