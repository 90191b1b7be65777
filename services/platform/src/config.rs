//! Configuration for the platform-facing side of the agent.

use crate::checkout::CheckoutConfig;
use crate::client::{DeviceConfig, Endpoint};
use crate::status_sync::StatusSyncConfig;
use serde::Deserialize;
use std::time::Duration;

/// Platform connectivity and local store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// Stable identifier of this device on the platform.
    pub device_id: String,

    /// Primary platform endpoint (e.g. the local-network gateway).
    pub primary_url: String,

    /// Optional fallback endpoint (e.g. the tunnel), used after repeated
    /// transient failures against the primary.
    #[serde(default)]
    pub fallback_url: Option<String>,

    /// Directory holding the local result store.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Consecutive transient failures before endpoint failover.
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: u32,

    /// Base delay between status push retries in milliseconds.
    #[serde(default = "default_push_base_delay_ms")]
    pub push_base_delay_ms: u64,

    /// Maximum delay between status push retries in milliseconds.
    #[serde(default = "default_push_max_delay_ms")]
    pub push_max_delay_ms: u64,

    /// Interval between dynamic-config refreshes in seconds.
    #[serde(default = "default_config_refresh_interval_secs")]
    pub config_refresh_interval_secs: u64,

    /// Maximum attempts for one batch commit.
    #[serde(default = "default_upload_max_attempts")]
    pub upload_max_attempts: u32,

    /// Base delay between commit retries in milliseconds.
    #[serde(default = "default_upload_base_delay_ms")]
    pub upload_base_delay_ms: u64,

    /// Maximum delay between commit retries in milliseconds.
    #[serde(default = "default_upload_max_delay_ms")]
    pub upload_max_delay_ms: u64,

    /// Confidence threshold used until the first config refresh succeeds.
    #[serde(default = "default_confidence_threshold")]
    pub default_confidence_threshold: f32,
}

fn default_data_dir() -> String {
    "/var/lib/argus".to_string()
}
fn default_request_timeout_secs() -> u64 {
    15
}
fn default_failover_threshold() -> u32 {
    3
}
fn default_push_base_delay_ms() -> u64 {
    500
}
fn default_push_max_delay_ms() -> u64 {
    15000
}
fn default_config_refresh_interval_secs() -> u64 {
    60
}
fn default_upload_max_attempts() -> u32 {
    5
}
fn default_upload_base_delay_ms() -> u64 {
    500
}
fn default_upload_max_delay_ms() -> u64 {
    10000
}
fn default_confidence_threshold() -> f32 {
    0.5
}

impl PlatformConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn status_sync_config(&self) -> StatusSyncConfig {
        StatusSyncConfig {
            device_id: self.device_id.clone(),
            primary: Endpoint::new("primary", self.primary_url.clone()),
            fallback: self
                .fallback_url
                .as_ref()
                .map(|url| Endpoint::new("fallback", url.clone())),
            failover_threshold: self.failover_threshold,
            push_base_delay: Duration::from_millis(self.push_base_delay_ms),
            push_max_delay: Duration::from_millis(self.push_max_delay_ms),
            config_refresh_interval: Duration::from_secs(self.config_refresh_interval_secs),
            initial_config: DeviceConfig {
                confidence_threshold: self.default_confidence_threshold,
                config_version: 0,
            },
        }
    }

    pub fn checkout_config(&self) -> CheckoutConfig {
        CheckoutConfig {
            max_attempts: self.upload_max_attempts,
            base_delay: Duration::from_millis(self.upload_base_delay_ms),
            max_delay: Duration::from_millis(self.upload_max_delay_ms),
        }
    }

    pub fn validate(&self) -> Result<(), PlatformConfigError> {
        if self.device_id.is_empty() {
            return Err(PlatformConfigError::MissingField("platform.device_id"));
        }
        if self.primary_url.is_empty() {
            return Err(PlatformConfigError::MissingField("platform.primary_url"));
        }
        if !self.primary_url.starts_with("http://") && !self.primary_url.starts_with("https://") {
            return Err(PlatformConfigError::InvalidValue {
                field: "platform.primary_url",
                message: "must be an http(s) URL".to_string(),
            });
        }
        if let Some(url) = &self.fallback_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(PlatformConfigError::InvalidValue {
                    field: "platform.fallback_url",
                    message: "must be an http(s) URL".to_string(),
                });
            }
        }
        if self.upload_max_attempts == 0 {
            return Err(PlatformConfigError::InvalidValue {
                field: "platform.upload_max_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.default_confidence_threshold) {
            return Err(PlatformConfigError::InvalidValue {
                field: "platform.default_confidence_threshold",
                message: "must be within [0, 1]".to_string(),
            });
        }
        Ok(())
    }
}

/// Platform configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum PlatformConfigError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}
