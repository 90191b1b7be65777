//! Configuration management for the Argus agent.
//!
//! Configuration is loaded from config files and `ARGUS`-prefixed
//! environment variables, then validated before any service starts.

use argus_platform::config::{PlatformConfig, PlatformConfigError};
use argus_vision::config::{VisionConfig, VisionConfigError};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Platform connectivity and local store
    pub platform: PlatformConfig,

    /// Camera and detection pipeline
    #[serde(default)]
    pub vision: VisionConfig,

    /// Maintenance session behaviour
    #[serde(default)]
    pub session: SessionConfig,

    /// Service startup and supervision
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Operator status API
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Prometheus metrics export
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Maintenance session timing.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Session lifetime in seconds.
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,

    /// Seconds before expiry at which the operator is warned.
    #[serde(default = "default_warn_window_secs")]
    pub warn_window_secs: u64,

    /// Lifetime granted by a heartbeat, in seconds.
    #[serde(default = "default_session_ttl_secs")]
    pub heartbeat_extension_secs: u64,

    /// Closed sessions kept in the in-memory archive.
    #[serde(default = "default_archive_capacity")]
    pub archive_capacity: usize,
}

/// Service startup and supervision configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Interval between supervised health checks in seconds.
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    /// Health-check attempts granted to a starting service.
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,

    /// Base delay between startup health polls in milliseconds.
    #[serde(default = "default_startup_base_delay_ms")]
    pub startup_base_delay_ms: u64,

    /// Restart attempts before a service is marked failed.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Base delay between restart attempts in milliseconds.
    #[serde(default = "default_restart_base_delay_ms")]
    pub restart_base_delay_ms: u64,

    /// Maximum delay between restart attempts in milliseconds.
    #[serde(default = "default_restart_max_delay_ms")]
    pub restart_max_delay_ms: u64,
}

/// Operator status API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_session_ttl_secs() -> u64 {
    900
}
fn default_warn_window_secs() -> u64 {
    60
}
fn default_archive_capacity() -> usize {
    32
}
fn default_health_interval_secs() -> u64 {
    30
}
fn default_startup_attempts() -> u32 {
    3
}
fn default_startup_base_delay_ms() -> u64 {
    500
}
fn default_max_restarts() -> u32 {
    5
}
fn default_restart_base_delay_ms() -> u64 {
    1000
}
fn default_restart_max_delay_ms() -> u64 {
    30000
}
fn default_api_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8088
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_metrics_port() -> u16 {
    9600
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            warn_window_secs: default_warn_window_secs(),
            heartbeat_extension_secs: default_session_ttl_secs(),
            archive_capacity: default_archive_capacity(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval_secs(),
            startup_attempts: default_startup_attempts(),
            startup_base_delay_ms: default_startup_base_delay_ms(),
            max_restarts: default_max_restarts(),
            restart_base_delay_ms: default_restart_base_delay_ms(),
            restart_max_delay_ms: default_restart_max_delay_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn warn_window(&self) -> Duration {
        Duration::from_secs(self.warn_window_secs)
    }

    pub fn heartbeat_extension(&self) -> Duration {
        Duration::from_secs(self.heartbeat_extension_secs)
    }
}

impl OrchestratorConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn startup_base_delay(&self) -> Duration {
        Duration::from_millis(self.startup_base_delay_ms)
    }

    pub fn restart_base_delay(&self) -> Duration {
        Duration::from_millis(self.restart_base_delay_ms)
    }

    pub fn restart_max_delay(&self) -> Duration {
        Duration::from_millis(self.restart_max_delay_ms)
    }
}

impl AgentConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Sources, later overriding earlier:
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{RUN_MODE}.toml)
    /// 3. Environment variables (e.g. ARGUS_PLATFORM__DEVICE_ID)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("ARGUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("ARGUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), AgentConfigError> {
        self.platform.validate()?;
        self.vision.validate()?;

        if self.session.ttl_secs == 0 {
            return Err(AgentConfigError::InvalidValue {
                field: "session.ttl_secs",
                message: "must be at least 1".to_string(),
            });
        }
        if self.session.warn_window_secs >= self.session.ttl_secs {
            return Err(AgentConfigError::InvalidValue {
                field: "session.warn_window_secs",
                message: "must be shorter than the session ttl".to_string(),
            });
        }
        if self.orchestrator.startup_attempts == 0 {
            return Err(AgentConfigError::InvalidValue {
                field: "orchestrator.startup_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Agent configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentConfigError {
    #[error(transparent)]
    Platform(#[from] PlatformConfigError),

    #[error(transparent)]
    Vision(#[from] VisionConfigError),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}
