//! Broker configuration.
//!
//! Every section of `BrokerConfig` has defaults, so an empty TOML file is a
//! valid configuration. Files are read through the blanket [`ConfigLoader`]
//! implementation.
//!
//! ```toml
//! [shared]
//! service_name = "vhal-broker"
//! log_level = "debug"
//!
//! [transport]
//! retry_budget_ms = 2000
//! retry_interval_ms = 50
//!
//! [user]
//! timeout_ms = 5000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{
    BROKER_SERVICE_NAME, DEFAULT_RETRY_BUDGET_MS, DEFAULT_RETRY_INTERVAL_MS,
    DEFAULT_SIM_EVENT_INTERVAL_MS, DEFAULT_USER_HAL_TIMEOUT_MS,
};

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log verbosity, lowercase in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose.
    Trace,
    /// Development detail.
    Debug,
    /// Normal operation.
    #[default]
    Info,
    /// Potential problems.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

fn default_service_name() -> String {
    BROKER_SERVICE_NAME.to_string()
}

/// Fields common to every process built on this workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Instance identifier used in log output.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: default_service_name(),
        }
    }
}

impl SharedConfig {
    /// Rejects an empty `service_name`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_retry_budget_ms() -> u64 {
    DEFAULT_RETRY_BUDGET_MS
}

fn default_retry_interval_ms() -> u64 {
    DEFAULT_RETRY_INTERVAL_MS
}

/// Retry policy of the transport client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportConfig {
    /// Upper bound on time spent sleeping between transient retries.
    #[serde(default = "default_retry_budget_ms")]
    pub retry_budget_ms: u64,

    /// Fixed sleep between two attempts.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retry_budget_ms: DEFAULT_RETRY_BUDGET_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
        }
    }
}

impl TransportConfig {
    /// Retry budget as a `Duration`.
    pub fn retry_budget(&self) -> Duration {
        Duration::from_millis(self.retry_budget_ms)
    }

    /// Retry interval as a `Duration`.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Interval must be non-zero and must fit inside the budget.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "transport.retry_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.retry_interval_ms > self.retry_budget_ms {
            return Err(ConfigError::ValidationError(format!(
                "transport.retry_interval_ms ({}) exceeds retry_budget_ms ({})",
                self.retry_interval_ms, self.retry_budget_ms
            )));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_user_timeout_ms() -> u64 {
    DEFAULT_USER_HAL_TIMEOUT_MS
}

/// User HAL (identity) settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserHalConfig {
    /// Register the user HAL service at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Default response timeout for asynchronous user requests.
    #[serde(default = "default_user_timeout_ms")]
    pub timeout_ms: u64,

    /// Allow several in-flight requests of the same kind.
    /// When false a second request is rejected as a concurrent operation.
    #[serde(default)]
    pub allow_concurrent_requests: bool,
}

impl Default for UserHalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: DEFAULT_USER_HAL_TIMEOUT_MS,
            allow_concurrent_requests: false,
        }
    }
}

impl UserHalConfig {
    /// Response timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_event_interval_ms() -> u64 {
    DEFAULT_SIM_EVENT_INTERVAL_MS
}

/// Settings for the in-process simulated vehicle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimulationConfig {
    /// Period of the synthetic continuous-property events.
    #[serde(default = "default_event_interval_ms")]
    pub event_interval_ms: u64,

    /// Answer user HAL requests like an OEM implementation would.
    #[serde(default = "default_true")]
    pub emulate_user_hal: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            event_interval_ms: DEFAULT_SIM_EVENT_INTERVAL_MS,
            emulate_user_hal: true,
        }
    }
}

/// Top-level configuration of the broker process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Service identity and logging.
    #[serde(default)]
    pub shared: SharedConfig,

    /// Transport retry policy.
    #[serde(default)]
    pub transport: TransportConfig,

    /// User HAL service.
    #[serde(default)]
    pub user: UserHalConfig,

    /// Simulated vehicle.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl BrokerConfig {
    /// Validate every section.
    ///
    /// # Validation Rules
    /// 1. `shared.service_name` not empty
    /// 2. `transport.retry_interval_ms` > 0 and <= `retry_budget_ms`
    /// 3. `user.timeout_ms` > 0
    /// 4. `simulation.event_interval_ms` > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.transport.validate()?;
        if self.user.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "user.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.simulation.event_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "simulation.event_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Load from `path` and validate.
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Loads any deserializable type from a TOML file.
///
/// - `ConfigError::FileNotFound` if the file does not exist
/// - `ConfigError::ParseError` on I/O or TOML errors
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Read and parse `path`.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
