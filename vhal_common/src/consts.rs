//! Workspace-wide constants.
//!
//! Single source of truth for timing defaults and names.

/// Canonical broker service name (logging, default `service_name`).
pub const BROKER_SERVICE_NAME: &str = "vhal-broker";

/// Default wall-clock budget for transient-status retries (ms).
pub const DEFAULT_RETRY_BUDGET_MS: u64 = 2000;

/// Default sleep between two transient-status retries (ms).
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 50;

/// Default response timeout for user HAL requests (ms).
pub const DEFAULT_USER_HAL_TIMEOUT_MS: u64 = 5000;

/// Default period of simulated continuous events (ms).
pub const DEFAULT_SIM_EVENT_INTERVAL_MS: u64 = 1000;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vhal/broker.toml";

/// Name of the thread draining transport notifications.
pub const DISPATCH_THREAD_NAME: &str = "vhal-dispatch";

/// Name of the thread firing user HAL request timeouts.
pub const TIMEOUT_THREAD_NAME: &str = "vhal-user-timeouts";
