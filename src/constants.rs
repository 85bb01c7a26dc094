//! # Constants
//!
//! Shared constants used throughout the operator.
//!
//! These values represent reasonable defaults and can be overridden via
//! environment variables where applicable (see [`crate::config::ControllerConfig`]).

/// API group shared by all four custom resources
pub const API_GROUP: &str = "astrolabe.io";

/// Field manager / reporting component name
pub const CONTROLLER_NAME: &str = "astrolabe-operator";

/// Finalizer guarding Stack deletion until `destroy` has succeeded
pub const STACK_FINALIZER: &str = "stack.finalizers.astrolabe.io";

/// Default HTTP server port for metrics and health checks
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Fixed requeue delay after a recorded failure (fetch, parse, dependency, step, state)
pub const DEFAULT_FAILURE_REQUEUE_SECS: u64 = 60;

/// Attempts for the conflict-retrying status updater
pub const DEFAULT_STATUS_UPDATE_ATTEMPTS: u32 = 7;

/// Base delay for the status updater's exponential backoff (milliseconds)
pub const DEFAULT_STATUS_RETRY_BASE_MS: u64 = 5;

/// Attempts for finalizer add/remove
pub const DEFAULT_FINALIZER_UPDATE_ATTEMPTS: u32 = 3;

/// Default exponential backoff starting value for watch errors (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default exponential backoff maximum value for watch errors (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Default delay before restarting watch stream after unknown errors (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Default delay before restarting watch stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS: u64 = 1;

/// Error policy backoff bounds (minutes) for unexpected reconcile errors
pub const ERROR_BACKOFF_MIN_MINUTES: u64 = 1;
pub const ERROR_BACKOFF_MAX_MINUTES: u64 = 10;

/// Default maximum concurrent reconciliations per controller
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: u16 = 10;

/// Prefix for derived backend state keys
pub const DEFAULT_STATE_KEY_PREFIX: &str = "astrolabe";

/// Default provisioning tool binary
pub const DEFAULT_TERRAFORM_BIN: &str = "terraform";

/// Default introspection tool binary
pub const DEFAULT_TERRAFORM_DOCS_BIN: &str = "terraform-docs";

/// Name of the workspace directory under the system temp dir
pub const DEFAULT_WORK_DIR_NAME: &str = "astrolabe";

/// Tolerance when comparing a stored retry time against now (seconds)
pub const RETRY_GATE_TOLERANCE_SECS: i64 = 2;
