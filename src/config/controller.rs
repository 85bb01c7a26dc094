//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Operator settings shared by all four controllers
///
/// Every field falls back to its `DEFAULT_*` constant when the variable is unset or unparsable.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// HTTP port for `/metrics`, `/healthz` and `/readyz`
    pub metrics_port: u16,
    /// How long to wait for the HTTP server to bind (seconds)
    pub server_startup_timeout_secs: u64,
    /// Readiness poll interval while waiting for the HTTP server (milliseconds)
    pub server_poll_interval_ms: u64,
    /// Fixed requeue delay after a recorded failure (seconds)
    pub failure_requeue_secs: u64,
    /// Attempts for the conflict-retrying status updater
    pub status_update_attempts: u32,
    /// Base delay for the status updater's exponential backoff (milliseconds)
    pub status_retry_base_ms: u64,
    /// Attempts for finalizer add/remove
    pub finalizer_update_attempts: u32,
    /// Watch stream backoff starting value (milliseconds)
    pub backoff_start_ms: u64,
    /// Watch stream backoff maximum value (milliseconds)
    pub backoff_max_ms: u64,
    /// Watch stream restart delay after unknown errors (seconds)
    pub watch_restart_delay_secs: u64,
    /// Watch stream restart delay after the stream ends (seconds)
    pub watch_restart_delay_after_end_secs: u64,
    /// Namespace to watch; `None` watches all namespaces
    pub watch_namespace: Option<String>,
    /// Root directory for module fetch workspaces and stack workspaces
    pub work_dir: PathBuf,
    /// Prefix for derived backend state keys
    pub state_key_prefix: String,
    /// Provisioning tool binary
    pub terraform_bin: String,
    /// Introspection tool binary
    pub terraform_docs_bin: String,
    /// Maximum concurrent reconciliations per controller
    pub max_concurrent_reconciliations: u16,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            server_startup_timeout_secs: DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            server_poll_interval_ms: DEFAULT_SERVER_POLL_INTERVAL_MS,
            failure_requeue_secs: DEFAULT_FAILURE_REQUEUE_SECS,
            status_update_attempts: DEFAULT_STATUS_UPDATE_ATTEMPTS,
            status_retry_base_ms: DEFAULT_STATUS_RETRY_BASE_MS,
            finalizer_update_attempts: DEFAULT_FINALIZER_UPDATE_ATTEMPTS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            watch_restart_delay_after_end_secs: DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS,
            watch_namespace: None,
            work_dir: std::env::temp_dir().join(DEFAULT_WORK_DIR_NAME),
            state_key_prefix: DEFAULT_STATE_KEY_PREFIX.to_string(),
            terraform_bin: DEFAULT_TERRAFORM_BIN.to_string(),
            terraform_docs_bin: DEFAULT_TERRAFORM_DOCS_BIN.to_string(),
            max_concurrent_reconciliations: DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            log_format: "text".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        let work_dir = std::env::var("WORK_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map_or_else(
                || std::env::temp_dir().join(DEFAULT_WORK_DIR_NAME),
                PathBuf::from,
            );
        Self {
            metrics_port: env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT),
            server_startup_timeout_secs: env_var_or_default(
                "SERVER_STARTUP_TIMEOUT_SECS",
                DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            ),
            server_poll_interval_ms: env_var_or_default(
                "SERVER_POLL_INTERVAL_MS",
                DEFAULT_SERVER_POLL_INTERVAL_MS,
            ),
            failure_requeue_secs: env_var_or_default(
                "FAILURE_REQUEUE_SECS",
                DEFAULT_FAILURE_REQUEUE_SECS,
            ),
            status_update_attempts: env_var_or_default(
                "STATUS_UPDATE_ATTEMPTS",
                DEFAULT_STATUS_UPDATE_ATTEMPTS,
            )
            .max(1),
            status_retry_base_ms: env_var_or_default(
                "STATUS_RETRY_BASE_MS",
                DEFAULT_STATUS_RETRY_BASE_MS,
            ),
            finalizer_update_attempts: env_var_or_default(
                "FINALIZER_UPDATE_ATTEMPTS",
                DEFAULT_FINALIZER_UPDATE_ATTEMPTS,
            )
            .max(1),
            backoff_start_ms: env_var_or_default("BACKOFF_START_MS", DEFAULT_BACKOFF_START_MS),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                DEFAULT_WATCH_RESTART_DELAY_SECS,
            ),
            watch_restart_delay_after_end_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_AFTER_END_SECS",
                DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS,
            ),
            watch_namespace: std::env::var("WATCH_NAMESPACE")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            work_dir,
            state_key_prefix: env_var_or_default_str("STATE_KEY_PREFIX", DEFAULT_STATE_KEY_PREFIX),
            terraform_bin: env_var_or_default_str("TERRAFORM_BIN", DEFAULT_TERRAFORM_BIN),
            terraform_docs_bin: env_var_or_default_str(
                "TERRAFORM_DOCS_BIN",
                DEFAULT_TERRAFORM_DOCS_BIN,
            ),
            max_concurrent_reconciliations: env_var_or_default(
                "MAX_CONCURRENT_RECONCILIATIONS",
                DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            ),
            log_format: env_var_or_default_str("LOG_FORMAT", "text"),
        }
    }

    /// Requeue delay after a recorded failure
    pub fn failure_requeue_duration(&self) -> Duration {
        Duration::from_secs(self.failure_requeue_secs)
    }

    /// Pause before restarting a watch stream that errored
    pub fn watch_restart_delay_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }

    /// Pause before restarting a watch stream that ended
    pub fn watch_restart_delay_after_end_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_after_end_secs)
    }

    /// Delay before status update attempt `attempt` (0-based) is retried
    pub fn status_retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.status_retry_base_ms.saturating_mul(1_u64 << attempt.min(16)))
    }

    /// Directory for one Module's fetch workspace
    pub fn module_workspace(&self, name: &str, uid: &str) -> PathBuf {
        self.work_dir.join("modules").join(format!("{name}-{uid}"))
    }

    /// Directory for one Stack's rendered workspace
    pub fn stack_workspace(&self, namespace: &str, name: &str) -> PathBuf {
        self.work_dir.join("stacks").join(namespace).join(name)
    }
}

fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_constants() {
        let config = ControllerConfig::default();
        assert_eq!(config.metrics_port, 5000);
        assert_eq!(config.failure_requeue_duration(), Duration::from_secs(60));
        assert_eq!(config.status_update_attempts, 7);
        assert_eq!(config.state_key_prefix, "astrolabe");
        assert!(config.watch_namespace.is_none());
    }

    #[test]
    fn test_status_retry_delay_doubles() {
        let config = ControllerConfig {
            status_retry_base_ms: 5,
            ..ControllerConfig::default()
        };
        assert_eq!(config.status_retry_delay(0), Duration::from_millis(5));
        assert_eq!(config.status_retry_delay(1), Duration::from_millis(10));
        assert_eq!(config.status_retry_delay(4), Duration::from_millis(80));
    }

    #[test]
    fn test_workspace_paths() {
        let config = ControllerConfig {
            work_dir: PathBuf::from("/var/lib/astrolabe"),
            ..ControllerConfig::default()
        };
        assert_eq!(
            config.module_workspace("vpc", "1234"),
            PathBuf::from("/var/lib/astrolabe/modules/vpc-1234")
        );
        assert_eq!(
            config.stack_workspace("team-a", "network"),
            PathBuf::from("/var/lib/astrolabe/stacks/team-a/network")
        );
    }
}
