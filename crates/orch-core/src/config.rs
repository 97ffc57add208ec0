//! Environment Configuration Loader
//!
//! Loads environment variables from the canonical location: `/etc/orch/environment`
//! and builds [`OrchestratorConfig`] from them.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use orch_core::config::{load_environment, OrchestratorConfig};
//!
//! load_environment();
//! let config = OrchestratorConfig::from_env().expect("valid configuration");
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Alternative paths to check (in order of priority)
pub const ENV_FILE_PATHS: &[&str] = &["/etc/orch/environment", "/etc/orch.env", ".env"];

pub const DEFAULT_BUS_CAPACITY: usize = 1000;
pub const DEFAULT_COORDINATOR_NAME: &str = "orchestrator";

/// Load environment variables from the first env file found.
///
/// `ORCH_ENV_FILE` wins over the default paths. Existing variables are never
/// overridden. Returns the path that was loaded.
pub fn load_environment() -> Option<String> {
    if let Ok(custom_path) = std::env::var("ORCH_ENV_FILE") {
        if let Some(path) = try_load_env_file(&custom_path) {
            return Some(path);
        }
    }

    for path in ENV_FILE_PATHS {
        if let Some(loaded_path) = try_load_env_file(path) {
            return Some(loaded_path);
        }
    }

    debug!("No environment file found, using existing environment");
    None
}

fn try_load_env_file(path: &str) -> Option<String> {
    let path_obj = Path::new(path);
    if !path_obj.exists() {
        return None;
    }

    match fs::read_to_string(path_obj) {
        Ok(content) => {
            let mut loaded = 0;
            let mut skipped = 0;

            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }

                if let Some((key, value)) = parse_env_line(line) {
                    if std::env::var(&key).is_err() {
                        std::env::set_var(&key, &value);
                        loaded += 1;
                    } else {
                        skipped += 1;
                    }
                }
            }

            info!(path = %path, loaded, skipped, "Loaded environment file");
            Some(path.to_string())
        }
        Err(e) => {
            warn!(path = %path, error = %e, "Failed to read environment file");
            None
        }
    }
}

/// Parse `KEY=VALUE`, `KEY="VALUE"` or `KEY='VALUE'`.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let value = value.trim();

    if key.is_empty() {
        return None;
    }

    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);

    Some((key.to_string(), value.to_string()))
}

/// Get a configuration value with a default.
pub fn get_config(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get an optional configuration value.
pub fn get_config_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Get an unsigned integer value; unparsable values are a configuration error.
pub fn get_config_u64(key: &str) -> Result<Option<u64>> {
    match get_config_opt(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("{} must be an unsigned integer, got '{}'", key, raw))),
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum queued deliveries on the message bus
    pub bus_capacity: usize,
    /// How long `publish` waits for space before failing with `BusFull`
    pub publish_timeout: Duration,
    /// Default per-task deadline
    pub task_timeout: Duration,
    /// Bounded wait of each coordinator `receive`
    pub receive_poll_interval: Duration,
    /// Interval between overdue-task sweeps
    pub health_check_interval: Duration,
    /// Optional cap on how long a workflow run waits overall
    pub workflow_timeout: Option<Duration>,
    /// Bus name the coordinator receives on
    pub coordinator_name: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bus_capacity: DEFAULT_BUS_CAPACITY,
            publish_timeout: Duration::from_secs(5),
            task_timeout: Duration::from_secs(300),
            receive_poll_interval: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(1),
            workflow_timeout: None,
            coordinator_name: DEFAULT_COORDINATOR_NAME.to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Build from `ORCH_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(capacity) = get_config_u64("ORCH_BUS_CAPACITY")? {
            config.bus_capacity = capacity as usize;
        }
        if let Some(ms) = get_config_u64("ORCH_PUBLISH_TIMEOUT_MS")? {
            config.publish_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = get_config_u64("ORCH_TASK_TIMEOUT_SECS")? {
            config.task_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = get_config_u64("ORCH_POLL_INTERVAL_MS")? {
            config.receive_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = get_config_u64("ORCH_HEALTH_INTERVAL_MS")? {
            config.health_check_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = get_config_u64("ORCH_WORKFLOW_TIMEOUT_SECS")? {
            config.workflow_timeout = Some(Duration::from_secs(secs));
        }
        config.coordinator_name = get_config("ORCH_COORDINATOR_NAME", DEFAULT_COORDINATOR_NAME);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bus_capacity == 0 {
            return Err(Error::config("bus_capacity must be greater than zero"));
        }
        if self.task_timeout.is_zero() {
            return Err(Error::config("task_timeout must be greater than zero"));
        }
        if self.receive_poll_interval.is_zero() || self.health_check_interval.is_zero() {
            return Err(Error::config("poll and health intervals must be greater than zero"));
        }
        if self.coordinator_name.trim().is_empty() {
            return Err(Error::config("coordinator_name must not be empty"));
        }
        Ok(())
    }

    pub fn with_bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.receive_poll_interval = interval;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_workflow_timeout(mut self, timeout: Duration) -> Self {
        self.workflow_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_line_simple() {
        let (k, v) = parse_env_line("FOO=bar").unwrap();
        assert_eq!(k, "FOO");
        assert_eq!(v, "bar");
    }

    #[test]
    fn test_parse_env_line_quoted() {
        let (_, v) = parse_env_line("FOO=\"bar baz\"").unwrap();
        assert_eq!(v, "bar baz");
        let (_, v) = parse_env_line("FOO='bar'").unwrap();
        assert_eq!(v, "bar");
    }

    #[test]
    fn test_parse_env_line_empty() {
        assert!(parse_env_line("").is_none());
        assert!(parse_env_line("=value").is_none());
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.bus_capacity, 1000);
        assert_eq!(config.receive_poll_interval, Duration::from_secs(1));
        assert!(config.workflow_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = OrchestratorConfig::default().with_bus_capacity(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        std::env::set_var("ORCH_TEST_NOT_A_NUMBER", "ten");
        let err = get_config_u64("ORCH_TEST_NOT_A_NUMBER").unwrap_err();
        assert!(err.is_configuration());
        std::env::remove_var("ORCH_TEST_NOT_A_NUMBER");
    }
}
