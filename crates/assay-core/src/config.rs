//! Orchestrator configuration
//!
//! Every field has a default, so an empty TOML document is a valid config.
//!
//! ```toml
//! failure_policy = "compensate"
//! max_planning_rounds = 20
//!
//! [retry]
//! max_retries = 5
//! initial_backoff_ms = 500
//!
//! [timeouts]
//! base_ms = 60000
//! multipliers = { low = 1, medium = 2, high = 4, critical = 8 }
//!
//! [event_log]
//! kind = "file"
//! dir = "/var/lib/assay/logs"
//!
//! [log]
//! format = "json"
//! level = "info"
//! ```

use crate::error::ConfigError;
use crate::telemetry::LogConfig;
use assay_kernel::{FailurePolicy, RetryPolicy, TimeoutPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where workflow logs are kept
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventLogConfig {
    /// Lost on exit; for tests and dry runs
    #[default]
    Memory,
    /// One JSON-lines segment per workflow under `dir`
    File { dir: PathBuf },
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    pub timeouts: TimeoutPolicy,
    pub failure_policy: FailurePolicy,
    /// Planner rounds that may produce steps; unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_planning_rounds: Option<u32>,
    /// Queued signals before senders wait
    pub signal_buffer: usize,
    pub event_log: EventLogConfig,
    pub log: LogConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeouts: TimeoutPolicy::default(),
            failure_policy: FailurePolicy::default(),
            max_planning_rounds: None,
            signal_buffer: 64,
            event_log: EventLogConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With retry policy
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// With timeout policy
    #[inline]
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutPolicy) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// With failure policy
    #[inline]
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// With planning bound
    #[inline]
    #[must_use]
    pub fn with_max_planning_rounds(mut self, rounds: u32) -> Self {
        self.max_planning_rounds = Some(rounds);
        self
    }

    /// With file-backed logs under `dir`
    #[inline]
    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.event_log = EventLogConfig::File { dir: dir.into() };
        self
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let retry = &self.retry;
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(ConfigError::invalid("retry.multiplier", "must be a finite value >= 1"));
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            return Err(ConfigError::invalid(
                "retry.initial_backoff_ms",
                "must not exceed retry.max_backoff_ms",
            ));
        }

        let timeouts = &self.timeouts;
        for (field, value) in [
            ("timeouts.base_ms", timeouts.base_ms),
            ("timeouts.compensation_ms", timeouts.compensation_ms),
            ("timeouts.health_check_ms", timeouts.health_check_ms),
            ("timeouts.cancel_ms", timeouts.cancel_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        if !timeouts.multipliers.is_monotonic() {
            return Err(ConfigError::invalid(
                "timeouts.multipliers",
                "must be positive and strictly increase from low to critical",
            ));
        }

        if self.max_planning_rounds == Some(0) {
            return Err(ConfigError::invalid("max_planning_rounds", "must be at least 1"));
        }
        if self.signal_buffer == 0 {
            return Err(ConfigError::invalid("signal_buffer", "must be at least 1"));
        }
        if let EventLogConfig::File { dir } = &self.event_log {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::invalid("event_log.dir", "must not be empty"));
            }
        }
        self.log
            .validate()
            .map_err(|e| ConfigError::invalid("log.level", e.to_string()))
    }
}
