//! Retry, timeout and failure policies
//!
//! All durations serialise as milliseconds so policies can be written in
//! configuration files.

use crate::types::Priority;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
    /// Retry even when the endpoint reports itself unhealthy
    pub retry_unhealthy: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 60_000,
            retry_unhealthy: false,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// With max retries
    #[inline]
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// With backoff bounds
    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = duration_ms(initial);
        self.max_backoff_ms = duration_ms(max);
        self
    }

    /// With unhealthy retry flag
    #[inline]
    #[must_use]
    pub fn with_retry_unhealthy(mut self, retry_unhealthy: bool) -> Self {
        self.retry_unhealthy = retry_unhealthy;
        self
    }

    /// Delay before retry number `retry` (0-based)
    ///
    /// `initial × multiplier^retry`, capped at `max_backoff`.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let raw = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let capped = raw.min(self.max_backoff_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Whether another retry is allowed after `retries_so_far`
    #[inline]
    #[must_use]
    pub fn allows_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }
}

/// Per-priority multipliers on the base timeout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityMultipliers {
    pub low: u32,
    pub medium: u32,
    pub high: u32,
    pub critical: u32,
}

impl Default for PriorityMultipliers {
    fn default() -> Self {
        Self {
            low: 1,
            medium: 2,
            high: 4,
            critical: 8,
        }
    }
}

impl PriorityMultipliers {
    /// Multiplier for a priority
    #[must_use]
    pub fn for_priority(&self, priority: Priority) -> u32 {
        match priority {
            Priority::Low => self.low,
            Priority::Medium => self.medium,
            Priority::High => self.high,
            Priority::Critical => self.critical,
        }
    }

    /// Strictly increasing with priority
    #[must_use]
    pub fn is_monotonic(&self) -> bool {
        self.low > 0
            && self.low < self.medium
            && self.medium < self.high
            && self.high < self.critical
    }
}

/// Dispatch timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    /// Timeout of a low priority call
    pub base_ms: u64,
    pub multipliers: PriorityMultipliers,
    /// Timeout of a compensating action
    pub compensation_ms: u64,
    /// Timeout of a health check
    pub health_check_ms: u64,
    /// Timeout of a best-effort cancel
    pub cancel_ms: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            base_ms: 15 * 60 * 1_000,
            multipliers: PriorityMultipliers::default(),
            compensation_ms: 10 * 60 * 1_000,
            health_check_ms: 5_000,
            cancel_ms: 5_000,
        }
    }
}

impl TimeoutPolicy {
    /// With base timeout
    #[inline]
    #[must_use]
    pub fn with_base(mut self, base: Duration) -> Self {
        self.base_ms = duration_ms(base);
        self
    }

    /// With compensation timeout
    #[inline]
    #[must_use]
    pub fn with_compensation(mut self, timeout: Duration) -> Self {
        self.compensation_ms = duration_ms(timeout);
        self
    }

    /// Call timeout for a priority
    #[must_use]
    pub fn for_priority(&self, priority: Priority) -> Duration {
        Duration::from_millis(
            self.base_ms
                .saturating_mul(u64::from(self.multipliers.for_priority(priority))),
        )
    }

    /// Compensation timeout
    #[inline]
    #[must_use]
    pub fn compensation(&self) -> Duration {
        Duration::from_millis(self.compensation_ms)
    }

    /// Health check timeout
    #[inline]
    #[must_use]
    pub fn health_check(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }

    /// Cancel timeout
    #[inline]
    #[must_use]
    pub fn cancel(&self) -> Duration {
        Duration::from_millis(self.cancel_ms)
    }
}

/// What a task failure does to its workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Cancel outstanding tasks and fail the workflow
    #[default]
    FailWorkflow,
    /// Compensate upstream work, cancel dependents, consult the planner again
    Compensate,
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
