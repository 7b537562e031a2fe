//! Retry policy for delivery cycles.
//!
//! A cycle is one pass over every eligible provider. When a cycle ends
//! without delivery, the message is rescheduled according to this policy, or
//! dead-lettered once `max_attempts` cycles have run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::retry::calculate_retry_delay;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery cycles before the message is dead-lettered.
    ///
    /// Default: 10 cycles
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff (in seconds).
    ///
    /// The delay after cycle `n` is `base * 2^(n - 1)`.
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::base_retry_delay_secs")]
    pub base_retry_delay_secs: u64,

    /// Maximum retry delay (in seconds).
    ///
    /// Default: 86400 seconds (24 hours)
    #[serde(default = "defaults::max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,

    /// Jitter factor for randomizing retry delays.
    ///
    /// The delay is randomized within ±`jitter_factor` so that messages
    /// failing together do not all retry together.
    ///
    /// Default: 0.2 (±20%)
    #[serde(default = "defaults::retry_jitter_factor")]
    pub retry_jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_retry_delay_secs: defaults::base_retry_delay_secs(),
            max_retry_delay_secs: defaults::max_retry_delay_secs(),
            retry_jitter_factor: defaults::retry_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Whether another cycle may run after `cycles` have completed.
    #[must_use]
    pub const fn should_retry(&self, cycles: u32) -> bool {
        cycles < self.max_attempts
    }

    /// When the next cycle should run, given `cycles` completed so far.
    #[must_use]
    pub fn calculate_next_retry(&self, cycles: u32) -> DateTime<Utc> {
        let delay = calculate_retry_delay(
            cycles.max(1),
            self.base_retry_delay_secs,
            self.max_retry_delay_secs,
            self.retry_jitter_factor,
        );

        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    #[must_use]
    pub const fn remaining_attempts(&self, cycles: u32) -> u32 {
        self.max_attempts.saturating_sub(cycles)
    }
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        10
    }

    pub const fn base_retry_delay_secs() -> u64 {
        60
    }

    pub const fn max_retry_delay_secs() -> u64 {
        86400 // 24 hours
    }

    pub const fn retry_jitter_factor() -> f64 {
        0.2
    }
}
