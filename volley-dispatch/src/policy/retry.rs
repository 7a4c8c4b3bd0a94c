//! Retry policy for provider calls.
//!
//! Decides whether a transiently failed attempt gets another try and how long
//! it waits first, independently of the dispatcher that acts on it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::retry::calculate_backoff;

/// Retry policy configuration for dispatch.
///
/// Attempts are 0-indexed: attempt 0 is the first dispatch, so a message may
/// be sent at most `max_retries + 1` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    ///
    /// Default: 3
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (in seconds).
    ///
    /// The delay after attempt `n` is `base * 2^n`.
    ///
    /// Default: 1 second
    #[serde(default = "defaults::base_delay_secs")]
    pub base_delay_secs: u64,

    /// Maximum retry delay (in seconds).
    ///
    /// Default: 10 seconds
    #[serde(default = "defaults::max_delay_secs")]
    pub max_delay_secs: u64,

    /// Jitter factor for randomizing retry delays within ±`jitter_factor`.
    ///
    /// Default: 0.0 (no jitter)
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            base_delay_secs: defaults::base_delay_secs(),
            max_delay_secs: defaults::max_delay_secs(),
            jitter_factor: defaults::jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Whether a transient failure on `attempt` may be retried.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before retrying after `attempt` failed.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        calculate_backoff(
            attempt,
            self.base_delay_secs,
            self.max_delay_secs,
            self.jitter_factor,
        )
    }

    /// Retries left after `attempt`.
    #[must_use]
    pub const fn remaining_retries(&self, attempt: u32) -> u32 {
        self.max_retries.saturating_sub(attempt)
    }
}

mod defaults {
    pub const fn max_retries() -> u32 {
        3
    }

    pub const fn base_delay_secs() -> u64 {
        1
    }

    pub const fn max_delay_secs() -> u64 {
        10
    }

    pub const fn jitter_factor() -> f64 {
        0.0
    }
}
