//! Dispatch engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    circuit_breaker::CircuitBreakerConfig, error::SystemError, policy::RetryPolicy,
    rate_limiter::RateLimitConfig,
};

const fn default_worker_count() -> usize {
    30
}

const fn default_page_size() -> usize {
    1000
}

const fn default_page_pause_ms() -> u64 {
    100
}

const fn default_send_timeout_secs() -> u64 {
    20
}

const fn default_batch_budget_secs() -> u64 {
    300 // 5 minutes
}

/// Configuration for a [`DispatchEngine`](crate::DispatchEngine)
///
/// Every field has a default, so an empty `()` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Provider calls that may be in flight at once, per campaign
    ///
    /// Default: 30
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Messages loaded per page
    ///
    /// Default: 1000
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Pause between page loads (in milliseconds)
    ///
    /// Default: 100
    #[serde(default = "default_page_pause_ms")]
    pub page_pause_ms: u64,

    /// Upper bound on a single provider call (in seconds)
    ///
    /// A call that runs longer is treated as a transient failure.
    ///
    /// Default: 20 seconds
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// How long a batch, including its retries, may run (in seconds)
    ///
    /// Messages still outstanding when the budget runs out stay pending.
    ///
    /// Default: 300 seconds (5 minutes)
    #[serde(default = "default_batch_budget_secs")]
    pub batch_budget_secs: u64,

    /// Dispatch without charging quota
    ///
    /// Default: `false`
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            page_size: default_page_size(),
            page_pause_ms: default_page_pause_ms(),
            send_timeout_secs: default_send_timeout_secs(),
            batch_budget_secs: default_batch_budget_secs(),
            dry_run: false,
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub const fn page_pause(&self) -> Duration {
        Duration::from_millis(self.page_pause_ms)
    }

    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    #[must_use]
    pub const fn batch_budget(&self) -> Duration {
        Duration::from_secs(self.batch_budget_secs)
    }

    /// Reject configurations the engine cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::Configuration`] naming the first invalid field
    pub fn validate(&self) -> Result<(), SystemError> {
        let invalid = |what: &str| Err(SystemError::Configuration(what.to_string()));

        if self.worker_count == 0 {
            return invalid("worker_count must be at least 1");
        }
        if self.page_size == 0 {
            return invalid("page_size must be at least 1");
        }
        if self.send_timeout_secs == 0 {
            return invalid("send_timeout_secs must be at least 1");
        }
        let rate = self.rate_limit.messages_per_second;
        if rate.is_nan() || rate <= 0.0 {
            return invalid("rate_limit.messages_per_second must be positive");
        }
        if self.rate_limit.capacity() < 1.0 {
            return invalid("rate_limit.burst_size must allow at least one message");
        }
        let threshold = self.circuit_breaker.failure_ratio_threshold;
        if threshold.is_nan() || threshold <= 0.0 || threshold > 1.0 {
            return invalid("circuit_breaker.failure_ratio_threshold must be in (0, 1]");
        }
        if self.circuit_breaker.check_interval_secs == 0 {
            return invalid("circuit_breaker.check_interval_secs must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return invalid("retry.jitter_factor must be in [0, 1]");
        }

        Ok(())
    }
}
