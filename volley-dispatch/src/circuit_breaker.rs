//! Provider-wide circuit breaker to prevent retry storms
//!
//! Workers report every provider call with [`CircuitBreaker::record_attempt`]
//! and every transient failure with [`CircuitBreaker::record_failure`]. A
//! monitor task evaluates the counters on a fixed interval and trips the
//! breaker when the failure ratio of the current window is too high.
//!
//! # State Transitions
//!
//! ```text
//! ┌─────────┐  ratio > threshold, samples >= min  ┌──────┐
//! │ Closed  │ ──────────────────────────────────> │ Open │
//! └─────────┘                                     └──────┘
//!     ^                                              │
//!     │              cool-down elapsed               │
//!     └──────────────────────────────────────────────┘
//! ```
//!
//! There is no half-open probe state. Once the cool-down has elapsed the
//! breaker closes with fresh counters and the next window decides whether it
//! trips again. Retries that are already scheduled keep flowing while the
//! breaker is open and serve as the recovery probe.
//!
//! # Example
//!
//! ```text
//! Threshold: 25%, min samples: 50, cool-down: 30s, check interval: 5s
//!
//! t=0s:   Closed, counting
//! t=5s:   50 attempts, 13 failures (26%) → Open
//! t=5s-35s: new messages are deferred onto the retry queue
//! t=35s:  cool-down elapsed → Closed with zeroed counters
//! ```

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use volley_common::tracing;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure ratio (failures / attempts) that trips the breaker once exceeded
    #[serde(default = "default_failure_ratio_threshold")]
    pub failure_ratio_threshold: f64,

    /// Attempts that must be observed in a window before it is evaluated
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,

    /// How long the breaker stays open (seconds)
    #[serde(default = "default_cool_down_secs")]
    pub cool_down_secs: u64,

    /// How often the monitor evaluates the counters (seconds)
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio_threshold: default_failure_ratio_threshold(),
            min_samples: default_min_samples(),
            cool_down_secs: default_cool_down_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub const fn cool_down(&self) -> Duration {
        Duration::from_secs(self.cool_down_secs)
    }

    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

const fn default_failure_ratio_threshold() -> f64 {
    0.25
}

const fn default_min_samples() -> u64 {
    50
}

const fn default_cool_down_secs() -> u64 {
    30
}

const fn default_check_interval_secs() -> u64 {
    5
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation, first attempts are dispatched
    Closed,
    /// Tripped, first attempts are deferred
    Open,
}

/// What an evaluation changed, if anything
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitTransition {
    /// The window exceeded the threshold
    Opened { attempts: u64, failures: u64 },
    /// The cool-down elapsed
    Reset,
}

#[derive(Debug)]
struct CircuitData {
    /// Provider calls in the current window
    attempts: u64,
    /// Transient failures in the current window
    failures: u64,
    state: CircuitState,
    opened_at: Option<Instant>,
}

impl CircuitData {
    const fn reset(&mut self) {
        self.attempts = 0;
        self.failures = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }

    #[allow(clippy::cast_precision_loss)]
    fn failure_ratio(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.failures as f64 / self.attempts as f64
        }
    }
}

/// Failure-ratio circuit breaker shared by every worker of an engine
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    data: Mutex<CircuitData>,
}

impl CircuitBreaker {
    #[must_use]
    pub const fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            data: Mutex::new(CircuitData {
                attempts: 0,
                failures: 0,
                state: CircuitState::Closed,
                opened_at: None,
            }),
        }
    }

    /// Count a provider call
    pub fn record_attempt(&self) {
        self.data.lock().attempts += 1;
    }

    /// Count a transient provider failure
    pub fn record_failure(&self) {
        self.data.lock().failures += 1;
    }

    pub fn is_open(&self) -> bool {
        self.data.lock().state == CircuitState::Open
    }

    pub fn state(&self) -> CircuitState {
        self.data.lock().state
    }

    /// Run one monitor tick
    ///
    /// An open breaker resets once the cool-down has elapsed. A closed breaker
    /// with at least `min_samples` attempts either trips, when the failure
    /// ratio exceeds the threshold, or starts a new window.
    pub fn evaluate(&self) -> Option<CircuitTransition> {
        let mut data = self.data.lock();

        match data.state {
            CircuitState::Open => {
                let cooled = data
                    .opened_at
                    .is_none_or(|opened| opened.elapsed() >= self.config.cool_down());
                if !cooled {
                    return None;
                }

                data.reset();
                drop(data);
                tracing::info!("Circuit breaker cool-down elapsed, closing");
                Some(CircuitTransition::Reset)
            }
            CircuitState::Closed => {
                if data.attempts < self.config.min_samples {
                    return None;
                }

                let ratio = data.failure_ratio();
                if ratio > self.config.failure_ratio_threshold {
                    let (attempts, failures) = (data.attempts, data.failures);
                    data.state = CircuitState::Open;
                    data.opened_at = Some(Instant::now());
                    drop(data);

                    tracing::warn!(
                        attempts,
                        failures,
                        failure_ratio = ratio,
                        threshold = self.config.failure_ratio_threshold,
                        cool_down_secs = self.config.cool_down_secs,
                        "Circuit breaker OPENED"
                    );
                    if let Some(metrics) = volley_metrics::metrics() {
                        metrics.dispatch.record_circuit_trip();
                    }

                    Some(CircuitTransition::Opened { attempts, failures })
                } else {
                    data.attempts = 0;
                    data.failures = 0;
                    None
                }
            }
        }
    }

    /// Evaluate the breaker every `check_interval` until `cancel` fires
    pub async fn monitor(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Circuit breaker monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.evaluate();
                }
            }
        }
    }

    /// Snapshot of the breaker for monitoring
    pub fn stats(&self) -> CircuitBreakerStats {
        let data = self.data.lock();
        CircuitBreakerStats {
            state: data.state,
            attempts: data.attempts,
            failures: data.failures,
            failure_ratio: data.failure_ratio(),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub attempts: u64,
    pub failures: u64,
    pub failure_ratio: f64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig::default())
    }

    fn record(breaker: &CircuitBreaker, attempts: u64, failures: u64) {
        for _ in 0..attempts {
            breaker.record_attempt();
        }
        for _ in 0..failures {
            breaker.record_failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_when_ratio_exceeds_threshold() {
        let breaker = breaker();
        record(&breaker, 50, 13);

        assert_eq!(
            breaker.evaluate(),
            Some(CircuitTransition::Opened {
                attempts: 50,
                failures: 13
            })
        );
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ratio_at_threshold_does_not_trip() {
        let breaker = breaker();
        record(&breaker, 100, 25);

        assert_eq!(breaker.evaluate(), None);
        assert_eq!(breaker.state(), CircuitState::Closed);
        // A healthy window starts a new one
        assert_eq!(breaker.stats().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_needs_min_samples() {
        let breaker = breaker();
        record(&breaker, 49, 49);

        assert_eq!(breaker.evaluate(), None);
        assert!(!breaker.is_open());
        assert_eq!(breaker.stats().attempts, 49);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resets_after_cool_down() {
        let breaker = breaker();
        record(&breaker, 50, 13);
        breaker.evaluate();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(breaker.evaluate(), None);
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.evaluate(), Some(CircuitTransition::Reset));

        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.attempts, 0);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_ignores_failures_while_open() {
        let breaker = breaker();
        record(&breaker, 50, 50);
        breaker.evaluate();

        // Probes keep failing during the cool-down
        record(&breaker, 10, 10);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(breaker.evaluate(), Some(CircuitTransition::Reset));
        assert!(!breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_trips_and_resets() {
        let breaker = Arc::new(breaker());
        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(Arc::clone(&breaker).monitor(cancel.clone()));

        record(&breaker, 60, 30);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(breaker.is_open());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!breaker.is_open());

        cancel.cancel();
        monitor.await.unwrap();
    }
}
