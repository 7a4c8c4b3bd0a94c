//! Dispatch engine metrics
//!
//! Tracks outbound provider traffic:
//! - Attempts by outcome (sent / transient / terminal / deferred)
//! - Provider call latency by channel
//! - Active dispatch workers
//! - Circuit breaker trips
//! - Quota charged and refunded

use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter, UpDownCounter},
};

/// Dispatch metrics collector
#[derive(Debug)]
pub struct DispatchMetrics {
    /// Total number of dispatch attempts by outcome
    attempts_total: Counter<u64>,

    /// Distribution of provider call durations by channel
    send_duration_seconds: Histogram<f64>,

    /// Messages that reached `sent`
    messages_sent: Counter<u64>,

    /// Messages that reached `failed`
    messages_failed: Counter<u64>,

    /// Retries scheduled (transient failures and circuit deferrals)
    messages_retried: Counter<u64>,

    /// Distribution of retry counts before success
    retry_count: Histogram<u64>,

    /// Number of times the circuit breaker opened
    circuit_trips: Counter<u64>,

    /// Number of dispatch workers currently executing a provider call
    active_workers: UpDownCounter<i64>,

    /// Quota units charged against owners
    quota_charged: Counter<u64>,

    /// Quota units refunded to owners
    quota_refunded: Counter<u64>,

    active_worker_count: AtomicU64,
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchMetrics {
    /// Create a new dispatch metrics collector on the global meter provider
    #[must_use]
    pub fn new() -> Self {
        let meter = meter();

        Self {
            attempts_total: meter
                .u64_counter("volley.dispatch.attempts.total")
                .with_description("Total number of dispatch attempts by outcome")
                .build(),
            send_duration_seconds: meter
                .f64_histogram("volley.dispatch.send.duration.seconds")
                .with_description("Distribution of provider call durations by channel")
                .build(),
            messages_sent: meter
                .u64_counter("volley.dispatch.messages.sent.total")
                .with_description("Total number of messages accepted by the provider")
                .build(),
            messages_failed: meter
                .u64_counter("volley.dispatch.messages.failed.total")
                .with_description("Total number of messages permanently failed")
                .build(),
            messages_retried: meter
                .u64_counter("volley.dispatch.messages.retried.total")
                .with_description("Total number of retries scheduled")
                .build(),
            retry_count: meter
                .u64_histogram("volley.dispatch.retry.count")
                .with_description("Distribution of retry counts before success")
                .build(),
            circuit_trips: meter
                .u64_counter("volley.dispatch.circuit.trips.total")
                .with_description("Number of times the circuit breaker opened")
                .build(),
            active_workers: meter
                .i64_up_down_counter("volley.dispatch.workers.active")
                .with_description("Number of dispatch workers executing a provider call")
                .build(),
            quota_charged: meter
                .u64_counter("volley.quota.charged.total")
                .with_description("Quota units charged against owners")
                .build(),
            quota_refunded: meter
                .u64_counter("volley.quota.refunded.total")
                .with_description("Quota units refunded to owners")
                .build(),
            active_worker_count: AtomicU64::new(0),
        }
    }

    /// Record a dispatch attempt outcome
    pub fn record_attempt(&self, outcome: &'static str, channel: &str) {
        self.attempts_total.add(
            1,
            &[
                KeyValue::new("outcome", outcome),
                KeyValue::new("channel", channel.to_string()),
            ],
        );
    }

    /// Record a message accepted by the provider
    pub fn record_sent(&self, channel: &str, duration_secs: f64, retries: u64) {
        self.send_duration_seconds
            .record(duration_secs, &[KeyValue::new("channel", channel.to_string())]);
        self.messages_sent.add(1, &[]);
        self.retry_count.record(retries, &[]);
        self.record_attempt("sent", channel);
    }

    /// Record a permanently failed message
    pub fn record_failed(&self, channel: &str, reason: &'static str) {
        self.messages_failed
            .add(1, &[KeyValue::new("reason", reason)]);
        self.record_attempt("failed", channel);
    }

    /// Record a scheduled retry
    pub fn record_retry(&self, channel: &str, cause: &'static str) {
        self.messages_retried
            .add(1, &[KeyValue::new("cause", cause)]);
        self.record_attempt("retry", channel);
    }

    /// Record the circuit breaker opening
    pub fn record_circuit_trip(&self) {
        self.circuit_trips.add(1, &[]);
    }

    /// Record a worker starting a provider call
    pub fn record_worker_started(&self) {
        self.active_workers.add(1, &[]);
        self.active_worker_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a worker finishing a provider call
    pub fn record_worker_finished(&self) {
        self.active_workers.add(-1, &[]);
        self.active_worker_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current number of active workers as seen by this collector
    #[must_use]
    pub fn active_worker_count(&self) -> u64 {
        self.active_worker_count.load(Ordering::Relaxed)
    }

    /// Record quota charged against an owner
    pub fn record_quota_charged(&self, channel: &str, units: u64) {
        self.quota_charged
            .add(units, &[KeyValue::new("channel", channel.to_string())]);
    }

    /// Record quota refunded to an owner
    pub fn record_quota_refunded(&self, channel: &str, units: u64) {
        self.quota_refunded
            .add(units, &[KeyValue::new("channel", channel.to_string())]);
    }
}

/// Get the OpenTelemetry meter for dispatch metrics
fn meter() -> Meter {
    opentelemetry::global::meter("volley.dispatch")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_worker_tracking() {
        // Without a configured provider the global meter is a no-op, which is
        // enough to exercise the local bookkeeping.
        let metrics = DispatchMetrics::new();

        for _ in 0..5 {
            metrics.record_worker_started();
        }
        assert_eq!(metrics.active_worker_count(), 5);

        for _ in 0..3 {
            metrics.record_worker_finished();
        }
        assert_eq!(metrics.active_worker_count(), 2);
    }

    #[test]
    fn test_recording_on_noop_meter_does_not_panic() {
        let metrics = DispatchMetrics::default();
        metrics.record_sent("sms", 0.25, 2);
        metrics.record_failed("sms", "terminal");
        metrics.record_retry("sms", "transient");
        metrics.record_circuit_trip();
        metrics.record_quota_charged("sms", 10);
        metrics.record_quota_refunded("sms", 1);
    }
}
