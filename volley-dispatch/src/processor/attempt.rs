//! The per-attempt algorithm
//!
//! 1. Stopped campaign: leave the message pending
//! 2. Open circuit on a first attempt: defer onto the retry queue
//! 3. Take a rate-limit token, waiting if necessary
//! 4. Stopped while waiting: leave the message pending (the token is spent)
//! 5. Call the provider under the send timeout, on a task that a stop does
//!    not abort
//! 6. Record the classified outcome; transient failures of a stopped campaign
//!    are left pending instead of being retried

use std::sync::{Arc, atomic::Ordering};

use tokio::time::Instant;
use volley_common::{
    outgoing,
    tracing::{self, Instrument},
};

use super::{AttemptOutcome, Disposition, Dispatcher, classify};
use crate::{
    error::PermanentError,
    registry::CampaignContext,
    store::StatusUpdate,
    types::ProcessingTask,
};

/// Note recorded on messages deferred by the circuit breaker
pub const CIRCUIT_OPEN_NOTE: &str = "circuit open";

impl Dispatcher {
    #[tracing::instrument(
        level = "trace",
        skip_all,
        fields(campaign_id = %context.id(), message_id = %task.message_id, attempt = attempt)
    )]
    pub(crate) async fn run_attempt(
        self: &Arc<Self>,
        context: &Arc<CampaignContext>,
        task: ProcessingTask,
        attempt: u32,
    ) -> Disposition {
        if context.is_cancelled() {
            return Disposition::Cancelled;
        }

        if attempt == 0 && self.circuit_breaker.is_open() {
            tracing::debug!("Circuit breaker is open, deferring first attempt");
            self.defer(context, task, attempt, CIRCUIT_OPEN_NOTE, "circuit_open")
                .await;
            return Disposition::Requeued;
        }

        if let Err(e) = self
            .rate_limiter
            .consume_blocking(1, context.cancel_token())
            .await
        {
            tracing::debug!(error = %e, "No rate-limit token acquired");
            return Disposition::Cancelled;
        }

        if context.is_cancelled() {
            return Disposition::Cancelled;
        }

        let call = context.enter_call();
        let dispatcher = Arc::clone(self);
        let call_context = Arc::clone(context);
        let issued = tokio::spawn(
            async move {
                let _call = call;
                let outcome = dispatcher.call_provider(&call_context, &task, attempt).await;
                dispatcher
                    .record_outcome(&call_context, task, attempt, outcome)
                    .await
            }
            .in_current_span(),
        );

        issued.await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Provider call task ended abnormally");
            Disposition::Cancelled
        })
    }

    async fn record_outcome(
        &self,
        context: &CampaignContext,
        task: ProcessingTask,
        attempt: u32,
        outcome: AttemptOutcome,
    ) -> Disposition {
        match outcome {
            AttemptOutcome::Sent {
                provider_message_id,
            } => {
                outgoing!(
                    level = DEBUG,
                    "Message {} accepted by provider after {} retries",
                    task.message_id,
                    attempt
                );
                self.write_status(&StatusUpdate::sent(
                    task.message_id,
                    provider_message_id,
                    attempt,
                ))
                .await;
                context.record_success();
                self.counters.success.fetch_add(1, Ordering::Relaxed);
                Disposition::Terminal
            }
            AttemptOutcome::Transient(error) => {
                self.circuit_breaker.record_failure();

                if context.is_cancelled() {
                    tracing::debug!(error = %error, "Transient failure after stop, leaving pending");
                    self.write_status(&StatusUpdate::pending(
                        task.message_id,
                        error.to_string(),
                        attempt,
                    ))
                    .await;
                    Disposition::Cancelled
                } else if self.retry_policy.should_retry(attempt) {
                    tracing::debug!(error = %error, "Transient failure, scheduling retry");
                    self.defer(context, task, attempt, &error.to_string(), "transient")
                        .await;
                    Disposition::Requeued
                } else {
                    let error = PermanentError::RetriesExhausted {
                        attempts: attempt + 1,
                        last_error: error.to_string(),
                    };
                    self.fail(context, &task, attempt, &error, "retries_exhausted")
                        .await;
                    Disposition::Terminal
                }
            }
            AttemptOutcome::Terminal(error) => {
                self.fail(context, &task, attempt, &error, "terminal").await;
                Disposition::Terminal
            }
        }
    }

    async fn call_provider(
        &self,
        context: &CampaignContext,
        task: &ProcessingTask,
        attempt: u32,
    ) -> AttemptOutcome {
        let channel = context.campaign().channel.to_string();
        let metrics = volley_metrics::metrics();

        self.circuit_breaker.record_attempt();
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.counters.active.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = metrics {
            metrics.dispatch.record_worker_started();
        }

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.send_timeout,
            self.provider
                .send_message(&task.credentials, &task.recipient, &task.content),
        )
        .await;
        let elapsed = started.elapsed();

        self.counters.active.fetch_sub(1, Ordering::Relaxed);
        let outcome = classify(result, self.send_timeout);

        if let Some(metrics) = metrics {
            metrics.dispatch.record_worker_finished();
            metrics.dispatch.record_attempt(outcome.label(), &channel);
            if matches!(outcome, AttemptOutcome::Sent { .. }) {
                metrics
                    .dispatch
                    .record_sent(&channel, elapsed.as_secs_f64(), u64::from(attempt));
            }
        }

        outcome
    }

    /// Put `task` back on the retry queue as the next attempt
    async fn defer(
        &self,
        context: &CampaignContext,
        task: ProcessingTask,
        attempt: u32,
        note: &str,
        cause: &'static str,
    ) {
        let delay = self.retry_policy.backoff(attempt);
        let message_id = task.message_id;

        context.retry_queue().push(task, attempt + 1, delay);
        context.record_retry();
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = volley_metrics::metrics() {
            metrics
                .dispatch
                .record_retry(&context.campaign().channel.to_string(), cause);
        }

        self.write_status(&StatusUpdate::pending(message_id, note, attempt))
            .await;
    }

    async fn fail(
        &self,
        context: &CampaignContext,
        task: &ProcessingTask,
        attempt: u32,
        error: &PermanentError,
        reason: &'static str,
    ) {
        let error = error.to_string();
        tracing::warn!(error = %error, "Message failed");

        self.write_status(&StatusUpdate::failed(task.message_id, error.as_str(), attempt))
            .await;
        context.record_failure(error);
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = volley_metrics::metrics() {
            metrics
                .dispatch
                .record_failed(&context.campaign().channel.to_string(), reason);
        }
    }

    /// Status writes are best-effort; the counters stay authoritative
    async fn write_status(&self, update: &StatusUpdate) {
        if let Err(e) = self.messages.update_message_status(update).await {
            tracing::error!(
                message_id = %update.message_id,
                status = %update.status,
                error = %e,
                "Failed to persist message status"
            );
        }
    }
}
