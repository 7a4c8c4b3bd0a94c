//! Parallel dispatch of processing tasks
//!
//! Every task runs as its own tokio task, gated by the campaign's worker
//! semaphore. Retries do not hold a worker slot while they wait: the retry
//! worker pops them off the campaign's retry queue and resubmits them with
//! whatever backoff is left, and they only take a slot once it has elapsed.
//!
//! Stopping a campaign aborts these tasks. Once a provider call has been
//! issued it is no longer part of them: it finishes within the send timeout
//! on a task of its own and its outcome is recorded as usual.

pub mod attempt;
pub mod classify;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use volley_common::tracing;

pub use self::classify::{AttemptOutcome, classify, classify_response, is_transient_error};
use crate::{
    circuit_breaker::CircuitBreaker,
    policy::RetryPolicy,
    provider::Provider,
    rate_limiter::RateLimiter,
    registry::{CampaignContext, IdleOutcome},
    store::MessageStore,
    types::ProcessingTask,
};

/// What became of a task after one pass through the attempt algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Sent or failed
    Terminal,
    /// Back on the retry queue
    Requeued,
    /// Dropped because the campaign was stopped; the message stays pending
    Cancelled,
}

impl Disposition {
    /// Whether the task no longer counts as outstanding
    const fn settles(self) -> bool {
        !matches!(self, Self::Requeued)
    }
}

#[derive(Debug, Default)]
struct DispatchCounters {
    processed: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    active: AtomicUsize,
}

/// Engine-wide counter snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchTotals {
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
    pub retried: u64,
    pub active_workers: usize,
}

/// Runs tasks against the provider under the shared rate limiter and
/// circuit breaker
#[derive(Debug)]
pub struct Dispatcher {
    provider: Arc<dyn Provider>,
    messages: Arc<dyn MessageStore>,
    rate_limiter: Arc<RateLimiter>,
    circuit_breaker: Arc<CircuitBreaker>,
    retry_policy: RetryPolicy,
    send_timeout: Duration,
    counters: DispatchCounters,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        provider: Arc<dyn Provider>,
        messages: Arc<dyn MessageStore>,
        rate_limiter: Arc<RateLimiter>,
        circuit_breaker: Arc<CircuitBreaker>,
        retry_policy: RetryPolicy,
        send_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            messages,
            rate_limiter,
            circuit_breaker,
            retry_policy,
            send_timeout,
            counters: DispatchCounters::default(),
        }
    }

    pub const fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub const fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    pub fn totals(&self) -> DispatchTotals {
        DispatchTotals {
            processed: self.counters.processed.load(Ordering::Relaxed),
            success: self.counters.success.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            active_workers: self.counters.active.load(Ordering::Relaxed),
        }
    }

    /// Submit a page of first attempts and wait for it to settle
    ///
    /// Returns once every task and every retry it spawned has settled, the
    /// campaign is stopped, or `budget` has elapsed. Tasks still outstanding
    /// after the budget keep running in the background.
    pub async fn dispatch_batch(
        self: &Arc<Self>,
        context: &Arc<CampaignContext>,
        tasks: Vec<ProcessingTask>,
        budget: Duration,
    ) -> IdleOutcome {
        let submitted = tasks.len();
        context.begin(submitted);
        for task in tasks {
            self.submit(context, task, 0, Duration::ZERO);
        }

        let outcome = context.wait_idle_within(budget).await;
        tracing::debug!(
            campaign_id = %context.id(),
            submitted,
            ?outcome,
            "Batch settled"
        );
        outcome
    }

    /// Spawn one attempt of `task`, starting after `delay`
    ///
    /// The task must already be counted as outstanding on `context`.
    pub fn submit(
        self: &Arc<Self>,
        context: &Arc<CampaignContext>,
        task: ProcessingTask,
        attempt: u32,
        delay: Duration,
    ) {
        let dispatcher = Arc::clone(self);
        let job_context = Arc::clone(context);

        let handle = tokio::spawn(async move {
            let disposition = dispatcher
                .run_job(&job_context, task, attempt, delay)
                .await;
            if disposition.settles() {
                job_context.finish_one();
            }
        });

        context.track(handle.abort_handle());
    }

    async fn run_job(
        self: &Arc<Self>,
        context: &Arc<CampaignContext>,
        task: ProcessingTask,
        attempt: u32,
        delay: Duration,
    ) -> Disposition {
        if !delay.is_zero() {
            tokio::select! {
                () = context.cancelled() => return Disposition::Cancelled,
                () = tokio::time::sleep(delay) => {}
            }
        }

        let Ok(_permit) = context.workers().acquire().await else {
            return Disposition::Cancelled;
        };

        self.run_attempt(context, task, attempt).await
    }

    /// Drain the campaign's retry queue until `shutdown` fires
    pub fn spawn_retry_worker(
        self: &Arc<Self>,
        context: Arc<CampaignContext>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    retry = context.retry_queue().pop() => {
                        let delay = retry.remaining_delay();
                        tracing::trace!(
                            campaign_id = %context.id(),
                            message_id = %retry.task.message_id,
                            attempt = retry.attempt,
                            delay_ms = delay.as_millis(),
                            "Resubmitting retry"
                        );
                        dispatcher.submit(&context, retry.task, retry.attempt, delay);
                    }
                }
            }

            tracing::debug!(campaign_id = %context.id(), "Retry worker stopped");
        })
    }
}
