//! Running campaigns and their per-run state
//!
//! Every running campaign owns a [`CampaignContext`]: its cancellation token,
//! worker semaphore, retry queue, counters and the abort handles of the
//! tasks working on it. Provider calls that are already out run on their own
//! untracked task under a [`ProviderCall`] guard, so stopping a campaign never
//! drops an outcome the provider has produced. The [`CampaignRegistry`] maps campaign ids to their
//! contexts so a campaign can be stopped from anywhere.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{
    sync::{Semaphore, watch},
    task::AbortHandle,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use volley_common::{Campaign, CampaignId, CampaignProgress, tracing};

use crate::{error::SystemError, queue::RetryQueue, status::CampaignSummary};

/// Finished handles are pruned once this many are tracked
const HANDLE_PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Default)]
struct CampaignCounters {
    success: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    /// Successes already charged to the quota ledger
    charged: AtomicU64,
}

impl CampaignCounters {
    /// Carry on from the counters of earlier runs, all of which were settled
    fn resume(progress: &CampaignProgress) -> Self {
        Self {
            success: AtomicU64::new(progress.success),
            failed: AtomicU64::new(progress.failed),
            retried: AtomicU64::new(progress.retried),
            charged: AtomicU64::new(progress.success),
        }
    }
}

/// State of one campaign run
#[derive(Debug)]
pub struct CampaignContext {
    campaign: Campaign,
    cancel: CancellationToken,
    workers: Semaphore,
    retry_queue: RetryQueue,
    handles: Mutex<Vec<AbortHandle>>,
    counters: CampaignCounters,
    last_error: Mutex<Option<String>>,
    /// Tasks submitted and not yet settled (terminal, cancelled or re-queued)
    outstanding: watch::Sender<usize>,
    /// Provider calls that have been issued and not yet recorded
    in_flight: watch::Sender<usize>,
    stopped: AtomicBool,
    summary: Mutex<Option<CampaignSummary>>,
}

impl CampaignContext {
    /// Context for a new run of `campaign`
    ///
    /// Counters start from the progress stored on the record, so a campaign
    /// that is started again after a stop keeps the outcomes of earlier runs.
    #[must_use]
    pub fn new(campaign: Campaign, worker_count: usize) -> Self {
        Self {
            counters: CampaignCounters::resume(&campaign.progress),
            campaign,
            cancel: CancellationToken::new(),
            workers: Semaphore::new(worker_count),
            retry_queue: RetryQueue::new(),
            handles: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
            outstanding: watch::Sender::new(0),
            in_flight: watch::Sender::new(0),
            stopped: AtomicBool::new(false),
            summary: Mutex::new(None),
        }
    }

    pub const fn campaign(&self) -> &Campaign {
        &self.campaign
    }

    pub const fn id(&self) -> CampaignId {
        self.campaign.id
    }

    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the campaign was stopped by request, as opposed to finishing
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Worker slots; closed once the campaign is stopped
    pub fn workers(&self) -> &Semaphore {
        &self.workers
    }

    pub const fn retry_queue(&self) -> &RetryQueue {
        &self.retry_queue
    }

    /// Keep `handle` so the task can be aborted when the campaign stops
    pub fn track(&self, handle: AbortHandle) {
        let mut handles = self.handles.lock();
        if handles.len() >= HANDLE_PRUNE_THRESHOLD {
            handles.retain(|handle| !handle.is_finished());
        }
        handles.push(handle);
    }

    /// Abort every tracked task that is still running
    ///
    /// Tasks waiting on a provider call stop waiting, the call itself carries
    /// on under its [`ProviderCall`] guard.
    pub fn abort_all(&self) -> usize {
        let handles = std::mem::take(&mut *self.handles.lock());
        let mut aborted = 0;
        for handle in handles {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }

    /// Cancel the run: no new provider calls, no waiting workers, no retries
    ///
    /// Returns `false` if the campaign had already been stopped.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.cancel.cancel();
        self.workers.close();
        let dropped = self.retry_queue.drain().len();
        let aborted = self.abort_all();

        tracing::info!(
            campaign_id = %self.id(),
            aborted,
            dropped_retries = dropped,
            "Campaign stopped"
        );
        true
    }

    /// Register `count` newly submitted tasks
    pub fn begin(&self, count: usize) {
        self.outstanding.send_modify(|outstanding| *outstanding += count);
    }

    /// Settle one submitted task
    pub fn finish_one(&self) {
        self.outstanding
            .send_modify(|outstanding| *outstanding = outstanding.saturating_sub(1));
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Mark a provider call as issued until the returned guard is dropped
    pub fn enter_call(self: &Arc<Self>) -> ProviderCall {
        self.in_flight.send_modify(|in_flight| *in_flight += 1);
        ProviderCall {
            context: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Wait until every issued provider call has had its outcome recorded
    pub async fn wait_calls_settled(&self) {
        let mut settled = self.in_flight.subscribe();
        let _ = settled.wait_for(|in_flight| *in_flight == 0).await;
    }

    /// Wait until every submitted task has settled
    pub async fn wait_idle(&self) {
        let mut idle = self.outstanding.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = idle.wait_for(|outstanding| *outstanding == 0).await;
    }

    /// Wait until idle, cancelled, or `budget` has elapsed
    pub async fn wait_idle_within(&self, budget: Duration) -> IdleOutcome {
        tokio::select! {
            () = self.cancelled() => IdleOutcome::Cancelled,
            () = self.wait_idle() => IdleOutcome::Idle,
            () = tokio::time::sleep(budget) => IdleOutcome::BudgetExhausted {
                outstanding: self.outstanding(),
            },
        }
    }

    pub fn record_success(&self) {
        self.counters.success.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_failure(&self, error: impl Into<String>) {
        self.counters.failed.fetch_add(1, Ordering::AcqRel);
        *self.last_error.lock() = Some(error.into());
    }

    /// Turn one counted success into a failure reported after the fact
    ///
    /// Returns whether a charged success was given up, in which case the
    /// caller owes the ledger a refund. Otherwise the next settlement simply
    /// charges one unit less.
    pub fn record_late_failure(&self) -> bool {
        let _ = self
            .counters
            .success
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |success| success.checked_sub(1));
        self.counters.failed.fetch_add(1, Ordering::AcqRel);
        self.counters
            .charged
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |charged| charged.checked_sub(1))
            .is_ok()
    }

    pub fn record_retry(&self) {
        self.counters.retried.fetch_add(1, Ordering::AcqRel);
    }

    pub fn set_last_error(&self, error: impl Into<String>) {
        *self.last_error.lock() = Some(error.into());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Successes not yet charged to the quota ledger
    pub fn uncharged_successes(&self) -> u64 {
        self.counters
            .success
            .load(Ordering::Acquire)
            .saturating_sub(self.counters.charged.load(Ordering::Acquire))
    }

    pub fn mark_charged(&self, units: u64) {
        self.counters.charged.fetch_add(units, Ordering::AcqRel);
    }

    /// Current counters; pending is whatever has not reached a terminal status
    pub fn progress(&self) -> CampaignProgress {
        let success = self.counters.success.load(Ordering::Acquire);
        let failed = self.counters.failed.load(Ordering::Acquire);

        CampaignProgress {
            success,
            failed,
            pending: self
                .campaign
                .total_messages
                .saturating_sub(success + failed),
            retried: self.counters.retried.load(Ordering::Acquire),
        }
    }

    /// Record the final summary; only the first call decides how the run ended
    ///
    /// Returns the summary that was recorded and whether this call recorded it.
    pub fn finalize_with(&self, summary: impl FnOnce() -> CampaignSummary) -> (CampaignSummary, bool) {
        let mut recorded = self.summary.lock();
        if let Some(existing) = recorded.as_ref() {
            return (existing.clone(), false);
        }
        (recorded.insert(summary()).clone(), true)
    }

    /// Bring the recorded final summary up to date with the counters
    ///
    /// Outcomes of provider calls that were out when the campaign was stopped
    /// land after the stop was recorded. Returns the updated summary if it
    /// changed.
    pub fn refresh_final(&self) -> Option<CampaignSummary> {
        let progress = self.progress();
        let mut recorded = self.summary.lock();
        let summary = recorded.as_mut()?;
        if summary.progress == progress {
            return None;
        }
        summary.progress = progress;
        Some(summary.clone())
    }

    pub fn final_summary(&self) -> Option<CampaignSummary> {
        self.summary.lock().clone()
    }
}

/// A provider call that has been issued for a campaign
#[derive(Debug)]
pub struct ProviderCall {
    context: Arc<CampaignContext>,
}

impl Drop for ProviderCall {
    fn drop(&mut self) {
        self.context
            .in_flight
            .send_modify(|in_flight| *in_flight = in_flight.saturating_sub(1));
    }
}

/// How waiting for a batch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    Idle,
    Cancelled,
    BudgetExhausted { outstanding: usize },
}

/// Campaigns currently being dispatched
#[derive(Debug, Default)]
pub struct CampaignRegistry {
    campaigns: DashMap<CampaignId, Arc<CampaignContext>>,
}

impl CampaignRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a running campaign
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::AlreadyRunning`] if the campaign is registered
    pub fn register(&self, context: Arc<CampaignContext>) -> Result<(), SystemError> {
        match self.campaigns.entry(context.id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SystemError::AlreadyRunning(context.id())),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(context);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: CampaignId) -> Option<Arc<CampaignContext>> {
        self.campaigns.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: CampaignId) -> Option<Arc<CampaignContext>> {
        self.campaigns.remove(&id).map(|(_, context)| context)
    }

    pub fn contains(&self, id: CampaignId) -> bool {
        self.campaigns.contains_key(&id)
    }

    pub fn running(&self) -> Vec<CampaignId> {
        let mut ids: Vec<_> = self.campaigns.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.campaigns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.campaigns.is_empty()
    }
}
