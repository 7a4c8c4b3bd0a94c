//! Campaign orchestration
//!
//! [`DispatchEngine`] owns the shared rate limiter and circuit breaker for one
//! provider integration and runs any number of campaigns through them. A
//! campaign run loads pending messages page by page, dispatches each page,
//! settles quota for the page's successes, and persists progress, until the
//! backlog is empty, the campaign is stopped, or a system error aborts it.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use volley_common::{
    Campaign, CampaignId, CampaignProgress, MessageId, MessageStatus, Signal, internal, tracing,
};

use crate::{
    circuit_breaker::CircuitBreaker,
    config::DispatchConfig,
    error::{DispatchError, SystemError},
    loader::BatchLoader,
    processor::Dispatcher,
    provider::Provider,
    quota::{self, QuotaLedger},
    rate_limiter::RateLimiter,
    registry::{CampaignContext, CampaignRegistry, IdleOutcome},
    status::{CampaignStatusUpdater, CampaignSummary, RunOutcome},
    store::{CampaignStore, MessageStore, StatusUpdate, StoreError},
    types::{EngineStats, ProcessingTask},
};

/// External collaborators an engine works against
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn Provider>,
    pub messages: Arc<dyn MessageStore>,
    pub campaigns: Arc<dyn CampaignStore>,
    pub quota: Arc<dyn QuotaLedger>,
}

#[derive(Debug)]
struct EngineInner {
    config: DispatchConfig,
    dispatcher: Arc<Dispatcher>,
    messages: Arc<dyn MessageStore>,
    campaigns: Arc<dyn CampaignStore>,
    quota: Arc<dyn QuotaLedger>,
    registry: CampaignRegistry,
    status: CampaignStatusUpdater,
    monitor_started: AtomicBool,
    shutdown: CancellationToken,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Bulk dispatch engine for one provider integration
///
/// Cheap to clone; clones share the same limiter, breaker and registry.
#[derive(Debug, Clone)]
pub struct DispatchEngine {
    inner: Arc<EngineInner>,
}

impl DispatchEngine {
    /// Create an engine with its own rate limiter and circuit breaker
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid
    pub fn new(config: DispatchConfig, collaborators: Collaborators) -> Result<Self, DispatchError> {
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let circuit_breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        Self::with_components(config, collaborators, rate_limiter, circuit_breaker)
    }

    /// Create an engine around an existing rate limiter and circuit breaker
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid
    pub fn with_components(
        config: DispatchConfig,
        collaborators: Collaborators,
        rate_limiter: Arc<RateLimiter>,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, DispatchError> {
        config.validate()?;

        internal!(
            level = INFO,
            "Dispatch engine configured: workers={}, page_size={}, rate={}/s, send_timeout={}s, dry_run={}",
            config.worker_count,
            config.page_size,
            config.rate_limit.messages_per_second,
            config.send_timeout_secs,
            config.dry_run
        );

        let Collaborators {
            provider,
            messages,
            campaigns,
            quota,
        } = collaborators;

        let dispatcher = Arc::new(Dispatcher::new(
            provider,
            Arc::clone(&messages),
            rate_limiter,
            circuit_breaker,
            config.retry.clone(),
            config.send_timeout(),
        ));

        Ok(Self {
            inner: Arc::new(EngineInner {
                status: CampaignStatusUpdater::new(Arc::clone(&campaigns)),
                config,
                dispatcher,
                messages,
                campaigns,
                quota,
                registry: CampaignRegistry::new(),
                monitor_started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        self.inner.dispatcher.rate_limiter()
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        self.inner.dispatcher.circuit_breaker()
    }

    /// Start the circuit breaker monitor if it is not running yet
    ///
    /// The monitor lives until the engine is dropped.
    pub fn ensure_monitor(&self) {
        if self.inner.monitor_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let breaker = Arc::clone(self.circuit_breaker());
        tokio::spawn(breaker.monitor(self.inner.shutdown.child_token()));
        internal!("Circuit breaker monitor started");
    }

    /// Run a campaign on a background task
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::AlreadyRunning`] if the campaign is running
    pub fn spawn_campaign(
        &self,
        id: CampaignId,
    ) -> Result<JoinHandle<Result<CampaignSummary, DispatchError>>, DispatchError> {
        if self.inner.registry.contains(id) {
            return Err(SystemError::AlreadyRunning(id).into());
        }

        let engine = self.clone();
        Ok(tokio::spawn(async move { engine.run_campaign(id).await }))
    }

    /// Dispatch every pending message of a campaign and return its final summary
    ///
    /// # Errors
    ///
    /// Returns a system error if the campaign cannot be loaded, is already
    /// running, or a store fails while loading pages. In the last case the
    /// campaign is finalised with the error recorded before it is returned.
    #[tracing::instrument(skip_all, fields(campaign_id = %id))]
    pub async fn run_campaign(&self, id: CampaignId) -> Result<CampaignSummary, DispatchError> {
        let campaign = match self.inner.campaigns.load_campaign(id).await {
            Ok(campaign) => campaign,
            Err(StoreError::NotFound(_)) => return Err(SystemError::CampaignNotFound(id).into()),
            Err(e) => return Err(e.into()),
        };

        let context = Arc::new(CampaignContext::new(campaign, self.inner.config.worker_count));
        self.inner.registry.register(Arc::clone(&context))?;
        self.ensure_monitor();

        internal!(
            level = INFO,
            "Campaign {} started: {} messages on {} for {}",
            id,
            context.campaign().total_messages,
            context.campaign().channel,
            context.campaign().owner
        );
        self.inner.status.persist_progress(&context).await;

        let retry_shutdown = context.cancel_token().child_token();
        let retry_worker = self
            .inner
            .dispatcher
            .spawn_retry_worker(Arc::clone(&context), retry_shutdown.clone());

        let result = self.drive(&context).await;

        retry_shutdown.cancel();
        if let Err(e) = retry_worker.await {
            tracing::warn!(error = %e, "Retry worker ended abnormally");
        }

        // Issued calls are not aborted; their outcomes belong to this run
        if tokio::time::timeout(self.inner.config.batch_budget(), context.wait_calls_settled())
            .await
            .is_err()
        {
            tracing::warn!(
                in_flight = context.in_flight(),
                "Provider calls still outstanding at the end of the run"
            );
        }

        let leftover_retries = context.retry_queue().drain().len();
        let aborted = context.abort_all();
        if leftover_retries + aborted > 0 {
            tracing::warn!(
                leftover_retries,
                aborted,
                "Campaign ended with unsettled messages, they stay pending"
            );
        }

        // Successes recorded by tasks that finished after the last batch
        self.settle_quota(&context).await;

        let outcome = match &result {
            Ok(outcome) => outcome.clone(),
            Err(e) => RunOutcome::Aborted(e.to_string()),
        };
        let summary = self.inner.status.finalize(&context, outcome).await;
        self.inner.registry.remove(id);

        result.map(|_| summary)
    }

    /// The batch loop
    async fn drive(&self, context: &Arc<CampaignContext>) -> Result<RunOutcome, DispatchError> {
        let config = &self.inner.config;
        let template: Arc<str> = Arc::from(context.campaign().template.as_str());
        let mut loader = BatchLoader::new(
            Arc::clone(&self.inner.messages),
            context.id(),
            config.page_size,
            config.page_pause(),
        );

        while let Some(page) = loader.next_page(context.cancel_token()).await? {
            let tasks: Vec<_> = page
                .into_iter()
                .map(|message| ProcessingTask::from_message(message, &template, context.campaign()))
                .collect();

            let outcome = self
                .inner
                .dispatcher
                .dispatch_batch(context, tasks, config.batch_budget())
                .await;

            if let IdleOutcome::BudgetExhausted { outstanding } = outcome {
                tracing::warn!(
                    outstanding,
                    budget_secs = config.batch_budget_secs,
                    "Batch budget exhausted, moving on"
                );
            }

            self.settle_quota(context).await;
            if outcome == IdleOutcome::Cancelled || context.is_cancelled() {
                return Ok(RunOutcome::Stopped);
            }
            self.inner.status.persist_progress(context).await;
        }

        if context.is_cancelled() {
            return Ok(RunOutcome::Stopped);
        }

        // Retries that outlived their batch's budget get one more budget
        if context.outstanding() > 0
            && context.wait_idle_within(config.batch_budget()).await == IdleOutcome::Cancelled
        {
            return Ok(RunOutcome::Stopped);
        }

        Ok(RunOutcome::Completed)
    }

    /// Charge the ledger for successes not yet charged
    async fn settle_quota(&self, context: &CampaignContext) {
        let due = context.uncharged_successes();
        let campaign = context.campaign();

        match quota::settle_batch(
            self.inner.quota.as_ref(),
            &campaign.owner,
            campaign.channel,
            due,
            self.inner.config.dry_run,
        )
        .await
        {
            Ok(Some(delta)) => {
                context.mark_charged(due);
                tracing::debug!(
                    charged = delta.applied_total(),
                    shortfall = delta.shortfall(),
                    "Quota settled"
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, due, "Quota settlement failed, will retry after next batch");
                context.set_last_error(format!("quota settlement failed: {e}"));
            }
        }
    }

    /// Stop a running campaign
    ///
    /// Cancels waiting and queued work, records the campaign as finished with
    /// a "stopped by user" note, and returns `true`. Returns `false` if the
    /// campaign is not running. Provider calls already issued still complete;
    /// the run records their outcomes before it exits.
    pub async fn stop_campaign(&self, id: CampaignId) -> bool {
        let Some(context) = self.inner.registry.get(id) else {
            return false;
        };

        if context.stop() {
            self.inner.status.finalize(&context, RunOutcome::Stopped).await;
        }
        true
    }

    /// Stop every running campaign
    pub async fn stop_all(&self) -> usize {
        let running = self.inner.registry.running();
        let mut stopped = 0;
        for id in running {
            if self.stop_campaign(id).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Engine-wide counters and the state of the shared components
    pub fn stats(&self) -> EngineStats {
        let totals = self.inner.dispatcher.totals();
        EngineStats {
            processed: totals.processed,
            success: totals.success,
            failed: totals.failed,
            retried: totals.retried,
            active_workers: totals.active_workers,
            circuit_open: self.circuit_breaker().is_open(),
            available_tokens: self.rate_limiter().available_tokens(),
        }
    }

    /// Live counters of a running campaign
    pub fn campaign_progress(&self, id: CampaignId) -> Option<CampaignProgress> {
        self.inner.registry.get(id).map(|context| context.progress())
    }

    pub fn running_campaigns(&self) -> Vec<CampaignId> {
        self.inner.registry.running()
    }

    /// Reconcile a message the provider accepted but later reported as failed
    ///
    /// Marks the message failed, moves it from the campaign's success count to
    /// its failed count, and gives back the unit of quota it was charged.
    /// Messages that are not currently `sent` are left alone, so repeated
    /// reports are harmless.
    ///
    /// # Errors
    ///
    /// Returns a system error if the message, its campaign or the quota
    /// account cannot be found or updated
    #[tracing::instrument(skip_all, fields(message_id = %message_id))]
    pub async fn report_late_failure(
        &self,
        message_id: MessageId,
        error: &str,
    ) -> Result<bool, DispatchError> {
        let message = self.inner.messages.load_message(message_id).await?;
        if message.status != MessageStatus::Sent {
            tracing::debug!(status = %message.status, "Late failure ignored");
            return Ok(false);
        }

        let campaign = match self.inner.campaigns.load_campaign(message.campaign_id).await {
            Ok(campaign) => campaign,
            Err(StoreError::NotFound(_)) => {
                return Err(SystemError::CampaignNotFound(message.campaign_id).into());
            }
            Err(e) => return Err(e.into()),
        };

        self.inner
            .messages
            .update_message_status(&StatusUpdate::failed(message_id, error, 0))
            .await?;

        let refund_due = match self.inner.registry.get(campaign.id) {
            // Persisted with the run's next progress update
            Some(context) => context.record_late_failure(),
            None => {
                self.move_success_to_failed(&campaign).await;
                true
            }
        };

        if refund_due && !self.inner.config.dry_run {
            quota::refund_late_failures(
                self.inner.quota.as_ref(),
                &campaign.owner,
                campaign.channel,
                1,
            )
            .await?;
        }

        tracing::info!(campaign_id = %campaign.id, error, refund_due, "Late failure reconciled");
        Ok(true)
    }

    /// Apply a late failure to the stored record of a campaign that is not running
    async fn move_success_to_failed(&self, campaign: &Campaign) {
        let mut summary = CampaignSummary::from_record(campaign);
        summary.progress.success = summary.progress.success.saturating_sub(1);
        summary.progress.failed += 1;

        if let Err(e) = self.inner.campaigns.persist_campaign_final(&summary).await {
            tracing::warn!(
                campaign_id = %campaign.id,
                error = %e,
                "Failed to record late failure on the campaign"
            );
        }
    }

    /// Keep the engine's background tasks alive until a shutdown signal
    ///
    /// On shutdown every running campaign is stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown channel fails
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), DispatchError> {
        internal!(level = INFO, "Dispatch engine serving");
        self.ensure_monitor();

        let signal = shutdown.recv().await;
        let stopped = self.stop_all().await;

        match signal {
            Ok(Signal::Shutdown | Signal::Finalised) => {
                internal!(
                    level = INFO,
                    "Dispatch engine shut down, {} campaign(s) stopped",
                    stopped
                );
                Ok(())
            }
            Err(e) => Err(SystemError::Internal(format!("Shutdown channel error: {e}")).into()),
        }
    }
}
