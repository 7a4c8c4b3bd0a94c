//! Campaign progress reporting
//!
//! [`CampaignStatusUpdater`] turns a [`CampaignContext`] into a
//! [`CampaignSummary`] and persists it: after every batch while the campaign
//! runs, and once more when it ends.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use volley_common::{Campaign, CampaignId, CampaignProgress, Channel, OwnerId, tracing};

use crate::{registry::CampaignContext, store::CampaignStore};

/// Note recorded on campaigns that were stopped by request
pub const STOPPED_BY_USER: &str = "stopped by user";

/// Snapshot of a campaign's counters and completion state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignSummary {
    pub campaign_id: CampaignId,
    pub owner: OwnerId,
    pub channel: Channel,
    pub total_messages: u64,
    pub progress: CampaignProgress,
    pub in_progress: bool,
    /// Whether the campaign was stopped by request
    pub stopped: bool,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CampaignSummary {
    /// Summary of the state stored on a campaign record
    #[must_use]
    pub fn from_record(campaign: &Campaign) -> Self {
        Self {
            campaign_id: campaign.id,
            owner: campaign.owner.clone(),
            channel: campaign.channel,
            total_messages: campaign.total_messages,
            progress: campaign.progress,
            in_progress: campaign.in_progress,
            stopped: campaign.last_error.as_deref() == Some(STOPPED_BY_USER),
            last_error: campaign.last_error.clone(),
            finished_at: campaign.finished_at,
        }
    }

    #[must_use]
    pub fn success_rate(&self) -> f64 {
        self.progress.success_rate()
    }

    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        self.progress.failure_rate()
    }
}

/// Why a campaign run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every page was loaded and dispatched
    Completed,
    /// Stopped by request
    Stopped,
    /// Aborted by a system error, carrying its description
    Aborted(String),
}

#[derive(Debug, Clone)]
pub struct CampaignStatusUpdater {
    store: Arc<dyn CampaignStore>,
}

impl CampaignStatusUpdater {
    #[must_use]
    pub fn new(store: Arc<dyn CampaignStore>) -> Self {
        Self { store }
    }

    /// Summary of a campaign that is still running
    #[must_use]
    pub fn snapshot(context: &CampaignContext) -> CampaignSummary {
        let campaign = context.campaign();
        CampaignSummary {
            campaign_id: campaign.id,
            owner: campaign.owner.clone(),
            channel: campaign.channel,
            total_messages: campaign.total_messages,
            progress: context.progress(),
            in_progress: true,
            stopped: false,
            last_error: context.last_error(),
            finished_at: None,
        }
    }

    /// Persist intermediate counters; failures are logged, not propagated
    pub async fn persist_progress(&self, context: &CampaignContext) {
        let summary = Self::snapshot(context);

        tracing::debug!(
            campaign_id = %summary.campaign_id,
            success = summary.progress.success,
            failed = summary.progress.failed,
            pending = summary.progress.pending,
            retried = summary.progress.retried,
            "Persisting campaign progress"
        );

        if let Err(e) = self.store.persist_campaign_progress(&summary).await {
            tracing::warn!(
                campaign_id = %summary.campaign_id,
                error = %e,
                "Failed to persist campaign progress"
            );
        }
    }

    /// Record and persist the final summary
    ///
    /// The first call for a context decides how the run ended. Later calls
    /// only persist counters that moved since, such as outcomes of provider
    /// calls that were out when the campaign was stopped.
    pub async fn finalize(&self, context: &CampaignContext, outcome: RunOutcome) -> CampaignSummary {
        let (summary, created) = context.finalize_with(|| {
            let mut summary = Self::snapshot(context);
            summary.in_progress = false;
            summary.finished_at = Some(Utc::now());
            match &outcome {
                RunOutcome::Completed => {}
                RunOutcome::Stopped => {
                    summary.stopped = true;
                    summary.last_error = Some(STOPPED_BY_USER.to_string());
                }
                RunOutcome::Aborted(error) => summary.last_error = Some(error.clone()),
            }
            summary
        });

        if !created {
            let Some(refreshed) = context.refresh_final() else {
                return summary;
            };
            tracing::info!(
                campaign_id = %refreshed.campaign_id,
                success = refreshed.progress.success,
                failed = refreshed.progress.failed,
                pending = refreshed.progress.pending,
                "Campaign counters settled after it finished"
            );
            self.persist_final(&refreshed).await;
            return refreshed;
        }

        tracing::info!(
            campaign_id = %summary.campaign_id,
            outcome = ?outcome,
            success = summary.progress.success,
            failed = summary.progress.failed,
            pending = summary.progress.pending,
            retried = summary.progress.retried,
            success_rate = summary.success_rate(),
            "Campaign finished"
        );

        self.persist_final(&summary).await;
        summary
    }

    async fn persist_final(&self, summary: &CampaignSummary) {
        if let Err(e) = self.store.persist_campaign_final(summary).await {
            tracing::error!(
                campaign_id = %summary.campaign_id,
                error = %e,
                "Failed to persist final campaign state"
            );
        }
    }
}
