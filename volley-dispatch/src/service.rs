//! Service trait abstraction for controlling the dispatch engine
//!
//! Control surfaces (the CLI, a signal handler, an admin API) depend on this
//! trait rather than on [`DispatchEngine`] directly, so they can be tested
//! against a stub.

use async_trait::async_trait;
use volley_common::{CampaignId, CampaignProgress, tracing};

use crate::{engine::DispatchEngine, error::DispatchError, types::EngineStats};

/// Control operations on a running dispatch engine
///
/// # Example
///
/// ```rust,ignore
/// async fn halt(service: &dyn DispatchControlService, id: CampaignId) -> bool {
///     service.stop_campaign(id).await
/// }
/// ```
#[async_trait]
pub trait DispatchControlService: Send + Sync {
    /// Start dispatching a campaign in the background
    ///
    /// # Errors
    ///
    /// Returns an error if the campaign is already running
    fn start_campaign(&self, id: CampaignId) -> Result<(), DispatchError>;

    /// Stop a running campaign, returning `false` if it was not running
    async fn stop_campaign(&self, id: CampaignId) -> bool;

    /// Engine-wide counters
    fn stats(&self) -> EngineStats;

    /// Live counters of a running campaign
    fn campaign_progress(&self, id: CampaignId) -> Option<CampaignProgress>;

    /// Ids of the campaigns currently running
    fn running_campaigns(&self) -> Vec<CampaignId>;
}

#[async_trait]
impl DispatchControlService for DispatchEngine {
    fn start_campaign(&self, id: CampaignId) -> Result<(), DispatchError> {
        let handle = self.spawn_campaign(id)?;

        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(summary)) => tracing::info!(
                    campaign_id = %summary.campaign_id,
                    success = summary.progress.success,
                    failed = summary.progress.failed,
                    pending = summary.progress.pending,
                    "Campaign run finished"
                ),
                Ok(Err(e)) => tracing::error!(campaign_id = %id, error = %e, "Campaign run failed"),
                Err(e) => tracing::error!(campaign_id = %id, error = %e, "Campaign task panicked or was cancelled"),
            }
        });

        Ok(())
    }

    async fn stop_campaign(&self, id: CampaignId) -> bool {
        Self::stop_campaign(self, id).await
    }

    fn stats(&self) -> EngineStats {
        Self::stats(self)
    }

    fn campaign_progress(&self, id: CampaignId) -> Option<CampaignProgress> {
        Self::campaign_progress(self, id)
    }

    fn running_campaigns(&self) -> Vec<CampaignId> {
        Self::running_campaigns(self)
    }
}
