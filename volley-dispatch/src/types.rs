//! Type definitions shared by the loader, dispatcher and retry queue

use std::{collections::BTreeMap, sync::Arc};

use serde::Serialize;
use volley_common::{Campaign, CampaignId, CredentialsRef, Message, MessageId};

/// Content the provider renders for one message
///
/// The template is shared by every message of a campaign; only the variables
/// are per-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRef {
    pub template: Arc<str>,
    pub variables: BTreeMap<String, String>,
}

/// A message that is ready to be handed to the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingTask {
    pub message_id: MessageId,
    pub campaign_id: CampaignId,
    pub recipient: String,
    pub content: ContentRef,
    pub credentials: CredentialsRef,
}

impl ProcessingTask {
    /// Build a task for `message` using the campaign's template and credentials
    #[must_use]
    pub fn from_message(message: Message, template: &Arc<str>, campaign: &Campaign) -> Self {
        Self {
            message_id: message.id,
            campaign_id: campaign.id,
            recipient: message.recipient,
            content: ContentRef {
                template: Arc::clone(template),
                variables: message.variables,
            },
            credentials: campaign.credentials.clone(),
        }
    }
}

/// Engine-wide counters, aggregated over every campaign it has run
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EngineStats {
    /// Provider calls made
    pub processed: u64,
    /// Messages the provider accepted
    pub success: u64,
    /// Messages that ended in a terminal failure
    pub failed: u64,
    /// Retries scheduled, including circuit-breaker deferrals
    pub retried: u64,
    /// Provider calls currently in flight
    pub active_workers: usize,
    pub circuit_open: bool,
    pub available_tokens: f64,
}
