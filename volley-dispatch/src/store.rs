//! Persistence seams for messages and campaigns

use std::{fmt::Debug, sync::PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use volley_common::{Campaign, CampaignId, Message, MessageId, MessageStatus};

use crate::status::CampaignSummary;

/// Storage collaborator failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl<T> From<PoisonError<T>> for StoreError {
    fn from(err: PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {err}"))
    }
}

/// One page of pending messages, keyed by message id
///
/// Pages are ordered by [`MessageId`]. `after` is the last id of the previous
/// page so messages that stay pending after a deferral are not loaded twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub campaign_id: CampaignId,
    pub after: Option<MessageId>,
    pub limit: usize,
}

/// A status write for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub message_id: MessageId,
    pub status: MessageStatus,
    pub provider_message_id: Option<String>,
    /// Failure reason, or the note explaining why the message is still pending
    pub error: Option<String>,
    /// Attempt that produced this status, 0 for the first dispatch
    pub attempt: u32,
}

impl StatusUpdate {
    #[must_use]
    pub const fn sent(message_id: MessageId, provider_message_id: Option<String>, attempt: u32) -> Self {
        Self {
            message_id,
            status: MessageStatus::Sent,
            provider_message_id,
            error: None,
            attempt,
        }
    }

    #[must_use]
    pub fn pending(message_id: MessageId, note: impl Into<String>, attempt: u32) -> Self {
        Self {
            message_id,
            status: MessageStatus::Pending,
            provider_message_id: None,
            error: Some(note.into()),
            attempt,
        }
    }

    #[must_use]
    pub fn failed(message_id: MessageId, error: impl Into<String>, attempt: u32) -> Self {
        Self {
            message_id,
            status: MessageStatus::Failed,
            provider_message_id: None,
            error: Some(error.into()),
            attempt,
        }
    }
}

/// Message persistence
#[async_trait]
pub trait MessageStore: Send + Sync + Debug {
    /// Load up to `page.limit` pending messages after the cursor, in id order
    ///
    /// # Errors
    /// If the store cannot be read
    async fn load_pending_page(&self, page: &PageRequest) -> Result<Vec<Message>, StoreError>;

    /// Apply a status write
    ///
    /// Writes must be idempotent: repeating a status the message already has
    /// succeeds without changing anything.
    ///
    /// # Errors
    /// If the message is unknown or the store cannot be written
    async fn update_message_status(&self, update: &StatusUpdate) -> Result<(), StoreError>;

    /// Read a single message
    ///
    /// # Errors
    /// If the message is unknown or the store cannot be read
    async fn load_message(&self, id: MessageId) -> Result<Message, StoreError>;
}

/// Campaign persistence
#[async_trait]
pub trait CampaignStore: Send + Sync + Debug {
    /// # Errors
    /// [`StoreError::NotFound`] if the campaign does not exist
    async fn load_campaign(&self, id: CampaignId) -> Result<Campaign, StoreError>;

    /// Record intermediate counters while the campaign is running
    ///
    /// # Errors
    /// If the store cannot be written
    async fn persist_campaign_progress(&self, summary: &CampaignSummary) -> Result<(), StoreError>;

    /// Record the final counters and completion of the campaign
    ///
    /// # Errors
    /// If the store cannot be written
    async fn persist_campaign_final(&self, summary: &CampaignSummary) -> Result<(), StoreError>;
}
