//! Outbound message records

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};

use crate::{CampaignId, MessageId};

/// Delivery status of a single message
///
/// `Pending` is both the initial state and the "will retry" state; `Sent` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Pending,
    Sent,
    Failed,
}

impl MessageStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }

    /// Whether a message currently in `self` may move to `next`
    ///
    /// Re-applying the current status is always accepted so status writes are
    /// idempotent. A sent message may still be failed by a late delivery
    /// report; nothing else leaves a terminal status.
    #[must_use]
    pub const fn accepts(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, _) | (Self::Sent, Self::Sent | Self::Failed) | (Self::Failed, Self::Failed)
        )
    }
}

impl Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        })
    }
}

/// One outbound unit addressed to a single recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub campaign_id: CampaignId,
    /// Recipient address in whatever form the channel uses (phone number, email)
    pub recipient: String,
    /// Per-message template variables
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub provider_message_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Message {
    /// Create a pending message for `recipient`
    #[must_use]
    pub fn new(campaign_id: CampaignId, recipient: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            campaign_id,
            recipient: recipient.into(),
            variables: BTreeMap::new(),
            status: MessageStatus::Pending,
            provider_message_id: None,
            last_error: None,
        }
    }

    /// Attach a template variable
    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!MessageStatus::Pending.is_terminal());
        assert!(MessageStatus::Sent.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_transitions() {
        assert!(MessageStatus::Pending.accepts(MessageStatus::Pending));
        assert!(MessageStatus::Pending.accepts(MessageStatus::Sent));
        assert!(MessageStatus::Sent.accepts(MessageStatus::Sent));
        assert!(MessageStatus::Sent.accepts(MessageStatus::Failed));
        assert!(!MessageStatus::Sent.accepts(MessageStatus::Pending));
        assert!(!MessageStatus::Failed.accepts(MessageStatus::Sent));
        assert!(!MessageStatus::Failed.accepts(MessageStatus::Pending));
    }

    #[test]
    fn test_new_message_is_pending() {
        let message = Message::new(CampaignId::generate(), "+15550100").with_variable("name", "Ada");
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.variables.get("name").map(String::as_str), Some("Ada"));
        assert!(message.provider_message_id.is_none());
    }
}
