//! Campaign records
//!
//! A campaign is one bulk-send request. The record is created by an external
//! producer before dispatch starts; the dispatch engine owns it for the
//! duration of a run and reports its progress through [`CampaignProgress`].

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CampaignId, OwnerId};

/// Messaging channel a campaign is sent over
///
/// Quota is tracked per owner and per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Whatsapp,
    Sms,
    Email,
}

impl Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Whatsapp => "whatsapp",
            Self::Sms => "sms",
            Self::Email => "email",
        })
    }
}

/// Reference to provider credentials held by the configuration subsystem
///
/// Only the reference travels through the engine; resolving it to a secret is
/// the provider collaborator's concern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialsRef(pub String);

impl Display for CredentialsRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Aggregate counters for a campaign
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignProgress {
    pub success: u64,
    pub failed: u64,
    /// Messages not advanced to a terminal status (only non-zero when stopped
    /// or when retries outlived the run)
    pub pending: u64,
    /// Retry attempts scheduled, including circuit-breaker deferrals
    pub retried: u64,
}

impl CampaignProgress {
    /// Messages that reached a terminal status
    #[must_use]
    pub const fn processed(&self) -> u64 {
        self.success + self.failed
    }

    /// Fraction of processed messages that were sent, `0.0` when none were
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        match self.processed() {
            0 => 0.0,
            processed => self.success as f64 / processed as f64,
        }
    }

    /// Fraction of processed messages that failed, `0.0` when none were
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        match self.processed() {
            0 => 0.0,
            processed => self.failed as f64 / processed as f64,
        }
    }
}

/// One bulk-send request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub owner: OwnerId,
    pub channel: Channel,
    /// Template the provider collaborator renders per message
    pub template: String,
    pub credentials: CredentialsRef,
    pub total_messages: u64,
    #[serde(default)]
    pub progress: CampaignProgress,
    #[serde(default)]
    pub in_progress: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Create a fresh campaign record that has not been dispatched yet
    #[must_use]
    pub fn new(
        owner: OwnerId,
        channel: Channel,
        template: impl Into<String>,
        credentials: CredentialsRef,
        total_messages: u64,
    ) -> Self {
        Self {
            id: CampaignId::generate(),
            owner,
            channel,
            template: template.into(),
            credentials,
            total_messages,
            progress: CampaignProgress::default(),
            in_progress: false,
            last_error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_rates_with_no_processed_messages() {
        let progress = CampaignProgress::default();
        assert_eq!(progress.processed(), 0);
        assert!(progress.success_rate().abs() < f64::EPSILON);
        assert!(progress.failure_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_rates() {
        let progress = CampaignProgress {
            success: 3,
            failed: 1,
            pending: 2,
            retried: 5,
        };
        assert_eq!(progress.processed(), 4);
        assert!((progress.success_rate() - 0.75).abs() < f64::EPSILON);
        assert!((progress.failure_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_channel_serialises_lowercase() {
        let text = ron::to_string(&Channel::Whatsapp).unwrap_or_default();
        assert_eq!(text, "whatsapp");
        assert_eq!(Channel::Sms.to_string(), "sms");
    }
}
