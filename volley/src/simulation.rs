//! Simulated provider and seeded in-memory stores
//!
//! Lets the binary exercise the full dispatch path (rate limiting, retries,
//! the circuit breaker, quota settlement) without a real messaging provider.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use volley_common::{Campaign, CampaignId, Channel, CredentialsRef, Message, OwnerId};
use volley_dispatch::{
    Collaborators, ContentRef, Provider, ProviderResponse, StoreError, TransportError,
    memory::{MemoryCampaignStore, MemoryMessageStore, MemoryQuotaLedger},
    quota::{BucketKind, Quota, QuotaBucket},
};

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Invalid simulation config: {0}")]
    Config(String),

    #[error("Failed to seed stores: {0}")]
    Store(#[from] StoreError),
}

const fn default_latency_ms() -> u64 {
    50
}

const fn default_transient_rate() -> f64 {
    0.05
}

const fn default_permanent_rate() -> f64 {
    0.02
}

const fn default_recipients() -> usize {
    100
}

const fn default_quota() -> u64 {
    10_000
}

fn default_template() -> String {
    "welcome".to_string()
}

/// How the simulated provider behaves
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderBehaviour {
    /// Time every call takes
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,

    /// Fraction of calls refused with a retryable error
    #[serde(default = "default_transient_rate")]
    pub transient_rate: f64,

    /// Fraction of calls refused for good
    #[serde(default = "default_permanent_rate")]
    pub permanent_rate: f64,
}

impl Default for ProviderBehaviour {
    fn default() -> Self {
        Self {
            latency_ms: default_latency_ms(),
            transient_rate: default_transient_rate(),
            permanent_rate: default_permanent_rate(),
        }
    }
}

/// A campaign to seed
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimulatedCampaign {
    pub owner: String,
    pub channel: Channel,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default)]
    pub credentials: String,
    #[serde(default = "default_recipients")]
    pub recipients: usize,
    /// Primary quota of the owner on this channel
    #[serde(default = "default_quota")]
    pub quota: u64,
    /// Bonus quota, drawn on once the primary bucket is exhausted
    #[serde(default)]
    pub bonus_quota: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub provider: ProviderBehaviour,

    #[serde(default, alias = "campaign")]
    pub campaigns: Vec<SimulatedCampaign>,
}

impl SimulationConfig {
    /// # Errors
    ///
    /// If the failure rates are not probabilities that sum to at most one
    pub fn validate(&self) -> Result<(), SimulationError> {
        let ProviderBehaviour {
            transient_rate,
            permanent_rate,
            ..
        } = self.provider;

        let rates = 0.0..=1.0;
        if !rates.contains(&transient_rate)
            || !rates.contains(&permanent_rate)
            || !rates.contains(&(transient_rate + permanent_rate))
        {
            return Err(SimulationError::Config(
                "provider failure rates must be within [0, 1] and sum to at most 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Provider that answers from a random draw against the configured rates
#[derive(Debug)]
pub struct SimulatedProvider {
    behaviour: ProviderBehaviour,
    next_id: AtomicU64,
}

impl SimulatedProvider {
    pub const fn new(behaviour: ProviderBehaviour) -> Self {
        Self {
            behaviour,
            next_id: AtomicU64::new(1),
        }
    }

    fn respond(&self, roll: f64) -> ProviderResponse {
        if roll < self.behaviour.transient_rate {
            ProviderResponse::rejected("503 service unavailable")
        } else if roll < self.behaviour.transient_rate + self.behaviour.permanent_rate {
            ProviderResponse::rejected("invalid number")
        } else {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            ProviderResponse::accepted(format!("sim-{id:08}"))
        }
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    async fn send_message(
        &self,
        _credentials: &CredentialsRef,
        _recipient: &str,
        _content: &ContentRef,
    ) -> Result<ProviderResponse, TransportError> {
        let roll: f64 = rand::rng().random();
        tokio::time::sleep(Duration::from_millis(self.behaviour.latency_ms)).await;
        Ok(self.respond(roll))
    }
}

/// In-memory collaborators seeded with the configured campaigns
#[derive(Debug, Clone)]
pub struct Simulation {
    pub provider: Arc<SimulatedProvider>,
    pub messages: Arc<MemoryMessageStore>,
    pub campaigns: Arc<MemoryCampaignStore>,
    pub ledger: Arc<MemoryQuotaLedger>,
    pub campaign_ids: Vec<CampaignId>,
}

impl Simulation {
    /// Seed stores and ledger from `config`
    ///
    /// # Errors
    ///
    /// If the config is invalid or the stores reject the seed data
    pub fn seed(config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;

        let messages = Arc::new(MemoryMessageStore::new());
        let campaigns = Arc::new(MemoryCampaignStore::new());
        let ledger = Arc::new(MemoryQuotaLedger::new());
        let mut campaign_ids = Vec::with_capacity(config.campaigns.len());

        for seed in config.campaigns {
            let owner = OwnerId::from(seed.owner);
            let campaign = Campaign::new(
                owner.clone(),
                seed.channel,
                seed.template,
                CredentialsRef(seed.credentials),
                seed.recipients as u64,
            );
            let id = campaign.id;

            let mut buckets = vec![QuotaBucket::new(BucketKind::Primary, seed.quota)];
            if seed.bonus_quota > 0 {
                buckets.push(QuotaBucket::new(BucketKind::Bonus, seed.bonus_quota));
            }
            ledger.set_quota(owner, seed.channel, Quota::new(buckets));

            messages.insert_all(
                (0..seed.recipients)
                    .map(|i| Message::new(id, format!("+1555{i:07}")).with_variable("index", i.to_string())),
            )?;
            campaigns.insert(campaign)?;
            campaign_ids.push(id);
        }

        Ok(Self {
            provider: Arc::new(SimulatedProvider::new(config.provider)),
            messages,
            campaigns,
            ledger,
            campaign_ids,
        })
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            provider: self.provider.clone(),
            messages: self.messages.clone(),
            campaigns: self.campaigns.clone(),
            quota: self.ledger.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use volley_common::MessageStatus;

    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: SimulationConfig = ron::from_str("()").expect("valid config");
        assert_eq!(config.provider, ProviderBehaviour::default());
        assert!(config.campaigns.is_empty());

        let config: SimulationConfig =
            ron::from_str("(campaigns: [(owner: \"acme\", channel: sms)])").expect("valid config");
        assert_eq!(config.campaigns[0].recipients, 100);
        assert_eq!(config.campaigns[0].quota, 10_000);
        assert_eq!(config.campaigns[0].template, "welcome");
    }

    #[test]
    fn test_rates_are_validated() {
        let mut config = SimulationConfig::default();
        config.provider.transient_rate = 0.7;
        config.provider.permanent_rate = 0.6;
        assert!(matches!(config.validate(), Err(SimulationError::Config(_))));

        config.provider.permanent_rate = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_response_bands() {
        let provider = SimulatedProvider::new(ProviderBehaviour {
            latency_ms: 0,
            transient_rate: 0.1,
            permanent_rate: 0.2,
        });

        let transient = provider.respond(0.05);
        assert_eq!(transient.error_text.as_deref(), Some("503 service unavailable"));

        let permanent = provider.respond(0.25);
        assert_eq!(permanent.error_text.as_deref(), Some("invalid number"));

        let sent = provider.respond(0.5);
        assert!(sent.success);
        assert_eq!(sent.provider_message_id.as_deref(), Some("sim-00000001"));
    }

    #[test]
    fn test_seed() {
        let config = SimulationConfig {
            provider: ProviderBehaviour::default(),
            campaigns: vec![SimulatedCampaign {
                owner: "acme".to_string(),
                channel: Channel::Sms,
                template: "promo".to_string(),
                credentials: "sms-main".to_string(),
                recipients: 7,
                quota: 5,
                bonus_quota: 3,
            }],
        };

        let simulation = Simulation::seed(config).unwrap();
        assert_eq!(simulation.campaign_ids.len(), 1);

        let id = simulation.campaign_ids[0];
        let campaign = simulation.campaigns.get(id).unwrap();
        assert_eq!(campaign.total_messages, 7);
        assert_eq!(campaign.template, "promo");
        assert_eq!(
            simulation.messages.count_with_status(id, MessageStatus::Pending),
            7
        );

        let quota = simulation
            .ledger
            .quota(&OwnerId::from("acme"), Channel::Sms)
            .unwrap();
        assert_eq!(quota.remaining(), 8);
    }
}
