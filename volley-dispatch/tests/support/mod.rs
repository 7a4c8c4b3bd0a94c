//! Shared fixtures for the dispatch integration tests
#![allow(dead_code)]

pub mod mock_provider;

use std::sync::Arc;

use volley_common::{Campaign, CampaignId, Channel, CredentialsRef, Message, OwnerId};
use volley_dispatch::{
    CircuitBreakerConfig, Collaborators, DispatchConfig, DispatchEngine, RateLimitConfig,
    RetryPolicy,
    memory::{MemoryCampaignStore, MemoryMessageStore, MemoryQuotaLedger},
    quota::{BucketKind, Quota, QuotaBucket},
};

use self::mock_provider::MockProvider;

pub const OWNER: &str = "acme";
pub const CHANNEL: Channel = Channel::Whatsapp;
pub const PRIMARY_QUOTA: u64 = 1_000;

/// A configuration that keeps scenarios fast under paused time
pub fn test_config() -> DispatchConfig {
    DispatchConfig {
        worker_count: 4,
        page_size: 100,
        page_pause_ms: 0,
        send_timeout_secs: 20,
        batch_budget_secs: 300,
        dry_run: false,
        rate_limit: RateLimitConfig {
            messages_per_second: 1_000.0,
            burst_size: Some(1_000),
        },
        circuit_breaker: CircuitBreakerConfig::default(),
        retry: RetryPolicy {
            max_retries: 2,
            base_delay_secs: 1,
            max_delay_secs: 10,
            jitter_factor: 0.0,
        },
    }
}

/// An engine wired to in-memory collaborators
pub struct Harness {
    pub engine: DispatchEngine,
    pub provider: Arc<MockProvider>,
    pub messages: Arc<MemoryMessageStore>,
    pub campaigns: Arc<MemoryCampaignStore>,
    pub ledger: Arc<MemoryQuotaLedger>,
}

impl Harness {
    pub fn new(config: DispatchConfig, provider: Arc<MockProvider>) -> Self {
        let messages = Arc::new(MemoryMessageStore::new());
        let campaigns = Arc::new(MemoryCampaignStore::new());
        let ledger = Arc::new(MemoryQuotaLedger::new());
        ledger.set_quota(
            OwnerId::from(OWNER),
            CHANNEL,
            Quota::new(vec![QuotaBucket::new(BucketKind::Primary, PRIMARY_QUOTA)]),
        );

        let engine = DispatchEngine::new(
            config,
            Collaborators {
                provider: provider.clone(),
                messages: messages.clone(),
                campaigns: campaigns.clone(),
                quota: ledger.clone(),
            },
        )
        .expect("valid test configuration");

        Self {
            engine,
            provider,
            messages,
            campaigns,
            ledger,
        }
    }

    /// Create a campaign with one pending message per recipient
    pub fn seed_campaign<S: AsRef<str>>(&self, recipients: &[S]) -> CampaignId {
        let campaign = Campaign::new(
            OwnerId::from(OWNER),
            CHANNEL,
            "hello_template",
            CredentialsRef("whatsapp-main".to_string()),
            recipients.len() as u64,
        );
        let id = campaign.id;

        self.campaigns.insert(campaign).expect("insert campaign");
        self.messages
            .insert_all(
                recipients
                    .iter()
                    .map(|recipient| Message::new(id, recipient.as_ref())),
            )
            .expect("insert messages");
        id
    }

    /// Quota units charged so far
    pub fn charged(&self) -> u64 {
        let quota = self
            .ledger
            .quota(&OwnerId::from(OWNER), CHANNEL)
            .expect("seeded account");
        PRIMARY_QUOTA - quota.remaining()
    }
}

/// Recipients `+15550000`, `+15550001`, ...
pub fn recipients(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("+1555{i:04}")).collect()
}
