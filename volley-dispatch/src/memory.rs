//! In-memory collaborators
//!
//! These implementations keep everything in process memory. They back the
//! simulation mode of the binary and the test suites, and double as reference
//! implementations of the store and ledger contracts.

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use dashmap::DashMap;
use volley_common::{Campaign, CampaignId, Channel, Message, MessageId, MessageStatus, OwnerId};

use crate::{
    quota::{Quota, QuotaDelta, QuotaError, QuotaLedger},
    status::CampaignSummary,
    store::{CampaignStore, MessageStore, PageRequest, StatusUpdate, StoreError},
};

/// In-memory message store
///
/// Messages are kept in a `BTreeMap` keyed by [`MessageId`], which gives the
/// id ordering that keyset pagination relies on. Every applied status write
/// is also kept in a log for inspection.
#[derive(Debug, Clone, Default)]
pub struct MemoryMessageStore {
    messages: Arc<RwLock<BTreeMap<MessageId, Message>>>,
    updates: Arc<RwLock<Vec<StatusUpdate>>>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace messages
    ///
    /// # Errors
    /// If the lock is poisoned
    pub fn insert_all(&self, messages: impl IntoIterator<Item = Message>) -> Result<(), StoreError> {
        let mut stored = self.messages.write()?;
        for message in messages {
            stored.insert(message.id, message);
        }
        Ok(())
    }

    /// Read a message without going through the async trait
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<Message> {
        self.messages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Messages of a campaign, in id order
    #[must_use]
    pub fn messages_for(&self, campaign_id: CampaignId) -> Vec<Message> {
        self.messages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .filter(|message| message.campaign_id == campaign_id)
            .cloned()
            .collect()
    }

    /// Number of messages of a campaign in `status`
    #[must_use]
    pub fn count_with_status(&self, campaign_id: CampaignId, status: MessageStatus) -> usize {
        self.messages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .filter(|message| message.campaign_id == campaign_id && message.status == status)
            .count()
    }

    /// Every status write applied so far, oldest first
    #[must_use]
    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn load_pending_page(&self, page: &PageRequest) -> Result<Vec<Message>, StoreError> {
        let lower = page.after.map_or(Bound::Unbounded, Bound::Excluded);

        Ok(self
            .messages
            .read()?
            .range((lower, Bound::Unbounded))
            .map(|(_, message)| message)
            .filter(|message| {
                message.campaign_id == page.campaign_id && message.status == MessageStatus::Pending
            })
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn update_message_status(&self, update: &StatusUpdate) -> Result<(), StoreError> {
        let mut messages = self.messages.write()?;
        let message = messages
            .get_mut(&update.message_id)
            .ok_or_else(|| StoreError::NotFound(update.message_id.to_string()))?;

        if !message.status.accepts(update.status) {
            return Ok(());
        }

        message.status = update.status;
        if update.provider_message_id.is_some() {
            message.provider_message_id.clone_from(&update.provider_message_id);
        }
        message.last_error.clone_from(&update.error);
        drop(messages);

        self.updates.write()?.push(update.clone());
        Ok(())
    }

    async fn load_message(&self, id: MessageId) -> Result<Message, StoreError> {
        self.messages
            .read()?
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// In-memory campaign store
///
/// Applies every persisted summary to the stored campaign record and keeps
/// the summaries themselves for inspection.
#[derive(Debug, Clone, Default)]
pub struct MemoryCampaignStore {
    campaigns: Arc<RwLock<HashMap<CampaignId, Campaign>>>,
    progress: Arc<RwLock<Vec<CampaignSummary>>>,
    finals: Arc<RwLock<HashMap<CampaignId, CampaignSummary>>>,
}

impl MemoryCampaignStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a campaign record
    ///
    /// # Errors
    /// If the lock is poisoned
    pub fn insert(&self, campaign: Campaign) -> Result<(), StoreError> {
        self.campaigns.write()?.insert(campaign.id, campaign);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: CampaignId) -> Option<Campaign> {
        self.campaigns
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Progress summaries persisted for a campaign, oldest first
    #[must_use]
    pub fn progress_history(&self, id: CampaignId) -> Vec<CampaignSummary> {
        self.progress
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|summary| summary.campaign_id == id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn final_summary(&self, id: CampaignId) -> Option<CampaignSummary> {
        self.finals
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn apply(&self, summary: &CampaignSummary) -> Result<(), StoreError> {
        let mut campaigns = self.campaigns.write()?;
        let campaign = campaigns
            .get_mut(&summary.campaign_id)
            .ok_or_else(|| StoreError::NotFound(summary.campaign_id.to_string()))?;

        campaign.progress = summary.progress;
        campaign.in_progress = summary.in_progress;
        campaign.last_error.clone_from(&summary.last_error);
        campaign.finished_at = summary.finished_at;
        Ok(())
    }
}

#[async_trait]
impl CampaignStore for MemoryCampaignStore {
    async fn load_campaign(&self, id: CampaignId) -> Result<Campaign, StoreError> {
        self.campaigns
            .read()?
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn persist_campaign_progress(&self, summary: &CampaignSummary) -> Result<(), StoreError> {
        self.apply(summary)?;
        self.progress.write()?.push(summary.clone());
        Ok(())
    }

    async fn persist_campaign_final(&self, summary: &CampaignSummary) -> Result<(), StoreError> {
        self.apply(summary)?;
        self.finals.write()?.insert(summary.campaign_id, summary.clone());
        Ok(())
    }
}

/// In-memory quota ledger
///
/// Each account is updated under its map entry lock, so concurrent charges
/// and refunds on the same account are serialised.
#[derive(Debug, Clone, Default)]
pub struct MemoryQuotaLedger {
    accounts: Arc<DashMap<(OwnerId, Channel), Quota>>,
}

impl MemoryQuotaLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace an account
    pub fn set_quota(&self, owner: OwnerId, channel: Channel, quota: Quota) {
        self.accounts.insert((owner, channel), quota);
    }

    #[must_use]
    pub fn quota(&self, owner: &OwnerId, channel: Channel) -> Option<Quota> {
        self.accounts
            .get(&(owner.clone(), channel))
            .map(|entry| entry.value().clone())
    }

    fn with_account(
        &self,
        owner: &OwnerId,
        channel: Channel,
        apply: impl FnOnce(&mut Quota) -> QuotaDelta,
    ) -> Result<QuotaDelta, QuotaError> {
        let mut account = self.accounts.get_mut(&(owner.clone(), channel)).ok_or_else(|| {
            QuotaError::UnknownAccount {
                owner: owner.clone(),
                channel,
            }
        })?;
        Ok(apply(account.value_mut()))
    }
}

#[async_trait]
impl QuotaLedger for MemoryQuotaLedger {
    async fn decrement_quota(
        &self,
        owner: &OwnerId,
        channel: Channel,
        count: u64,
    ) -> Result<QuotaDelta, QuotaError> {
        self.with_account(owner, channel, |quota| quota.charge(count))
    }

    async fn restore_quota(
        &self,
        owner: &OwnerId,
        channel: Channel,
        count: u64,
    ) -> Result<QuotaDelta, QuotaError> {
        self.with_account(owner, channel, |quota| quota.refund(count))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use volley_common::CredentialsRef;

    use super::*;
    use crate::quota::{BucketKind, QuotaBucket};

    fn seeded(count: usize) -> (MemoryMessageStore, CampaignId, Vec<MessageId>) {
        let store = MemoryMessageStore::new();
        let campaign_id = CampaignId::generate();
        let messages: Vec<_> = (0..count)
            .map(|i| Message::new(campaign_id, format!("+1555000{i:04}")))
            .collect();
        let mut ids: Vec<_> = messages.iter().map(|m| m.id).collect();
        ids.sort();
        store.insert_all(messages).unwrap();
        (store, campaign_id, ids)
    }

    #[tokio::test]
    async fn test_pages_follow_the_cursor() {
        let (store, campaign_id, ids) = seeded(5);

        let first = store
            .load_pending_page(&PageRequest {
                campaign_id,
                after: None,
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(first.iter().map(|m| m.id).collect::<Vec<_>>(), ids[..2]);

        let rest = store
            .load_pending_page(&PageRequest {
                campaign_id,
                after: Some(ids[1]),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(rest.iter().map(|m| m.id).collect::<Vec<_>>(), ids[2..]);
    }

    #[tokio::test]
    async fn test_pages_skip_other_campaigns_and_terminal_messages() {
        let (store, campaign_id, ids) = seeded(3);
        store
            .insert_all([Message::new(CampaignId::generate(), "+15559999")])
            .unwrap();
        store
            .update_message_status(&StatusUpdate::sent(ids[0], Some("p-1".to_string()), 0))
            .await
            .unwrap();

        let page = store
            .load_pending_page(&PageRequest {
                campaign_id,
                after: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), ids[1..]);
    }

    #[tokio::test]
    async fn test_status_writes_are_idempotent() {
        let (store, _, ids) = seeded(1);
        let sent = StatusUpdate::sent(ids[0], Some("p-1".to_string()), 0);

        store.update_message_status(&sent).await.unwrap();
        store.update_message_status(&sent).await.unwrap();
        store
            .update_message_status(&StatusUpdate::pending(ids[0], "late retry", 1))
            .await
            .unwrap();

        let message = store.get(ids[0]).unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.provider_message_id.as_deref(), Some("p-1"));
        assert_eq!(store.updates().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_message() {
        let store = MemoryMessageStore::new();
        let result = store
            .update_message_status(&StatusUpdate::failed(MessageId::generate(), "x", 0))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_campaign_summaries_update_the_record() {
        let store = MemoryCampaignStore::new();
        let campaign = Campaign::new(
            OwnerId::from("owner"),
            Channel::Email,
            "tpl",
            CredentialsRef("c".to_string()),
            3,
        );
        let id = campaign.id;
        store.insert(campaign).unwrap();

        let mut summary = CampaignSummary {
            campaign_id: id,
            owner: OwnerId::from("owner"),
            channel: Channel::Email,
            total_messages: 3,
            progress: volley_common::CampaignProgress {
                success: 1,
                failed: 0,
                pending: 2,
                retried: 0,
            },
            in_progress: true,
            stopped: false,
            last_error: None,
            finished_at: None,
        };
        store.persist_campaign_progress(&summary).await.unwrap();
        assert!(store.get(id).unwrap().in_progress);

        summary.in_progress = false;
        summary.progress.success = 3;
        summary.progress.pending = 0;
        store.persist_campaign_final(&summary).await.unwrap();

        let campaign = store.load_campaign(id).await.unwrap();
        assert!(!campaign.in_progress);
        assert_eq!(campaign.progress.success, 3);
        assert_eq!(store.progress_history(id).len(), 1);
        assert_eq!(store.final_summary(id), Some(summary));
    }

    #[tokio::test]
    async fn test_ledger_round_trip() {
        let ledger = MemoryQuotaLedger::new();
        let owner = OwnerId::from("owner");
        ledger.set_quota(
            owner.clone(),
            Channel::Whatsapp,
            Quota::new(vec![
                QuotaBucket::new(BucketKind::Primary, 10),
                QuotaBucket::new(BucketKind::Bonus, 5),
            ]),
        );
        let before = ledger.quota(&owner, Channel::Whatsapp).unwrap();

        let charged = ledger.decrement_quota(&owner, Channel::Whatsapp, 12).await.unwrap();
        assert_eq!(charged.applied_total(), 12);
        ledger.restore_quota(&owner, Channel::Whatsapp, 12).await.unwrap();

        assert_eq!(ledger.quota(&owner, Channel::Whatsapp), Some(before));
    }

    #[tokio::test]
    async fn test_ledger_unknown_account() {
        let ledger = MemoryQuotaLedger::new();
        let result = ledger
            .decrement_quota(&OwnerId::from("nobody"), Channel::Sms, 1)
            .await;
        assert!(matches!(result, Err(QuotaError::UnknownAccount { .. })));
    }
}
