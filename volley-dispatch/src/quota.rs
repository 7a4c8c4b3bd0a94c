//! Per-owner, per-channel send quota
//!
//! A [`Quota`] is an ordered set of buckets. Charges drain the primary
//! allotment first, then bonus, then carry-over. Refunds walk the buckets in
//! the opposite order so that a refund of units that were just charged puts
//! every bucket back exactly where it was.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use volley_common::{Channel, OwnerId, tracing};

/// Quota ledger failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("No quota account for {owner} on {channel}")]
    UnknownAccount { owner: OwnerId, channel: Channel },

    #[error("Quota ledger unavailable: {0}")]
    Unavailable(String),
}

/// Kind of quota bucket, in charge priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    Primary,
    Bonus,
    CarryOver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaBucket {
    pub kind: BucketKind,
    pub limit: u64,
    #[serde(default)]
    pub used: u64,
}

impl QuotaBucket {
    #[must_use]
    pub const fn new(kind: BucketKind, limit: u64) -> Self {
        Self {
            kind,
            limit,
            used: 0,
        }
    }

    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

/// How a charge or refund was spread over the buckets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaDelta {
    pub requested: u64,
    pub applied: Vec<(BucketKind, u64)>,
}

impl QuotaDelta {
    #[must_use]
    pub fn applied_total(&self) -> u64 {
        self.applied.iter().map(|(_, units)| units).sum()
    }

    /// Units that no bucket could absorb
    #[must_use]
    pub fn shortfall(&self) -> u64 {
        self.requested.saturating_sub(self.applied_total())
    }
}

/// Quota account of one owner on one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    buckets: Vec<QuotaBucket>,
}

impl Quota {
    /// Build an account from its buckets, in any order
    #[must_use]
    pub fn new(mut buckets: Vec<QuotaBucket>) -> Self {
        buckets.sort_by_key(|bucket| bucket.kind);
        Self { buckets }
    }

    #[must_use]
    pub fn buckets(&self) -> &[QuotaBucket] {
        &self.buckets
    }

    #[must_use]
    pub fn bucket(&self, kind: BucketKind) -> Option<&QuotaBucket> {
        self.buckets.iter().find(|bucket| bucket.kind == kind)
    }

    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.buckets.iter().map(QuotaBucket::remaining).sum()
    }

    /// Consume `units`, primary first, never beyond a bucket's limit
    pub fn charge(&mut self, units: u64) -> QuotaDelta {
        let mut delta = QuotaDelta {
            requested: units,
            applied: Vec::new(),
        };
        let mut left = units;

        for bucket in &mut self.buckets {
            if left == 0 {
                break;
            }
            let take = bucket.remaining().min(left);
            if take > 0 {
                bucket.used += take;
                left -= take;
                delta.applied.push((bucket.kind, take));
            }
        }

        delta
    }

    /// Give back `units`, carry-over first, never below zero usage
    pub fn refund(&mut self, units: u64) -> QuotaDelta {
        let mut delta = QuotaDelta {
            requested: units,
            applied: Vec::new(),
        };
        let mut left = units;

        for bucket in self.buckets.iter_mut().rev() {
            if left == 0 {
                break;
            }
            let give = bucket.used.min(left);
            if give > 0 {
                bucket.used -= give;
                left -= give;
                delta.applied.push((bucket.kind, give));
            }
        }

        delta
    }
}

/// Quota persistence
#[async_trait]
pub trait QuotaLedger: Send + Sync + Debug {
    /// Atomically consume `count` units from the owner's account
    ///
    /// # Errors
    /// If the account is unknown or the ledger cannot be written
    async fn decrement_quota(
        &self,
        owner: &OwnerId,
        channel: Channel,
        count: u64,
    ) -> Result<QuotaDelta, QuotaError>;

    /// Atomically give back `count` units to the owner's account
    ///
    /// # Errors
    /// If the account is unknown or the ledger cannot be written
    async fn restore_quota(
        &self,
        owner: &OwnerId,
        channel: Channel,
        count: u64,
    ) -> Result<QuotaDelta, QuotaError>;
}

/// Charge `successes` units for a finished batch
///
/// Nothing is charged in dry-run mode or when the batch had no successes.
///
/// # Errors
/// If the ledger rejects the charge
#[tracing::instrument(skip(ledger, owner, channel), fields(owner = %owner, channel = %channel))]
pub async fn settle_batch(
    ledger: &dyn QuotaLedger,
    owner: &OwnerId,
    channel: Channel,
    successes: u64,
    dry_run: bool,
) -> Result<Option<QuotaDelta>, QuotaError> {
    if dry_run || successes == 0 {
        return Ok(None);
    }

    let delta = ledger.decrement_quota(owner, channel, successes).await?;

    if delta.shortfall() > 0 {
        tracing::warn!(
            requested = delta.requested,
            shortfall = delta.shortfall(),
            "Quota exhausted, charge only partially applied"
        );
    }
    if let Some(metrics) = volley_metrics::metrics() {
        metrics
            .dispatch
            .record_quota_charged(&channel.to_string(), delta.applied_total());
    }

    Ok(Some(delta))
}

/// Give back quota for messages the provider later reported as failed
///
/// # Errors
/// If the ledger rejects the refund
pub async fn refund_late_failures(
    ledger: &dyn QuotaLedger,
    owner: &OwnerId,
    channel: Channel,
    count: u64,
) -> Result<QuotaDelta, QuotaError> {
    let delta = ledger.restore_quota(owner, channel, count).await?;

    if let Some(metrics) = volley_metrics::metrics() {
        metrics
            .dispatch
            .record_quota_refunded(&channel.to_string(), delta.applied_total());
    }

    Ok(delta)
}
