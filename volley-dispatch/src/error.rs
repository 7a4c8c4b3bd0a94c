//! Typed error handling for dispatch operations.
//!
//! This module provides structured error types that distinguish between:
//! - Permanent failures (invalid recipient, provider rejection) - don't retry
//! - Temporary failures (timeouts, 429/503, network) - retry with backoff
//! - System errors - batch setup problems that abort the whole campaign
//!
//! Cancellation is not an error for individual messages; it only surfaces as
//! [`DispatchError::Cancelled`] from operations that were asked to do work on a
//! campaign that has been stopped.

use thiserror::Error;
use volley_common::CampaignId;

use crate::{quota::QuotaError, store::StoreError};

/// Top-level dispatch error type.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Permanent failure that should not be retried.
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Temporary failure that can be retried with backoff.
    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    /// System-level error (store, configuration, bookkeeping).
    #[error("System error: {0}")]
    System(#[from] SystemError),

    /// The campaign was stopped.
    #[error("Campaign stopped")]
    Cancelled,
}

/// Permanent errors that should not be retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermanentError {
    /// Recipient address is malformed or unknown to the provider.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Content was refused (template missing, policy violation, malformed payload).
    #[error("Rejected by provider: {0}")]
    Rejected(String),

    /// A temporary failure kept recurring until the retry budget ran out.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Temporary errors that should be retried with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemporaryError {
    /// The provider call did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The provider throttled us (429 or equivalent).
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The provider is temporarily unavailable (502/503/504, busy).
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Transport-level failure (connection reset, refused, DNS).
    #[error("Network error: {0}")]
    Network(String),
}

/// System-level errors that indicate setup or bookkeeping problems.
#[derive(Debug, Error)]
pub enum SystemError {
    /// The campaign record does not exist.
    #[error("Campaign not found: {0}")]
    CampaignNotFound(CampaignId),

    /// The campaign is already being dispatched.
    #[error("Campaign already running: {0}")]
    AlreadyRunning(CampaignId),

    /// A storage collaborator failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The quota ledger failed.
    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Other internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Returns `true` if this error is permanent and should not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Returns `true` if this is a system error.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }
}

impl From<StoreError> for DispatchError {
    fn from(error: StoreError) -> Self {
        Self::System(SystemError::Store(error))
    }
}

impl From<QuotaError> for DispatchError {
    fn from(error: QuotaError) -> Self {
        Self::System(SystemError::Quota(error))
    }
}
