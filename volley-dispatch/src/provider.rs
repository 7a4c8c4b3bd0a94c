//! Messaging provider seam
//!
//! The engine never talks to a concrete provider API. Implementations of
//! [`Provider`] perform the send and report what the provider said; the
//! dispatcher decides what that means for the message.

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;
use volley_common::CredentialsRef;

use crate::types::ContentRef;

/// What the provider answered for one send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResponse {
    pub success: bool,
    /// Provider-side identifier, used to reconcile delivery reports
    pub provider_message_id: Option<String>,
    /// Provider's error text when `success` is false
    pub error_text: Option<String>,
}

impl ProviderResponse {
    /// The provider accepted the message
    #[must_use]
    pub fn accepted(provider_message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            provider_message_id: Some(provider_message_id.into()),
            error_text: None,
        }
    }

    /// The provider refused the message
    #[must_use]
    pub fn rejected(error_text: impl Into<String>) -> Self {
        Self {
            success: false,
            provider_message_id: None,
            error_text: Some(error_text.into()),
        }
    }
}

/// The call never produced a provider answer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Transport error: {0}")]
pub struct TransportError(pub String);

/// A messaging provider integration
#[async_trait]
pub trait Provider: Send + Sync + Debug {
    /// Send one message
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the request did not reach the provider
    /// or its answer was lost. A provider-side refusal is an `Ok` response
    /// with `success` set to false.
    async fn send_message(
        &self,
        credentials: &CredentialsRef,
        recipient: &str,
        content: &ContentRef,
    ) -> Result<ProviderResponse, TransportError>;
}
