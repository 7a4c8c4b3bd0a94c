//! Types shared across the volley workspace
//!
//! - Identifiers for campaigns, messages and owners
//! - The [`Campaign`] and [`Message`] records the dispatch engine works on
//! - Logging macros and subscriber initialisation

pub mod campaign;
pub mod id;
pub mod logging;
pub mod message;

pub use campaign::{Campaign, CampaignProgress, Channel, CredentialsRef};
pub use id::{CampaignId, MessageId, OwnerId};
pub use message::{Message, MessageStatus};
pub use tracing;

/// Process-wide lifecycle signal broadcast to long-running tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
