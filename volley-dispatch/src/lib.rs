//! Bulk outbound message dispatch
//!
//! This crate provides functionality to:
//! - Load a campaign's pending messages page by page
//! - Send them through a provider under a shared rate limiter and circuit breaker
//! - Retry transient failures with exponential backoff
//! - Settle the owner's quota for successful sends
//! - Track and persist campaign progress, and stop campaigns on demand

pub mod circuit_breaker;
pub mod config;
mod engine;
mod error;
mod loader;
pub mod memory;
pub mod policy;
pub mod processor;
pub mod provider;
pub mod queue;
pub mod quota;
pub mod rate_limiter;
pub mod registry;
mod service;
pub mod status;
pub mod store;
mod types;

// Re-export shared components
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::DispatchConfig;
// Re-export the engine
pub use engine::{Collaborators, DispatchEngine};
// Re-export error types
pub use error::{DispatchError, PermanentError, SystemError, TemporaryError};
pub use loader::BatchLoader;
pub use policy::RetryPolicy;
// Re-export collaborator traits
pub use provider::{Provider, ProviderResponse, TransportError};
pub use quota::{QuotaDelta, QuotaError, QuotaLedger};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use service::DispatchControlService;
pub use status::{CampaignSummary, RunOutcome};
pub use store::{CampaignStore, MessageStore, StoreError};
pub use types::{ContentRef, EngineStats, ProcessingTask};
// Re-export common types
pub use volley_common::{Campaign, CampaignId, CampaignProgress, Message, MessageId, MessageStatus};
