//! Scripted provider for dispatch scenarios
//!
//! Replies are scripted per recipient and consumed in order; once a script
//! runs out the provider falls back to its default reply. Every call is
//! recorded with the (tokio) time it was made.
#![allow(dead_code)] // Test utility module - not all methods used in every test
//!
//! # Example
//!
//! ```rust,ignore
//! let provider = MockProvider::builder()
//!     .with_script("+15550001", [Reply::refuse("503 busy"), Reply::Accept])
//!     .with_default(Reply::refuse("invalid number"))
//!     .with_latency(Duration::from_millis(50))
//!     .build();
//! ```

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use volley_common::CredentialsRef;
use volley_dispatch::{ContentRef, Provider, ProviderResponse, TransportError};

/// One scripted provider reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Accept,
    Refuse(String),
    Transport(String),
    /// Never answers; the send timeout decides
    Hang,
}

impl Reply {
    pub fn refuse(text: &str) -> Self {
        Self::Refuse(text.to_string())
    }
}

/// A recorded provider call
#[derive(Debug, Clone)]
pub struct Call {
    pub recipient: String,
    pub template: String,
    pub at: Instant,
}

#[derive(Debug)]
pub struct MockProvider {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    default_reply: Reply,
    latency: Duration,
    calls: Mutex<Vec<Call>>,
    next_id: AtomicUsize,
}

pub struct MockProviderBuilder {
    scripts: HashMap<String, VecDeque<Reply>>,
    default_reply: Reply,
    latency: Duration,
}

impl MockProvider {
    pub fn builder() -> MockProviderBuilder {
        MockProviderBuilder {
            scripts: HashMap::new(),
            default_reply: Reply::Accept,
            latency: Duration::ZERO,
        }
    }

    /// A provider that accepts everything
    pub fn accepting() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, recipient: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.recipient == recipient)
            .count()
    }

    fn next_reply(&self, recipient: &str) -> Reply {
        self.scripts
            .lock()
            .get_mut(recipient)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default_reply.clone())
    }
}

impl MockProviderBuilder {
    /// Replies for `recipient`, consumed in order
    pub fn with_script(mut self, recipient: &str, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.scripts
            .insert(recipient.to_string(), replies.into_iter().collect());
        self
    }

    /// Reply used once a recipient's script is exhausted
    pub fn with_default(mut self, reply: Reply) -> Self {
        self.default_reply = reply;
        self
    }

    /// Delay before every reply
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn build(self) -> Arc<MockProvider> {
        Arc::new(MockProvider {
            scripts: Mutex::new(self.scripts),
            default_reply: self.default_reply,
            latency: self.latency,
            calls: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
        })
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn send_message(
        &self,
        _credentials: &CredentialsRef,
        recipient: &str,
        content: &ContentRef,
    ) -> Result<ProviderResponse, TransportError> {
        self.calls.lock().push(Call {
            recipient: recipient.to_string(),
            template: content.template.to_string(),
            at: Instant::now(),
        });
        let reply = self.next_reply(recipient);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match reply {
            Reply::Accept => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                Ok(ProviderResponse::accepted(format!("mock-{id}")))
            }
            Reply::Refuse(text) => Ok(ProviderResponse::rejected(text)),
            Reply::Transport(text) => Err(TransportError(text)),
            Reply::Hang => {
                std::future::pending::<()>().await;
                Err(TransportError("unreachable".to_string()))
            }
        }
    }
}
