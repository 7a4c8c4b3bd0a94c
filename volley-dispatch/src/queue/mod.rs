//! Retry queue for transiently failed and deferred messages
//!
//! Tasks are popped lowest attempt first, then oldest first, so fresh
//! failures are not starved by messages that keep failing.

pub mod retry;

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::atomic::{AtomicU64, Ordering as AtomicOrdering},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};

use crate::types::ProcessingTask;

/// A message waiting for its next attempt
#[derive(Debug, Clone)]
pub struct RetryTask {
    pub task: ProcessingTask,
    /// Attempt number the task will run as
    pub attempt: u32,
    pub enqueued_at: Instant,
    /// Backoff requested when the task was enqueued
    pub delay: Duration,
    seq: u64,
}

impl RetryTask {
    /// When the task becomes eligible to run
    #[must_use]
    pub fn ready_at(&self) -> Instant {
        self.enqueued_at + self.delay
    }

    /// Backoff still left to wait, zero once the task is due
    #[must_use]
    pub fn remaining_delay(&self) -> Duration {
        self.ready_at().saturating_duration_since(Instant::now())
    }

    fn key(&self) -> (u32, Instant, u64) {
        (self.attempt, self.enqueued_at, self.seq)
    }
}

impl PartialEq for RetryTask {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for RetryTask {}

impl PartialOrd for RetryTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RetryTask {
    // Reversed so the max-heap pops the smallest key
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Priority queue of [`RetryTask`]s with an async pop
#[derive(Debug, Default)]
pub struct RetryQueue {
    heap: Mutex<BinaryHeap<RetryTask>>,
    notify: Notify,
    seq: AtomicU64,
}

impl RetryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `task` to run as `attempt` after `delay`
    pub fn push(&self, task: ProcessingTask, attempt: u32, delay: Duration) {
        let retry = RetryTask {
            task,
            attempt,
            enqueued_at: Instant::now(),
            delay,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
        };

        self.heap.lock().push(retry);
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<RetryTask> {
        self.heap.lock().pop()
    }

    /// Wait for the next task
    ///
    /// Cancel-safe: a task is only removed from the queue when the returned
    /// future completes.
    pub async fn pop(&self) -> RetryTask {
        loop {
            let notified = self.notify.notified();
            if let Some(retry) = self.try_pop() {
                return retry;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Remove every queued task
    pub fn drain(&self) -> Vec<RetryTask> {
        self.heap.lock().drain().collect()
    }
}
