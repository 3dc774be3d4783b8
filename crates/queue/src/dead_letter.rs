//! Dead-letter queue for messages that exhausted their delivery attempts.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use crate::message::QueueMessage;

/// A message parked for operator attention.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub subscription: String,
    pub message: QueueMessage,
    pub attempts: u32,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Letters kept before the oldest is evicted.
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1_000;

#[derive(Debug)]
struct Parked {
    letters: VecDeque<DeadLetter>,
    capacity: usize,
    evicted: u64,
}

/// Bounded queue of dead letters. Once full, each new letter evicts the
/// oldest and bumps `evicted`.
#[derive(Debug)]
pub struct DeadLetterQueue {
    inner: Mutex<Parked>,
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DEAD_LETTER_CAPACITY)
    }
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Parked {
                letters: VecDeque::with_capacity(capacity.min(64)),
                capacity: capacity.max(1),
                evicted: 0,
            }),
        }
    }

    /// A panic elsewhere while holding the lock must not hide dead letters.
    fn parked(&self) -> MutexGuard<'_, Parked> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, letter: DeadLetter) {
        error!(
            subscription = %letter.subscription,
            message_id = %letter.message.id,
            attempts = letter.attempts,
            error = %letter.last_error,
            "message dead-lettered"
        );
        let mut parked = self.parked();
        if parked.letters.len() == parked.capacity {
            if let Some(oldest) = parked.letters.pop_front() {
                parked.evicted += 1;
                error!(message_id = %oldest.message.id, evicted = parked.evicted, "dead-letter queue full; oldest letter evicted");
            }
        }
        parked.letters.push_back(letter);
    }

    pub fn depth(&self) -> usize {
        self.parked().letters.len()
    }

    /// Letters dropped to make room since start.
    pub fn evicted(&self) -> u64 {
        self.parked().evicted
    }

    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.parked().letters.iter().cloned().collect()
    }

    /// Remove and return everything, e.g. to replay after a fix.
    pub fn drain(&self) -> Vec<DeadLetter> {
        self.parked().letters.drain(..).collect()
    }
}
