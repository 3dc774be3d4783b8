//! Push subscriptions: deliver each message to a handler under a bounded
//! acknowledgment window, redeliver with backoff on failure or timeout, and
//! dead-letter after the last attempt.
//!
//! An attempt whose window elapses is *abandoned*, not cancelled: the handler
//! task keeps running and may race the redelivery. Handlers must therefore be
//! safe to run concurrently for the same message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use datafeed_core::Principal;

use crate::dead_letter::{DeadLetter, DeadLetterQueue};
use crate::message::QueueMessage;
use crate::retry::Backoff;
use crate::topic::Topic;

// ── Handler contract ─────────────────────────────────────────────────

/// Outcome of a failed delivery, as reported by the handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Worth retrying: network blips, upstream outages, store hiccups.
    #[error("transient: {0}")]
    Transient(String),
    /// Will fail the same way on redelivery (malformed input).
    #[error("permanent: {0}")]
    Permanent(String),
    /// Invoker or stage identity not allowed. Never retried.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

/// A single delivery attempt of a message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    /// Verified identity of whoever invoked the handler.
    pub invoker: Principal,
}

impl Delivery {
    pub fn attempt(&self) -> u32 {
        self.message.delivery_attempt
    }
}

/// Receives pushed messages. Returning `Ok` acknowledges the message.
#[async_trait]
pub trait PushHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError>;
}

/// Rejects deliveries whose invoker is not the expected principal before
/// the inner handler sees them.
pub struct RequireInvoker<H> {
    expected: Principal,
    inner: H,
}

impl<H> RequireInvoker<H> {
    pub fn new(expected: Principal, inner: H) -> Self {
        Self { expected, inner }
    }
}

#[async_trait]
impl<H: PushHandler> PushHandler for RequireInvoker<H> {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError> {
        if delivery.invoker != self.expected {
            return Err(HandlerError::Unauthorized(format!(
                "invoker '{}' is not '{}'",
                delivery.invoker, self.expected
            )));
        }
        self.inner.handle(delivery).await
    }
}

#[async_trait]
impl<H: PushHandler + ?Sized> PushHandler for Arc<H> {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError> {
        (**self).handle(delivery).await
    }
}

// ── Subscription config & stats ─────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub name: String,
    /// Identity the bus presents to the handler.
    pub invoker: Principal,
    pub ack_deadline: Duration,
    pub max_delivery_attempts: u32,
    pub backoff: Backoff,
}

impl SubscriptionConfig {
    pub fn new(name: impl Into<String>, invoker: Principal) -> Self {
        Self {
            name: name.into(),
            invoker,
            ack_deadline: Duration::from_secs(20),
            max_delivery_attempts: 5,
            backoff: Backoff::default(),
        }
    }

    pub fn ack_deadline(mut self, deadline: Duration) -> Self {
        self.ack_deadline = deadline;
        self
    }

    pub fn max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Delivery counters for one subscription.
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    attempts: AtomicU64,
    acked: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
}

/// JSON-serializable view of [`SubscriptionStats`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub attempts: u64,
    pub acked: u64,
    pub failed: u64,
    pub expired: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
}

impl SubscriptionStats {
    pub fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

// ── Subscription runtime ─────────────────────────────────────────────

/// A running push subscription.
pub struct PushSubscription {
    pub name: String,
    pub stats: Arc<SubscriptionStats>,
    pub dead_letters: Arc<DeadLetterQueue>,
    handle: JoinHandle<()>,
}

impl PushSubscription {
    /// Subscribe to `topic` and start pushing its messages to `handler`.
    pub fn spawn(
        topic: &Topic,
        handler: Arc<dyn PushHandler>,
        config: SubscriptionConfig,
        dead_letters: Arc<DeadLetterQueue>,
        shutdown: Arc<Notify>,
    ) -> Self {
        let rx = topic.subscribe();
        let stats = Arc::new(SubscriptionStats::default());
        let name = config.name.clone();
        let dispatcher = Dispatcher {
            config: Arc::new(config),
            handler,
            stats: stats.clone(),
            dead_letters: dead_letters.clone(),
        };
        let handle = tokio::spawn(dispatcher.run(rx, shutdown));
        Self {
            name,
            stats,
            dead_letters,
            handle,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[derive(Clone)]
struct Dispatcher {
    config: Arc<SubscriptionConfig>,
    handler: Arc<dyn PushHandler>,
    stats: Arc<SubscriptionStats>,
    dead_letters: Arc<DeadLetterQueue>,
}

enum AttemptOutcome {
    Acked,
    Failed(HandlerError),
    Expired,
}

impl Dispatcher {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<QueueMessage>, shutdown: Arc<Notify>) {
        let (redeliver_tx, mut redeliver_rx) = mpsc::unbounded_channel::<QueueMessage>();
        let stop = shutdown.notified();
        tokio::pin!(stop);
        stop.as_mut().enable();
        info!(subscription = %self.config.name, "push subscription started");

        loop {
            let message = tokio::select! {
                Some(m) = rx.recv() => m,
                Some(m) = redeliver_rx.recv() => m,
                _ = &mut stop => break,
                else => break,
            };
            let this = self.clone();
            let tx = redeliver_tx.clone();
            tokio::spawn(async move { this.deliver(message, tx).await });
        }

        info!(subscription = %self.config.name, "push subscription stopped");
    }

    async fn deliver(&self, mut message: QueueMessage, redeliver: mpsc::UnboundedSender<QueueMessage>) {
        message.delivery_attempt += 1;
        let attempt = message.delivery_attempt;
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);
        debug!(subscription = %self.config.name, message_id = %message.id, attempt, "delivering");

        let outcome = self.attempt(message.clone()).await;
        let error = match outcome {
            AttemptOutcome::Acked => {
                self.stats.acked.fetch_add(1, Ordering::Relaxed);
                debug!(subscription = %self.config.name, message_id = %message.id, attempt, "acked");
                return;
            }
            AttemptOutcome::Expired => {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                format!("ack deadline of {:?} expired", self.config.ack_deadline)
            }
            AttemptOutcome::Failed(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                if let HandlerError::Unauthorized(_) = e {
                    self.dead_letter(message, e.to_string());
                    return;
                }
                e.to_string()
            }
        };

        if attempt >= self.config.max_delivery_attempts {
            self.dead_letter(message, error);
            return;
        }

        let delay = self.config.backoff.delay_for(attempt);
        warn!(
            subscription = %self.config.name,
            message_id = %message.id,
            attempt,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "delivery failed, will redeliver"
        );
        tokio::time::sleep(delay).await;
        self.stats.redelivered.fetch_add(1, Ordering::Relaxed);
        // The receiver only goes away on shutdown; the message is lost with the process.
        let _ = redeliver.send(message);
    }

    async fn attempt(&self, message: QueueMessage) -> AttemptOutcome {
        let delivery = Delivery {
            message,
            invoker: self.config.invoker.clone(),
        };
        let handler = self.handler.clone();
        // Spawned so that an expired attempt keeps running instead of being cancelled.
        let work = tokio::spawn(async move { handler.handle(delivery).await });
        match tokio::time::timeout(self.config.ack_deadline, work).await {
            Ok(Ok(Ok(()))) => AttemptOutcome::Acked,
            Ok(Ok(Err(e))) => AttemptOutcome::Failed(e),
            Ok(Err(join_err)) => AttemptOutcome::Failed(HandlerError::Transient(format!(
                "handler task aborted: {join_err}"
            ))),
            Err(_) => AttemptOutcome::Expired,
        }
    }

    fn dead_letter(&self, message: QueueMessage, last_error: String) {
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.dead_letters.push(DeadLetter {
            subscription: self.config.name.clone(),
            attempts: message.delivery_attempt,
            message,
            last_error,
            dead_lettered_at: Utc::now(),
        });
    }
}
