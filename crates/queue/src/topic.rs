//! In-process topics with fan-out to push subscriptions.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use datafeed_core::{AccessPolicy, Permission, Principal};

use crate::error::QueueError;
use crate::message::QueueMessage;

/// Publishes messages to a topic. Publishing is at-least-once: a returned
/// `Ok` means the message was accepted by every current subscription.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Name of the topic this publisher writes to.
    fn topic(&self) -> &str;

    /// Publish a message, returning its id.
    async fn publish(&self, message: QueueMessage) -> Result<String, QueueError>;
}

/// Blanket implementation so `Arc<dyn Publisher>` can be used directly.
#[async_trait]
impl<T: Publisher + ?Sized> Publisher for Arc<T> {
    fn topic(&self) -> &str {
        (**self).topic()
    }

    async fn publish(&self, message: QueueMessage) -> Result<String, QueueError> {
        (**self).publish(message).await
    }
}

/// In-memory topic. Each subscription gets its own copy of every message.
pub struct Topic {
    name: String,
    subscriptions: RwLock<Vec<mpsc::UnboundedSender<QueueMessage>>>,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            subscriptions: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a new subscription and return its receiving end.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.push(tx);
        }
        rx
    }
}

#[async_trait]
impl Publisher for Topic {
    fn topic(&self) -> &str {
        &self.name
    }

    async fn publish(&self, message: QueueMessage) -> Result<String, QueueError> {
        if message.topic != self.name {
            return Err(QueueError::TopicMismatch {
                topic: self.name.clone(),
                message: message.topic,
            });
        }
        let mut subs = self.subscriptions.write().map_err(|_| QueueError::Publish {
            topic: self.name.clone(),
            reason: "subscription registry poisoned".into(),
        })?;
        // Drop subscriptions whose receiver has gone away.
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        debug!(topic = %self.name, message_id = %message.id, subscriptions = subs.len(), "published");
        Ok(message.id)
    }
}

/// A publisher opened on behalf of a principal; every publish is checked
/// against the access policy first.
pub struct GuardedPublisher {
    inner: Arc<dyn Publisher>,
    principal: Principal,
    policy: Arc<AccessPolicy>,
}

impl GuardedPublisher {
    pub fn new(inner: Arc<dyn Publisher>, principal: Principal, policy: Arc<AccessPolicy>) -> Self {
        Self {
            inner,
            principal,
            policy,
        }
    }
}

#[async_trait]
impl Publisher for GuardedPublisher {
    fn topic(&self) -> &str {
        self.inner.topic()
    }

    async fn publish(&self, message: QueueMessage) -> Result<String, QueueError> {
        self.policy
            .check(&self.principal, &Permission::publish(self.inner.topic()))?;
        self.inner.publish(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafeed_core::StageIdentities;

    #[tokio::test]
    async fn fans_out_to_every_subscription() {
        let topic = Topic::new("landed-objects");
        let mut a = topic.subscribe();
        let mut b = topic.subscribe();

        let msg = QueueMessage::new("landed-objects", &"x").unwrap();
        let id = topic.publish(msg).await.unwrap();

        assert_eq!(a.recv().await.unwrap().id, id);
        assert_eq!(b.recv().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn rejects_message_for_other_topic() {
        let topic = Topic::new("landed-objects");
        let msg = QueueMessage::new("fetch-requests", &"x").unwrap();
        assert!(matches!(
            topic.publish(msg).await,
            Err(QueueError::TopicMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn guarded_publisher_enforces_policy() {
        let ids = StageIdentities::default();
        let policy = Arc::new(AccessPolicy::least_privilege(&ids, "fetch-requests", "landed-objects", "ds"));
        let topic = Topic::new("landed-objects");
        let mut rx = topic.subscribe();

        let as_load = GuardedPublisher::new(topic.clone(), ids.load.clone(), policy.clone());
        let err = as_load
            .publish(QueueMessage::new("landed-objects", &"x").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::AccessDenied(_)));
        assert!(rx.try_recv().is_err());

        let as_ingest = GuardedPublisher::new(topic.clone(), ids.ingest.clone(), policy);
        as_ingest
            .publish(QueueMessage::new("landed-objects", &"x").unwrap())
            .await
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }
}
