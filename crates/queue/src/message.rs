use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Envelope for a message on a topic.
///
/// The body is the JSON payload exactly as it appears on the wire. The `id`
/// is assigned at publish time and survives redelivery, which makes it the
/// key a deduplication ledger would use; no such ledger exists, every stage
/// is idempotent instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub topic: String,
    /// JSON payload.
    pub body: String,
    pub publish_time: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Number of deliveries attempted so far (0 before the first).
    #[serde(default)]
    pub delivery_attempt: u32,
}

impl QueueMessage {
    /// Create a new message, serializing the payload as JSON.
    pub fn new<T: Serialize>(topic: impl Into<String>, payload: &T) -> Result<Self, QueueError> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            body: serde_json::to_string(payload).map_err(QueueError::Encode)?,
            publish_time: Utc::now(),
            attributes: BTreeMap::new(),
            delivery_attempt: 0,
        })
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Deserialize the body into the expected type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, QueueError> {
        serde_json::from_str(&self.body)
            .map_err(|e| QueueError::Parse(format!("message {} on '{}': {e}", self.id, self.topic)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_returns_payload() {
        let msg = QueueMessage::new("fetch-requests", &serde_json::json!({"id": "A"})).unwrap();
        assert_eq!(msg.topic, "fetch-requests");
        assert_eq!(msg.delivery_attempt, 0);
        let v: serde_json::Value = msg.decode().unwrap();
        assert_eq!(v["id"], "A");
    }

    #[test]
    fn decode_error_names_message() {
        let mut msg = QueueMessage::new("t", &1u32).unwrap();
        msg.body = "{not json".into();
        let err = msg.decode::<serde_json::Value>().unwrap_err();
        assert!(err.to_string().contains(&msg.id));
    }

    #[test]
    fn messages_get_distinct_ids() {
        let a = QueueMessage::new("t", &1u32).unwrap();
        let b = QueueMessage::new("t", &1u32).unwrap();
        assert_ne!(a.id, b.id);
    }
}
