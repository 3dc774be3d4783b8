//! Wire form of a pushed message, as posted to `POST /push/{subscription}`.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::message::QueueMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushedMessage {
    /// Base64 of the JSON body.
    pub data: String,
    pub message_id: String,
    pub publish_time: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEnvelope {
    pub message: PushedMessage,
    pub subscription: String,
    #[serde(default)]
    pub delivery_attempt: u32,
}

impl PushEnvelope {
    pub fn from_message(subscription: impl Into<String>, message: &QueueMessage) -> Self {
        Self {
            message: PushedMessage {
                data: STANDARD.encode(message.body.as_bytes()),
                message_id: message.id.clone(),
                publish_time: message.publish_time,
                attributes: message.attributes.clone(),
            },
            subscription: subscription.into(),
            delivery_attempt: message.delivery_attempt,
        }
    }

    /// Decode into a message on `topic`.
    pub fn into_message(self, topic: impl Into<String>) -> Result<QueueMessage, QueueError> {
        let raw = STANDARD
            .decode(self.message.data.as_bytes())
            .map_err(|e| QueueError::Parse(format!("message {}: bad base64: {e}", self.message.message_id)))?;
        let body = String::from_utf8(raw)
            .map_err(|e| QueueError::Parse(format!("message {}: body is not utf-8: {e}", self.message.message_id)))?;
        Ok(QueueMessage {
            id: self.message.message_id,
            topic: topic.into(),
            body,
            publish_time: self.message.publish_time,
            attributes: self.message.attributes,
            delivery_attempt: self.delivery_attempt,
        })
    }
}
