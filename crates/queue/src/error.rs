//! Queue error types.

use thiserror::Error;

use datafeed_core::AccessDenied;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("message encode error: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("message parse error: {0}")]
    Parse(String),

    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("topic mismatch: message for '{message}' published to '{topic}'")]
    TopicMismatch { topic: String, message: String },

    #[error("authentication error: {0}")]
    Auth(String),

    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),
}
