pub mod dead_letter;
pub mod envelope;
pub mod error;
pub mod message;
pub mod push;
pub mod retry;
pub mod token;
pub mod topic;

pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use envelope::{PushEnvelope, PushedMessage};
pub use error::QueueError;
pub use message::QueueMessage;
pub use push::{
    Delivery, HandlerError, PushHandler, PushSubscription, RequireInvoker, SubscriptionConfig,
    SubscriptionSnapshot, SubscriptionStats,
};
pub use retry::{retry_with_backoff, retry_with_backoff_when, Backoff};
pub use token::{mint_push_token, PushClaims, PushTokenVerifier};
pub use topic::{GuardedPublisher, Publisher, Topic};
