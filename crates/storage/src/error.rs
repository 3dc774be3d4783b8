use thiserror::Error;

use datafeed_core::AccessDenied;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),
}
