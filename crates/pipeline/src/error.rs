use std::time::Duration;

use thiserror::Error;

use datafeed_core::CoreError;
use datafeed_queue::{HandlerError, QueueError};
use datafeed_storage::StorageError;
use datafeed_warehouse::WarehouseError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),

    #[error("fetch failed for '{dataset}': {reason}")]
    Fetch { dataset: String, reason: String },

    /// The descriptor or fetcher output can never produce a valid landing.
    #[error("invalid fetch for '{dataset}': {reason}")]
    InvalidFetch { dataset: String, reason: String },

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("unknown dataset '{0}'")]
    UnknownDataset(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// How the bus should treat this failure.
    pub fn classify(&self) -> HandlerError {
        let msg = self.to_string();
        match self {
            PipelineError::Queue(QueueError::AccessDenied(_))
            | PipelineError::Storage(StorageError::AccessDenied(_))
            | PipelineError::Warehouse(WarehouseError::AccessDenied(_))
            | PipelineError::Warehouse(WarehouseError::Storage(StorageError::AccessDenied(_))) => {
                HandlerError::Unauthorized(msg)
            }
            PipelineError::Queue(QueueError::Parse(_))
            | PipelineError::Core(_)
            | PipelineError::InvalidFetch { .. }
            | PipelineError::UnknownDataset(_)
            | PipelineError::Warehouse(
                WarehouseError::Malformed(_) | WarehouseError::Query(_) | WarehouseError::Marker { .. },
            ) => HandlerError::Permanent(msg),
            _ => HandlerError::Transient(msg),
        }
    }
}

impl From<PipelineError> for HandlerError {
    fn from(e: PipelineError) -> Self {
        e.classify()
    }
}
