use thiserror::Error;

use datafeed_core::{AccessDenied, TableRef};
use datafeed_storage::StorageError;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Source data that no retry will fix.
    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("table not found: {0}")]
    TableNotFound(TableRef),

    /// The table's newest load has not completed, or changed while being read.
    #[error("table {0} is not ready to be read")]
    NotReady(TableRef),

    #[error("completion marker for {table} is unreadable: {source}")]
    Marker {
        table: TableRef,
        #[source]
        source: serde_json::Error,
    },

    #[error("derived query failed: {0}")]
    Query(String),

    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),
}

impl WarehouseError {
    /// Whether redelivering the same input could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WarehouseError::Storage(StorageError::ObjectStore(_) | StorageError::Io(_))
                | WarehouseError::ObjectStore(_)
                | WarehouseError::NotReady(_)
        )
    }
}
