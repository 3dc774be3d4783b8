pub mod error;
pub mod job;
pub mod marker;
pub mod query;
pub mod source;
pub mod table;

pub use error::WarehouseError;
pub use job::{new_job_id, LoadJob, LoadOutcome, LoadSource, SchemaMode, WriteDisposition};
pub use marker::{AttemptRecord, CompletionMarker, JobState, MarkerUpdate, SuccessRecord};
pub use query::{run_derived, DerivedQuery, InnerJoin, QueryOutcome};
pub use source::{decode, decode_parts, DecodeOptions, SourceFormat};
pub use table::{encode_parquet, fingerprint, Commit, GuardedWarehouse, TableSnapshot, Warehouse, WriteSummary};
