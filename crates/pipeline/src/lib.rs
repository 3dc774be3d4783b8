pub mod error;
pub mod fetcher;
pub mod http;
pub mod ingest;
pub mod join;
pub mod loader;
pub mod metrics;
pub mod runtime;
pub mod scheduler;

pub use error::PipelineError;
pub use fetcher::{FetchedPart, Fetcher, FetcherRegistry, HttpFetcher};
pub use http::{build_router, AppState, PushRoute};
pub use ingest::{IngestionWorker, PublishRetry};
pub use join::{ConsumedInput, JoinCoordinator, JoinState, JoinTaskStatus};
pub use loader::WarehouseLoader;
pub use metrics::{DatasetMetrics, MetricsResponse, PipelineMetrics};
pub use runtime::{Pipeline, INGEST_SUBSCRIPTION, LOAD_SUBSCRIPTION, NOTIFICATION_TOPIC, TRIGGER_TOPIC};
pub use scheduler::Scheduler;
