//! Warehouse loader: LandedObjectEvent in, whole-table replacement out.
//!
//! A `fileprefix` dataset lands several parts but owns one table, so every
//! event for it reloads all parts under the prefix. Whichever event is
//! delivered last, the table ends up holding every landed part.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use datafeed_core::{LandedObjectEvent, PipelineConfig, TableRef};
use datafeed_queue::{Delivery, HandlerError, PushHandler};
use datafeed_storage::LandingStore;
use datafeed_warehouse::{DecodeOptions, GuardedWarehouse, LoadJob, LoadOutcome, LoadSource, MarkerUpdate};

use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;

pub struct WarehouseLoader {
    /// Opened as the load identity.
    warehouse: GuardedWarehouse,
    /// Opened as the load identity.
    landing: Arc<dyn LandingStore>,
    /// Warehouse dataset every table lives in.
    dataset: String,
    options: HashMap<String, DecodeOptions>,
    /// Dataset id to `fileprefix`, for datasets landed in parts.
    prefixes: HashMap<String, String>,
    load_timeout: Duration,
    metrics: PipelineMetrics,
}

impl WarehouseLoader {
    pub fn new(
        warehouse: GuardedWarehouse,
        landing: Arc<dyn LandingStore>,
        dataset: impl Into<String>,
        load_timeout: Duration,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            warehouse,
            landing,
            dataset: dataset.into(),
            options: HashMap::new(),
            prefixes: HashMap::new(),
            load_timeout,
            metrics,
        }
    }

    /// Take per-dataset decode options and part prefixes from the topology.
    pub fn with_config(mut self, config: &PipelineConfig) -> Self {
        self.options = config
            .datasets
            .iter()
            .filter(|d| !d.string_columns.is_empty())
            .map(|d| {
                let options = DecodeOptions {
                    string_columns: d.string_columns.clone(),
                };
                (d.id.clone(), options)
            })
            .collect();
        self.prefixes = config
            .datasets
            .iter()
            .filter_map(|d| Some((d.id.clone(), d.fileprefix.clone()?)))
            .collect();
        self
    }

    pub fn table_for(&self, dataset_id: &str) -> TableRef {
        TableRef::new(&self.dataset, dataset_id)
    }

    fn source_for(&self, event: &LandedObjectEvent) -> LoadSource {
        match self.prefixes.get(&event.dataset_id) {
            Some(prefix) => LoadSource::Prefix {
                bucket: event.bucket.clone(),
                prefix: prefix.clone(),
            },
            None => LoadSource::Object(event.source_uri()),
        }
    }

    /// Run one load job for the landed object to a terminal state.
    pub async fn load(&self, event: &LandedObjectEvent) -> Result<LoadOutcome, PipelineError> {
        if event.dataset_id.trim().is_empty() {
            return Err(PipelineError::UnknownDataset(event.dataset_id.clone()));
        }
        let table = self.table_for(&event.dataset_id);
        let options = self.options.get(&event.dataset_id).cloned().unwrap_or_default();
        let job = LoadJob::new(table.clone(), self.source_for(event), Utc::now()).with_options(options);

        match tokio::time::timeout(self.load_timeout, job.run(&self.warehouse, self.landing.as_ref())).await {
            Ok(outcome) => Ok(outcome?),
            Err(_) => {
                let reason = format!("load timed out after {:?}", self.load_timeout);
                if let Err(e) = self.warehouse.fail_attempt(&table, &job.job_id, &reason).await {
                    warn!(job_id = %job.job_id, error = %e, "could not record timed out load");
                }
                Err(PipelineError::Timeout {
                    what: format!("load job {}", job.job_id),
                    after: self.load_timeout,
                })
            }
        }
    }
}

#[async_trait]
impl PushHandler for WarehouseLoader {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError> {
        let event: LandedObjectEvent = delivery
            .message
            .decode()
            .map_err(|e| PipelineError::from(e).classify())?;

        match self.load(&event).await {
            Ok(outcome) if outcome.marker != MarkerUpdate::Applied => {
                info!(
                    dataset = %event.dataset_id,
                    job_id = %outcome.job_id,
                    attempt = delivery.attempt(),
                    "load superseded by a newer attempt"
                );
                self.metrics.record_load_superseded(&event.dataset_id, &outcome.job_id).await;
                Ok(())
            }
            Ok(outcome) => {
                info!(
                    dataset = %event.dataset_id,
                    job_id = %outcome.job_id,
                    rows = outcome.row_count,
                    attempt = delivery.attempt(),
                    "table loaded"
                );
                self.metrics.record_load(&event.dataset_id, outcome.row_count).await;
                Ok(())
            }
            Err(e) => {
                warn!(dataset = %event.dataset_id, attempt = delivery.attempt(), error = %e, "load failed");
                self.metrics.record_load_failure(&event.dataset_id, &e.to_string()).await;
                Err(e.classify())
            }
        }
    }
}
