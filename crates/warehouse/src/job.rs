//! Load jobs: landed object in, whole table out.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use datafeed_core::{ObjectUri, TableRef};
use datafeed_storage::{LandingStore, StorageError};

use crate::error::WarehouseError;
use crate::marker::MarkerUpdate;
use crate::source::{decode_parts, DecodeOptions};
use crate::table::GuardedWarehouse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteDisposition {
    /// Replace the whole table.
    Truncate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    Autodetect,
}

/// What a load reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    /// One landed object.
    Object(ObjectUri),
    /// Every object under `prefix`, stacked in name order.
    Prefix { bucket: String, prefix: String },
}

impl From<ObjectUri> for LoadSource {
    fn from(uri: ObjectUri) -> Self {
        LoadSource::Object(uri)
    }
}

impl fmt::Display for LoadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadSource::Object(uri) => write!(f, "{uri}"),
            LoadSource::Prefix { bucket, prefix } => write!(f, "{bucket}/{prefix}*"),
        }
    }
}

/// `{table}_{yyyymmddHHMMSS}_{8 hex}`; unique per attempt.
pub fn new_job_id(table: &str, at: DateTime<Utc>) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{table}_{}_{}", at.format("%Y%m%d%H%M%S"), &uuid[..8])
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadJob {
    pub job_id: String,
    pub table: TableRef,
    pub source: LoadSource,
    pub write_disposition: WriteDisposition,
    pub schema: SchemaMode,
    /// The header row.
    pub skip_leading_rows: u32,
    #[serde(skip)]
    pub options: DecodeOptions,
}

/// A finished load. When `marker` is `Superseded` a newer attempt owns the
/// table and this one wrote nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub job_id: String,
    pub row_count: u64,
    pub fingerprint: String,
    pub marker: MarkerUpdate,
}

impl LoadJob {
    pub fn new(table: TableRef, source: impl Into<LoadSource>, now: DateTime<Utc>) -> Self {
        Self {
            job_id: new_job_id(&table.table, now),
            table,
            source: source.into(),
            write_disposition: WriteDisposition::Truncate,
            schema: SchemaMode::Autodetect,
            skip_leading_rows: 1,
            options: DecodeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DecodeOptions) -> Self {
        self.options = options;
        self
    }

    /// Run to a terminal state. The marker is left `failed` on any error
    /// after the attempt began.
    pub async fn run(
        &self,
        warehouse: &GuardedWarehouse,
        landing: &dyn LandingStore,
    ) -> Result<LoadOutcome, WarehouseError> {
        warehouse.begin_attempt(&self.table, &self.job_id).await?;
        info!(job_id = %self.job_id, table = %self.table, source = %self.source, "load job started");

        match self.execute(warehouse, landing).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(mark_err) = warehouse.fail_attempt(&self.table, &self.job_id, &e.to_string()).await {
                    warn!(job_id = %self.job_id, error = %mark_err, "could not record failed load");
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        warehouse: &GuardedWarehouse,
        landing: &dyn LandingStore,
    ) -> Result<LoadOutcome, WarehouseError> {
        let parts = self.read_source(landing).await?;
        let batch = decode_parts(&parts, &self.options)?;
        let commit = warehouse.commit_attempt(&self.table, &self.job_id, &batch).await?;
        info!(
            job_id = %self.job_id,
            table = %self.table,
            parts = parts.len(),
            rows = commit.summary.row_count,
            fingerprint = %commit.summary.fingerprint,
            "load job completed"
        );
        Ok(LoadOutcome {
            job_id: self.job_id.clone(),
            row_count: commit.summary.row_count,
            fingerprint: commit.summary.fingerprint,
            marker: commit.marker,
        })
    }

    async fn read_source(&self, landing: &dyn LandingStore) -> Result<Vec<Bytes>, WarehouseError> {
        match &self.source {
            LoadSource::Object(uri) => Ok(vec![landing.get(&uri.bucket, &uri.object_name).await?]),
            LoadSource::Prefix { bucket, prefix } => {
                let objects = landing.list(bucket, prefix).await?;
                if objects.is_empty() {
                    return Err(StorageError::NotFound(self.source.to_string()).into());
                }
                let mut parts = Vec::with_capacity(objects.len());
                for object in &objects {
                    parts.push(landing.get(bucket, &object.uri.object_name).await?);
                }
                Ok(parts)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn job_id_has_table_timestamp_and_short_uuid() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let id = new_job_id("HOUSEHOLD_INCOME", at);
        assert!(id.starts_with("HOUSEHOLD_INCOME_20240301123005_"));
        assert_eq!(id.rsplit('_').next().unwrap().len(), 8);
        assert_ne!(id, new_job_id("HOUSEHOLD_INCOME", at));
    }

    #[test]
    fn prefix_source_renders_as_wildcard() {
        let source = LoadSource::Prefix {
            bucket: "landing".into(),
            prefix: "county-".into(),
        };
        assert_eq!(source.to_string(), "landing/county-*");
    }

    #[test]
    fn load_job_defaults() {
        let job = LoadJob::new(
            TableRef::new("census", "A"),
            ObjectUri {
                bucket: "landing".into(),
                object_name: "A".into(),
            },
            Utc::now(),
        );
        assert_eq!(job.write_disposition, WriteDisposition::Truncate);
        assert_eq!(job.schema, SchemaMode::Autodetect);
        assert_eq!(job.skip_leading_rows, 1);
    }
}
