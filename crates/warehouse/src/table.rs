//! Parquet-backed tables with completion markers.
//!
//! Each table lives at `{dataset}/{table}/data.parquet` and its marker at
//! `{dataset}/{table}/_marker.json`. A table write is a full replacement of
//! the Parquet object, made only by the attempt the marker names as newest,
//! so the data object always matches `last_success`.

use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::Utc;
use object_store::PutPayload;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use datafeed_core::config::WarehouseSettings;
use datafeed_core::{AccessPolicy, Permission, Principal, TableRef};
use datafeed_storage::StorageBackend;

use crate::error::WarehouseError;
use crate::marker::{CompletionMarker, MarkerUpdate};

const DATA_FILE: &str = "data.parquet";
const MARKER_FILE: &str = "_marker.json";

/// What a table write produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub row_count: u64,
    pub fingerprint: String,
}

/// A committed attempt: what it wrote, and what became of the marker.
/// When `marker` is `Superseded` nothing was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub summary: WriteSummary,
    pub marker: MarkerUpdate,
}

/// A consistent read of a completed table.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub table: TableRef,
    pub batch: RecordBatch,
    pub job_id: String,
    pub version: u64,
}

/// Encode a batch as Parquet. Same batch in, same bytes out.
pub fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>, WarehouseError> {
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(Default::default()))
        .build();
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(buf)
}

pub fn fingerprint(parquet_bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(parquet_bytes))
}

pub struct Warehouse {
    backend: StorageBackend,
    /// Serialises marker read-modify-write and the data write of a commit.
    marker_lock: Mutex<()>,
    changes: watch::Sender<u64>,
}

impl Warehouse {
    pub fn new(backend: StorageBackend) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            backend,
            marker_lock: Mutex::new(()),
            changes,
        }
    }

    pub fn from_settings(settings: &WarehouseSettings) -> Result<Self, WarehouseError> {
        let backend = match &settings.dir {
            Some(dir) => StorageBackend::local(dir)?,
            None => StorageBackend::memory(),
        };
        info!(backend = backend.label(), dataset = %settings.dataset, "warehouse opened");
        Ok(Self::new(backend))
    }

    /// Ticks whenever any completion marker changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    async fn put(&self, table: &TableRef, file: &str, bytes: Vec<u8>) -> Result<(), WarehouseError> {
        let (store, path) = self.backend.locate(&table.dataset, &format!("{}/{file}", table.table))?;
        store.put(&path, PutPayload::from(bytes)).await?;
        Ok(())
    }

    async fn get(&self, table: &TableRef, file: &str) -> Result<Option<Bytes>, WarehouseError> {
        let (store, path) = self.backend.locate(&table.dataset, &format!("{}/{file}", table.table))?;
        match store.get(&path).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the table with `batch` and complete `job_id`, provided
    /// `job_id` is still the newest attempt. A superseded attempt leaves both
    /// the data and the marker untouched.
    pub async fn commit_attempt(
        &self,
        table: &TableRef,
        job_id: &str,
        batch: &RecordBatch,
    ) -> Result<Commit, WarehouseError> {
        let bytes = encode_parquet(batch)?;
        let summary = WriteSummary {
            row_count: batch.num_rows() as u64,
            fingerprint: fingerprint(&bytes),
        };

        let _guard = self.marker_lock.lock().await;
        let Some(mut marker) = self.marker(table).await? else {
            warn!(table = %table, job_id, "attempt committed without a marker; nothing written");
            return Ok(Commit {
                summary,
                marker: MarkerUpdate::Superseded {
                    newer_job_id: String::new(),
                },
            });
        };
        if let Some(update) = marker.superseded_by(job_id) {
            warn!(table = %table, job_id, "attempt superseded; table and marker left unchanged");
            return Ok(Commit { summary, marker: update });
        }

        let size = bytes.len();
        self.put(table, DATA_FILE, bytes).await?;
        debug!(table = %table, rows = summary.row_count, size, "table replaced");
        let update = marker.complete(job_id, Utc::now(), summary.row_count, summary.fingerprint.clone());
        self.store_marker(&marker).await?;
        Ok(Commit { summary, marker: update })
    }

    pub async fn read_table(&self, table: &TableRef) -> Result<RecordBatch, WarehouseError> {
        let bytes = self
            .get(table, DATA_FILE)
            .await?
            .ok_or_else(|| WarehouseError::TableNotFound(table.clone()))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
        let schema = builder.schema().clone();
        let batches = builder.build()?.collect::<Result<Vec<_>, _>>()?;
        Ok(concat_batches(&schema, &batches)?)
    }

    /// Fingerprint of the stored Parquet object, if the table exists.
    pub async fn table_fingerprint(&self, table: &TableRef) -> Result<Option<String>, WarehouseError> {
        Ok(self.get(table, DATA_FILE).await?.map(|b| fingerprint(&b)))
    }

    pub async fn marker(&self, table: &TableRef) -> Result<Option<CompletionMarker>, WarehouseError> {
        match self.get(table, MARKER_FILE).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| WarehouseError::Marker {
                    table: table.clone(),
                    source,
                }),
            None => Ok(None),
        }
    }

    async fn store_marker(&self, marker: &CompletionMarker) -> Result<(), WarehouseError> {
        let bytes = serde_json::to_vec_pretty(marker).map_err(|source| WarehouseError::Marker {
            table: marker.table.clone(),
            source,
        })?;
        self.put(&marker.table, MARKER_FILE, bytes).await?;
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
        Ok(())
    }

    /// Mark `job_id` as the newest attempt on `table`.
    pub async fn begin_attempt(&self, table: &TableRef, job_id: &str) -> Result<CompletionMarker, WarehouseError> {
        let _guard = self.marker_lock.lock().await;
        let previous = self.marker(table).await?;
        let marker = CompletionMarker::begin(previous, table, job_id, Utc::now());
        self.store_marker(&marker).await?;
        debug!(table = %table, job_id, "attempt started");
        Ok(marker)
    }

    pub async fn fail_attempt(&self, table: &TableRef, job_id: &str, error: &str) -> Result<MarkerUpdate, WarehouseError> {
        let _guard = self.marker_lock.lock().await;
        let Some(mut marker) = self.marker(table).await? else {
            warn!(table = %table, job_id, "attempt failed without a marker; ignoring");
            return Ok(MarkerUpdate::Superseded {
                newer_job_id: String::new(),
            });
        };
        let update = marker.fail(job_id, Utc::now(), error);
        match &update {
            MarkerUpdate::Applied => self.store_marker(&marker).await?,
            MarkerUpdate::Superseded { newer_job_id } => {
                warn!(table = %table, job_id, newer_job_id = %newer_job_id, "attempt superseded; marker left unchanged");
            }
        }
        Ok(update)
    }

    /// Read a table whose newest attempt has completed. Fails with
    /// `NotReady` if it has not, or if a new attempt started mid-read.
    pub async fn read_completed(&self, table: &TableRef) -> Result<TableSnapshot, WarehouseError> {
        let before = self
            .marker(table)
            .await?
            .filter(CompletionMarker::is_completed)
            .ok_or_else(|| WarehouseError::NotReady(table.clone()))?;
        let batch = self.read_table(table).await?;
        let after = self.marker(table).await?;
        if after.as_ref() != Some(&before) {
            return Err(WarehouseError::NotReady(table.clone()));
        }
        Ok(TableSnapshot {
            table: table.clone(),
            batch,
            job_id: before.latest_attempt.job_id.clone(),
            version: before.version(),
        })
    }
}

/// Warehouse access on behalf of a principal. Reads need `WarehouseRead`
/// and writes need `WarehouseWrite`, both scoped to the table's dataset.
#[derive(Clone)]
pub struct GuardedWarehouse {
    inner: Arc<Warehouse>,
    principal: Principal,
    policy: Arc<AccessPolicy>,
}

impl GuardedWarehouse {
    pub fn new(inner: Arc<Warehouse>, principal: Principal, policy: Arc<AccessPolicy>) -> Self {
        Self {
            inner,
            principal,
            policy,
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.subscribe()
    }

    fn can_read(&self, table: &TableRef) -> Result<(), WarehouseError> {
        let permission = Permission::WarehouseRead {
            dataset: table.dataset.clone(),
        };
        Ok(self.policy.check(&self.principal, &permission)?)
    }

    fn can_write(&self, table: &TableRef) -> Result<(), WarehouseError> {
        let permission = Permission::WarehouseWrite {
            dataset: table.dataset.clone(),
        };
        Ok(self.policy.check(&self.principal, &permission)?)
    }


    pub async fn read_table(&self, table: &TableRef) -> Result<RecordBatch, WarehouseError> {
        self.can_read(table)?;
        self.inner.read_table(table).await
    }

    pub async fn read_completed(&self, table: &TableRef) -> Result<TableSnapshot, WarehouseError> {
        self.can_read(table)?;
        self.inner.read_completed(table).await
    }

    pub async fn marker(&self, table: &TableRef) -> Result<Option<CompletionMarker>, WarehouseError> {
        self.can_read(table)?;
        self.inner.marker(table).await
    }

    pub async fn begin_attempt(&self, table: &TableRef, job_id: &str) -> Result<CompletionMarker, WarehouseError> {
        self.can_write(table)?;
        self.inner.begin_attempt(table, job_id).await
    }

    pub async fn commit_attempt(
        &self,
        table: &TableRef,
        job_id: &str,
        batch: &RecordBatch,
    ) -> Result<Commit, WarehouseError> {
        self.can_write(table)?;
        self.inner.commit_attempt(table, job_id, batch).await
    }

    pub async fn fail_attempt(&self, table: &TableRef, job_id: &str, error: &str) -> Result<MarkerUpdate, WarehouseError> {
        self.can_write(table)?;
        self.inner.fail_attempt(table, job_id, error).await
    }
}
