//! Join coordinator: derives tables once every dependency has completed.
//!
//! Each task walks `pending → ready → running → completed | failed`. A task
//! is recomputed only when the set of dependency versions differs from the
//! one its last completed attempt consumed, and a failing version set is
//! retried up to `max_attempts` times before the task waits for new data.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use datafeed_core::{JoinConfig, PipelineConfig, TableRef};
use datafeed_warehouse::{new_job_id, run_derived, DerivedQuery, GuardedWarehouse, InnerJoin, WarehouseError};

use crate::metrics::PipelineMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
}

/// One dependency table as read by an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumedInput {
    pub table: String,
    pub version: u64,
}

/// Externally visible state of one join task.
#[derive(Debug, Clone, Serialize)]
pub struct JoinTaskStatus {
    pub name: String,
    pub state: JoinState,
    pub depends_on: Vec<String>,
    /// Id of the newest attempt, if any ran.
    pub attempt_id: Option<String>,
    /// Inputs consumed by the last completed attempt.
    pub consumed: Vec<ConsumedInput>,
    /// Attempts spent on the current dependency version set.
    pub attempts: u32,
    pub pending_since: Option<DateTime<Utc>>,
    pub stale: bool,
    pub last_error: Option<String>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

struct JoinTask {
    config: JoinConfig,
    destination: TableRef,
    inputs: Vec<TableRef>,
    query: Arc<dyn DerivedQuery>,
}

struct TaskEntry {
    status: JoinTaskStatus,
    /// Version set the attempt counter belongs to.
    tried: Option<Vec<u64>>,
    /// Version set consumed by the last completed attempt.
    completed: Option<Vec<u64>>,
}

pub struct JoinCoordinator {
    /// Opened as the join identity.
    warehouse: GuardedWarehouse,
    tasks: Vec<JoinTask>,
    entries: RwLock<Vec<TaskEntry>>,
    join_timeout: Duration,
    metrics: PipelineMetrics,
}

impl JoinCoordinator {
    /// One task per `[[joins]]` entry, each an inner join over its dependencies.
    pub fn new(
        config: &PipelineConfig,
        warehouse: GuardedWarehouse,
        dataset: &str,
        join_timeout: Duration,
        metrics: PipelineMetrics,
    ) -> Self {
        let tasks: Vec<JoinTask> = config
            .joins
            .iter()
            .map(|join| JoinTask {
                destination: TableRef::new(dataset, &join.name),
                inputs: join.depends_on.iter().map(|dep| TableRef::new(dataset, dep)).collect(),
                query: Arc::new(InnerJoin::new(join.on.clone())),
                config: join.clone(),
            })
            .collect();
        let entries = tasks
            .iter()
            .map(|task| TaskEntry {
                status: JoinTaskStatus {
                    name: task.config.name.clone(),
                    state: JoinState::Pending,
                    depends_on: task.config.depends_on.clone(),
                    attempt_id: None,
                    consumed: Vec::new(),
                    attempts: 0,
                    pending_since: Some(Utc::now()),
                    stale: false,
                    last_error: None,
                    last_completed_at: None,
                },
                tried: None,
                completed: None,
            })
            .collect();
        Self {
            warehouse,
            tasks,
            entries: RwLock::new(entries),
            join_timeout,
            metrics,
        }
    }

    /// Replace the derived query of one task (builder style).
    pub fn with_query(mut self, name: &str, query: Arc<dyn DerivedQuery>) -> Self {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.config.name == name) {
            task.query = query;
        }
        self
    }

    pub async fn statuses(&self) -> Vec<JoinTaskStatus> {
        self.entries.read().await.iter().map(|e| e.status.clone()).collect()
    }

    pub async fn status(&self, name: &str) -> Option<JoinTaskStatus> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.status.name == name)
            .map(|e| e.status.clone())
    }

    /// Evaluate every task once, running those that are ready.
    pub async fn evaluate(&self) -> Vec<JoinTaskStatus> {
        for idx in 0..self.tasks.len() {
            self.evaluate_task(idx).await;
        }
        self.statuses().await
    }

    /// Re-evaluate on every `poll` tick and whenever a completion marker changes.
    pub async fn run(self: Arc<Self>, poll: Duration, shutdown: Arc<Notify>) {
        if self.tasks.is_empty() {
            debug!("no join tasks configured");
            return;
        }
        info!(tasks = self.tasks.len(), poll_secs = poll.as_secs(), "join coordinator started");
        let stop = shutdown.notified();
        tokio::pin!(stop);
        stop.as_mut().enable();

        let mut changes = self.warehouse.subscribe();
        let mut ticker = tokio::time::interval(poll);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Ok(()) = changes.changed() => {}
                _ = &mut stop => break,
            }
            self.evaluate().await;
        }
        info!("join coordinator stopped");
    }

    async fn evaluate_task(&self, idx: usize) {
        let task = &self.tasks[idx];
        if self.entries.read().await[idx].status.state == JoinState::Running {
            return;
        }

        let versions = match self.dependency_versions(task).await {
            Ok(Some(versions)) => versions,
            Ok(None) => {
                self.mark_pending(idx, None).await;
                return;
            }
            Err(e) => {
                warn!(task = %task.config.name, error = %e, "could not read dependency markers");
                self.mark_pending(idx, Some(e.to_string())).await;
                return;
            }
        };

        let attempt_id = {
            let mut entries = self.entries.write().await;
            let entry = &mut entries[idx];
            // Another evaluation may have claimed the task since the first check.
            if entry.status.state == JoinState::Running {
                return;
            }
            if entry.completed.as_ref() == Some(&versions) {
                entry.status.state = JoinState::Completed;
                return;
            }
            if entry.tried.as_ref() != Some(&versions) {
                entry.tried = Some(versions.clone());
                entry.status.attempts = 0;
            }
            if entry.status.attempts >= task.config.max_attempts {
                entry.status.state = JoinState::Failed;
                return;
            }
            entry.status.state = JoinState::Ready;
            debug!(task = %task.config.name, ?versions, "dependencies completed; ready");

            let attempt_id = new_job_id(&task.config.name, Utc::now());
            entry.status.state = JoinState::Running;
            entry.status.attempts += 1;
            entry.status.attempt_id = Some(attempt_id.clone());
            attempt_id
        };

        let result = tokio::time::timeout(
            self.join_timeout,
            run_derived(&self.warehouse, &attempt_id, &task.destination, &task.inputs, task.query.as_ref()),
        )
        .await;

        let mut entries = self.entries.write().await;
        let entry = &mut entries[idx];
        match result {
            Ok(Ok(outcome)) => {
                info!(task = %task.config.name, attempt_id = %attempt_id, rows = outcome.row_count, "join completed");
                entry.completed = Some(outcome.inputs.iter().map(|(_, v)| *v).collect());
                entry.status.consumed = outcome
                    .inputs
                    .iter()
                    .map(|(table, version)| ConsumedInput {
                        table: table.table.clone(),
                        version: *version,
                    })
                    .collect();
                entry.status.state = JoinState::Completed;
                entry.status.pending_since = None;
                entry.status.stale = false;
                entry.status.last_error = None;
                entry.status.last_completed_at = Some(Utc::now());
                drop(entries);
                self.metrics.record_join(&task.config.name, None).await;
            }
            Ok(Err(WarehouseError::NotReady(table))) => {
                // A dependency started reloading between the check and the read.
                debug!(task = %task.config.name, table = %table, "dependency changed mid-read; back to pending");
                entry.status.attempts = entry.status.attempts.saturating_sub(1);
                drop(entries);
                self.mark_pending(idx, None).await;
            }
            Ok(Err(e)) => {
                warn!(task = %task.config.name, attempt_id = %attempt_id, attempt = entry.status.attempts, error = %e, "join failed");
                entry.status.state = JoinState::Failed;
                entry.status.last_error = Some(e.to_string());
                drop(entries);
                self.metrics.record_join(&task.config.name, Some(e.to_string())).await;
            }
            Err(_) => {
                let reason = format!("join timed out after {:?}", self.join_timeout);
                warn!(task = %task.config.name, attempt_id = %attempt_id, "{reason}");
                entry.status.state = JoinState::Failed;
                entry.status.last_error = Some(reason.clone());
                drop(entries);
                if let Err(e) = self.warehouse.fail_attempt(&task.destination, &attempt_id, &reason).await {
                    warn!(attempt_id = %attempt_id, error = %e, "could not record timed out join");
                }
                self.metrics.record_join(&task.config.name, Some(reason)).await;
            }
        }
    }

    /// Versions of every dependency, or `None` while any has not completed.
    async fn dependency_versions(&self, task: &JoinTask) -> Result<Option<Vec<u64>>, WarehouseError> {
        let mut versions = Vec::with_capacity(task.inputs.len());
        for table in &task.inputs {
            match self.warehouse.marker(table).await? {
                Some(marker) if marker.is_completed() => versions.push(marker.version()),
                _ => {
                    debug!(task = %task.config.name, table = %table, "dependency not completed");
                    return Ok(None);
                }
            }
        }
        Ok(Some(versions))
    }

    async fn mark_pending(&self, idx: usize, error: Option<String>) {
        let task = &self.tasks[idx];
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let status = &mut entries[idx].status;
        if status.state != JoinState::Pending {
            status.state = JoinState::Pending;
            status.pending_since = Some(now);
            status.stale = false;
        }
        if error.is_some() {
            status.last_error = error;
        }

        let Some(stale_after) = task.config.stale_after() else { return };
        let waited = status
            .pending_since
            .and_then(|since| (now - since).to_std().ok())
            .unwrap_or_default();
        if !status.stale && waited >= stale_after {
            status.stale = true;
            warn!(
                task = %task.config.name,
                waited_secs = waited.as_secs(),
                depends_on = ?task.config.depends_on,
                "join task is stale; dependencies still not completed"
            );
        }
    }
}
