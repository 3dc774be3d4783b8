//! Pipeline metrics: per-dataset freshness and stage counters, plus a ring
//! buffer of recent stage events exposed via `GET /metrics`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use datafeed_queue::SubscriptionSnapshot;

use crate::join::JoinTaskStatus;

// ── Constants ────────────────────────────────────────────────────────

/// Recent events kept for `GET /metrics`.
const RECENT_EVENTS_CAPACITY: usize = 200;

// ── Ring buffer ──────────────────────────────────────────────────────

/// A fixed-size ring buffer backed by `VecDeque`.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push an item, evicting the oldest if at capacity.
    pub fn push(&mut self, item: T) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Iterate over items from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }
}

// ── Events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Schedule,
    Ingest,
    Load,
    Join,
}

/// One stage outcome, kept in the recent-events ring.
#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    pub at: DateTime<Utc>,
    pub stage: Stage,
    pub subject: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ── Per-dataset stats ────────────────────────────────────────────────

/// Counters and freshness for one dataset.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatasetMetrics {
    pub ticks: u64,
    pub tick_failures: u64,
    pub fetches_ok: u64,
    pub fetches_failed: u64,
    pub objects_landed: u64,
    pub loads_ok: u64,
    /// Loads that finished after a newer attempt began and wrote nothing.
    pub loads_superseded: u64,
    pub loads_failed: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_landed_at: Option<DateTime<Utc>>,
    pub last_loaded_at: Option<DateTime<Utc>>,
    pub last_row_count: Option<u64>,
    /// Seconds since the table was last replaced.
    pub freshness_secs: Option<i64>,
}

// ── Full metrics response ────────────────────────────────────────────

/// Complete JSON response from `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    pub datasets: BTreeMap<String, DatasetMetrics>,
    pub subscriptions: BTreeMap<String, SubscriptionSnapshot>,
    pub dead_letter_depth: usize,
    /// Dead letters dropped because the queue was full.
    pub dead_letters_evicted: u64,
    pub joins: Vec<JoinTaskStatus>,
    pub recent_events: Vec<StageEvent>,
    pub uptime_secs: f64,
}

// ── PipelineMetrics ──────────────────────────────────────────────────

#[derive(Debug)]
struct Inner {
    datasets: HashMap<String, DatasetMetrics>,
    recent: RingBuffer<StageEvent>,
}

/// Thread-safe metrics collector shared by every stage.
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    inner: Arc<Mutex<Inner>>,
    start: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                datasets: HashMap::new(),
                recent: RingBuffer::new(RECENT_EVENTS_CAPACITY),
            })),
            start: Instant::now(),
        }
    }

    async fn record(&self, dataset: &str, event: StageEvent, update: impl FnOnce(&mut DatasetMetrics)) {
        let mut inner = self.inner.lock().await;
        update(inner.datasets.entry(dataset.to_string()).or_default());
        inner.recent.push(event);
    }

    fn event(stage: Stage, subject: &str, ok: bool, detail: Option<String>) -> StageEvent {
        StageEvent {
            at: Utc::now(),
            stage,
            subject: subject.to_string(),
            ok,
            detail,
        }
    }

    /// A schedule tick published (or failed to publish) its fetch request.
    pub async fn record_tick(&self, dataset: &str, error: Option<String>) {
        let ok = error.is_none();
        let event = Self::event(Stage::Schedule, dataset, ok, error);
        self.record(dataset, event, |m| {
            m.ticks += 1;
            m.last_tick_at = Some(Utc::now());
            if !ok {
                m.tick_failures += 1;
            }
        })
        .await;
    }

    pub async fn record_landed(&self, dataset: &str, objects: usize) {
        let event = Self::event(Stage::Ingest, dataset, true, Some(format!("{objects} object(s)")));
        self.record(dataset, event, |m| {
            m.fetches_ok += 1;
            m.objects_landed += objects as u64;
            m.last_landed_at = Some(Utc::now());
        })
        .await;
    }

    pub async fn record_ingest_failure(&self, dataset: &str, error: &str) {
        let event = Self::event(Stage::Ingest, dataset, false, Some(error.to_string()));
        self.record(dataset, event, |m| m.fetches_failed += 1).await;
    }

    pub async fn record_load(&self, dataset: &str, row_count: u64) {
        let event = Self::event(Stage::Load, dataset, true, Some(format!("{row_count} rows")));
        self.record(dataset, event, |m| {
            m.loads_ok += 1;
            m.last_loaded_at = Some(Utc::now());
            m.last_row_count = Some(row_count);
        })
        .await;
    }

    pub async fn record_load_superseded(&self, dataset: &str, job_id: &str) {
        let event = Self::event(Stage::Load, dataset, true, Some(format!("{job_id} superseded")));
        self.record(dataset, event, |m| m.loads_superseded += 1).await;
    }

    pub async fn record_load_failure(&self, dataset: &str, error: &str) {
        let event = Self::event(Stage::Load, dataset, false, Some(error.to_string()));
        self.record(dataset, event, |m| m.loads_failed += 1).await;
    }

    pub async fn record_join(&self, task: &str, error: Option<String>) {
        let event = Self::event(Stage::Join, task, error.is_none(), error);
        self.inner.lock().await.recent.push(event);
    }

    /// Per-dataset metrics with freshness computed against now.
    pub async fn datasets(&self) -> BTreeMap<String, DatasetMetrics> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        inner
            .datasets
            .iter()
            .map(|(id, m)| {
                let mut m = m.clone();
                m.freshness_secs = m.last_loaded_at.map(|at| (now - at).num_seconds());
                (id.clone(), m)
            })
            .collect()
    }

    pub async fn recent_events(&self) -> Vec<StageEvent> {
        self.inner.lock().await.recent.iter().cloned().collect()
    }

    pub fn uptime_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
