#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use datafeed_core::{DatasetDescriptor, PipelineConfig, Settings};
use datafeed_pipeline::{FetchedPart, Fetcher, FetcherRegistry, Pipeline, PipelineError};
use datafeed_storage::{ObjectLandingStore, StorageBackend};
use datafeed_warehouse::{DecodeOptions, Warehouse};

pub const DATASET: &str = "census";

/// Census SAIPE extract: header plus three counties.
pub const SAIPE_CSV: &str = "state,county,median_income\n01,001,58786\n01,003,55962\n01,005,34186\n";
pub const POPULATION_CSV: &str = "state,county,population\n01,001,55869\n01,003,223234\n02,013,3337\n";

/// Always returns the same bytes, counting calls. The first `slow_calls`
/// calls sleep for `delay` first.
pub struct StaticFetcher {
    pub body: Bytes,
    pub calls: AtomicU32,
    pub slow_calls: u32,
    pub delay: Duration,
}

impl StaticFetcher {
    pub fn new(body: &'static str) -> Arc<Self> {
        Self::slow(body, 0, Duration::ZERO)
    }

    pub fn slow(body: &'static str, slow_calls: u32, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            body: Bytes::from_static(body.as_bytes()),
            calls: AtomicU32::new(0),
            slow_calls,
            delay,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, _descriptor: &DatasetDescriptor) -> Result<Vec<FetchedPart>, PipelineError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.slow_calls {
            tokio::time::sleep(self.delay).await;
        }
        Ok(vec![FetchedPart::whole(self.body.clone())])
    }
}

/// Returns the same named parts on every call.
pub struct PartsFetcher {
    pub parts: Vec<(&'static str, &'static str)>,
}

impl PartsFetcher {
    pub fn new(parts: Vec<(&'static str, &'static str)>) -> Arc<Self> {
        Arc::new(Self { parts })
    }
}

#[async_trait]
impl Fetcher for PartsFetcher {
    async fn fetch(&self, _descriptor: &DatasetDescriptor) -> Result<Vec<FetchedPart>, PipelineError> {
        Ok(self
            .parts
            .iter()
            .map(|(suffix, body)| FetchedPart::named(*suffix, Bytes::from_static(body.as_bytes())))
            .collect())
    }
}

/// Fingerprint of the table a single clean load of `csv` produces.
pub fn clean_fingerprint(csv: &str) -> String {
    let batch = datafeed_warehouse::decode(csv.as_bytes(), &DecodeOptions::default()).unwrap();
    datafeed_warehouse::fingerprint(&datafeed_warehouse::encode_parquet(&batch).unwrap())
}

/// Settings with a fast bus and short timeouts.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::for_profile("");
    settings.warehouse.dataset = DATASET.into();
    settings.bus.ack_deadline = Duration::from_millis(500);
    settings.bus.max_delivery_attempts = 3;
    settings.bus.min_backoff = Duration::from_millis(10);
    settings.bus.max_backoff = Duration::from_millis(40);
    settings.bus.publish_retry_attempts = 2;
    settings.timeouts.fetch = Duration::from_secs(2);
    settings.timeouts.load = Duration::from_secs(2);
    settings.timeouts.join = Duration::from_secs(2);
    settings.timeouts.join_poll = Duration::from_millis(100);
    settings.auth.push_token_secret = Some("test-push-secret".into());
    settings.auth.push_audience = "datafeed-push".into();
    settings
}

pub fn topology(toml: &str) -> PipelineConfig {
    PipelineConfig::from_toml(toml).unwrap()
}

/// Pipeline over in-memory stores.
pub fn pipeline(settings: Settings, config: &PipelineConfig, fetchers: FetcherRegistry) -> Pipeline {
    Pipeline::with_stores(
        settings,
        config,
        fetchers,
        Arc::new(ObjectLandingStore::new(StorageBackend::memory())),
        Arc::new(Warehouse::new(StorageBackend::memory())),
    )
    .unwrap()
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wait until `dataset` has at least `n` finished loads, counting those a
/// newer attempt superseded.
pub async fn wait_for_loads(pipeline: &Pipeline, dataset: &str, n: u64) {
    eventually(&format!("{n} load(s) of {dataset}"), || async {
        pipeline
            .metrics
            .datasets()
            .await
            .get(dataset)
            .is_some_and(|m| m.loads_ok + m.loads_superseded >= n)
    })
    .await;
}
