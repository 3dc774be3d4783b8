//! Ingestion worker: FetchRequest in, landed objects and notifications out.
//!
//! The message is acknowledged only after every part is durably written and
//! every notification accepted. Duplicate or concurrent deliveries of the
//! same request overwrite the same object names, so no dedup state is kept.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use datafeed_core::{FetchRequest, LandedObjectEvent, ObjectTarget};
use datafeed_queue::{
    retry_with_backoff_when, Backoff, Delivery, HandlerError, Publisher, PushHandler, QueueError, QueueMessage,
};
use datafeed_storage::{LandingStore, ObjectInfo};

use crate::error::PipelineError;
use crate::fetcher::{FetchedPart, FetcherRegistry};
use crate::metrics::PipelineMetrics;

/// Bounded in-handler retry of the notification publish.
#[derive(Debug, Clone, Copy)]
pub struct PublishRetry {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for PublishRetry {
    fn default() -> Self {
        Self {
            attempts: 4,
            backoff: Backoff::new(Duration::from_millis(200), Duration::from_secs(2)),
        }
    }
}

pub struct IngestionWorker {
    fetchers: FetcherRegistry,
    /// Opened as the ingest identity.
    landing: Arc<dyn LandingStore>,
    /// Notification bus, opened as the ingest identity.
    notifications: Arc<dyn Publisher>,
    fetch_timeout: Duration,
    publish_retry: PublishRetry,
    metrics: PipelineMetrics,
}

impl IngestionWorker {
    pub fn new(
        fetchers: FetcherRegistry,
        landing: Arc<dyn LandingStore>,
        notifications: Arc<dyn Publisher>,
        fetch_timeout: Duration,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            fetchers,
            landing,
            notifications,
            fetch_timeout,
            publish_retry: PublishRetry::default(),
            metrics,
        }
    }

    pub fn with_publish_retry(mut self, retry: PublishRetry) -> Self {
        self.publish_retry = retry;
        self
    }

    /// Fetch, land and announce one dataset. Returns the published events.
    pub async fn ingest(&self, request: &FetchRequest) -> Result<Vec<LandedObjectEvent>, PipelineError> {
        let descriptor = request.descriptor();
        let fetcher = self.fetchers.get(&descriptor.id);

        let parts = tokio::time::timeout(self.fetch_timeout, fetcher.fetch(descriptor))
            .await
            .map_err(|_| PipelineError::Timeout {
                what: format!("fetch of '{}'", descriptor.id),
                after: self.fetch_timeout,
            })??;
        check_parts(&descriptor.id, &descriptor.target, &parts)?;

        let mut landed: Vec<ObjectInfo> = Vec::with_capacity(parts.len());
        for part in parts {
            let name = descriptor.target.object_name(&part.suffix);
            let info = self.landing.put(&descriptor.landing_bucket, &name, part.bytes).await?;
            info!(dataset = %descriptor.id, object = %info.uri, bytes = info.size, "landed object");
            landed.push(info);
        }

        let mut events = Vec::with_capacity(landed.len());
        for info in landed {
            let event = LandedObjectEvent {
                bucket: info.uri.bucket,
                object_name: info.uri.object_name,
                dataset_id: descriptor.id.clone(),
                landed_at: Some(info.last_modified),
            };
            self.announce(&event).await?;
            events.push(event);
        }
        Ok(events)
    }

    async fn announce(&self, event: &LandedObjectEvent) -> Result<(), PipelineError> {
        let message = QueueMessage::new(self.notifications.topic(), event)?
            .with_attribute("dataset_id", &event.dataset_id);
        let what = format!("notify {}/{}", event.bucket, event.object_name);
        let id = retry_with_backoff_when(
            &what,
            self.publish_retry.attempts,
            self.publish_retry.backoff,
            |e: &QueueError| !matches!(e, QueueError::AccessDenied(_)),
            || self.notifications.publish(message.clone()),
        )
        .await?;
        info!(dataset = %event.dataset_id, object = %event.object_name, message_id = %id, "landing announced");
        Ok(())
    }
}

/// A `filename` target takes exactly one part; a `fileprefix` target takes
/// one or more with distinct suffixes.
fn check_parts(dataset: &str, target: &ObjectTarget, parts: &[FetchedPart]) -> Result<(), PipelineError> {
    let invalid = |reason: String| PipelineError::InvalidFetch {
        dataset: dataset.to_string(),
        reason,
    };
    match target {
        ObjectTarget::Exact(_) if parts.len() != 1 => {
            Err(invalid(format!("filename target needs exactly one part, fetcher returned {}", parts.len())))
        }
        ObjectTarget::Prefix(_) if parts.is_empty() => Err(invalid("fetcher returned no parts".into())),
        ObjectTarget::Prefix(_) => {
            let mut seen = HashSet::new();
            match parts.iter().find(|p| !seen.insert(p.suffix.as_str())) {
                Some(dup) => Err(invalid(format!("duplicate part suffix '{}'", dup.suffix))),
                None => Ok(()),
            }
        }
        ObjectTarget::Exact(_) => Ok(()),
    }
}

#[async_trait]
impl PushHandler for IngestionWorker {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError> {
        let request: FetchRequest = delivery
            .message
            .decode()
            .map_err(|e| PipelineError::from(e).classify())?;
        let dataset = request.descriptor().id.clone();

        match self.ingest(&request).await {
            Ok(events) => {
                self.metrics.record_landed(&dataset, events.len()).await;
                Ok(())
            }
            Err(e) => {
                warn!(dataset = %dataset, attempt = delivery.attempt(), error = %e, "ingestion failed");
                self.metrics.record_ingest_failure(&dataset, &e.to_string()).await;
                Err(e.classify())
            }
        }
    }
}
