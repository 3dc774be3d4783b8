//! Scheduler: one independent tick loop per dataset, each publishing a
//! FetchRequest to the trigger bus.
//!
//! Publishing is fire-and-forget. A failed publish is logged and counted and
//! the next tick simply tries again.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use datafeed_core::{DatasetDescriptor, FetchRequest, PipelineConfig, Recurrence};
use datafeed_queue::{Publisher, QueueMessage};

use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;

#[derive(Debug, Clone)]
struct ScheduledDataset {
    descriptor: DatasetDescriptor,
    recurrence: Option<Recurrence>,
    run_on_start: bool,
}

pub struct Scheduler {
    datasets: Vec<ScheduledDataset>,
    /// Trigger bus, opened as the scheduler identity.
    trigger: Arc<dyn Publisher>,
    metrics: PipelineMetrics,
}

impl Scheduler {
    pub fn from_config(
        config: &PipelineConfig,
        trigger: Arc<dyn Publisher>,
        metrics: PipelineMetrics,
    ) -> Result<Self, PipelineError> {
        let datasets = config
            .datasets
            .iter()
            .map(|d| -> Result<ScheduledDataset, PipelineError> {
                Ok(ScheduledDataset {
                    descriptor: d.descriptor()?,
                    recurrence: d.recurrence()?,
                    run_on_start: d.run_on_start,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            datasets,
            trigger,
            metrics,
        })
    }

    pub fn dataset_ids(&self) -> impl Iterator<Item = &str> {
        self.datasets.iter().map(|d| d.descriptor.id.as_str())
    }

    /// Publish one FetchRequest for `dataset_id` right away.
    pub async fn trigger_now(&self, dataset_id: &str) -> Result<String, PipelineError> {
        let dataset = self
            .datasets
            .iter()
            .find(|d| d.descriptor.id == dataset_id)
            .ok_or_else(|| PipelineError::UnknownDataset(dataset_id.to_string()))?;
        info!(dataset = %dataset_id, "manual trigger");
        tick(self.trigger.as_ref(), &self.metrics, &dataset.descriptor).await
    }

    /// Start one tick loop per dataset that has a recurrence.
    pub fn spawn(&self, shutdown: Arc<Notify>) -> Vec<JoinHandle<()>> {
        self.datasets
            .iter()
            .filter_map(|dataset| {
                let Some(recurrence) = dataset.recurrence.clone() else {
                    debug!(dataset = %dataset.descriptor.id, "no recurrence; manual trigger only");
                    return None;
                };
                let descriptor = dataset.descriptor.clone();
                let run_on_start = dataset.run_on_start;
                let trigger = self.trigger.clone();
                let metrics = self.metrics.clone();
                let shutdown = shutdown.clone();
                Some(tokio::spawn(async move {
                    tick_loop(descriptor, recurrence, run_on_start, trigger, metrics, shutdown).await
                }))
            })
            .collect()
    }
}

async fn tick_loop(
    descriptor: DatasetDescriptor,
    recurrence: Recurrence,
    run_on_start: bool,
    trigger: Arc<dyn Publisher>,
    metrics: PipelineMetrics,
    shutdown: Arc<Notify>,
) {
    let stop = shutdown.notified();
    tokio::pin!(stop);
    stop.as_mut().enable();

    info!(dataset = %descriptor.id, run_on_start, "schedule started");
    if run_on_start {
        let _ = tick(trigger.as_ref(), &metrics, &descriptor).await;
    }
    loop {
        let Some(delay) = recurrence.delay_after(Utc::now()) else {
            info!(dataset = %descriptor.id, "recurrence has no further ticks");
            break;
        };
        debug!(dataset = %descriptor.id, next_in_secs = delay.as_secs(), "next tick scheduled");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let _ = tick(trigger.as_ref(), &metrics, &descriptor).await;
            }
            _ = &mut stop => break,
        }
    }
    info!(dataset = %descriptor.id, "schedule stopped");
}

/// Publish once. Never retried.
async fn tick(
    trigger: &dyn Publisher,
    metrics: &PipelineMetrics,
    descriptor: &DatasetDescriptor,
) -> Result<String, PipelineError> {
    let result = async {
        let message = QueueMessage::new(trigger.topic(), &FetchRequest(descriptor.clone()))?
            .with_attribute("dataset_id", &descriptor.id);
        Ok::<_, PipelineError>(trigger.publish(message).await?)
    }
    .await;

    match &result {
        Ok(message_id) => {
            info!(dataset = %descriptor.id, message_id = %message_id, "fetch request published");
            metrics.record_tick(&descriptor.id, None).await;
        }
        Err(e) => {
            error!(dataset = %descriptor.id, error = %e, "fetch request publish failed");
            metrics.record_tick(&descriptor.id, Some(e.to_string())).await;
        }
    }
    result
}
