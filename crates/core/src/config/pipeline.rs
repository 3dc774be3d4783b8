use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dataset::{DatasetDescriptor, ObjectTarget};
use crate::error::CoreError;
use crate::schedule::{parse_duration, Recurrence};

/// Pipeline topology: which datasets are fetched and which tables are derived.
///
/// ```toml
/// [[datasets]]
/// id = "HOUSEHOLD_INCOME"
/// url = "https://api.census.gov/data/timeseries/poverty/saipe"
/// gcs_bucket = "landing"
/// filename = "SAIPE"
/// every = "24h"
///
/// [[joins]]
/// name = "income_with_population"
/// depends_on = ["HOUSEHOLD_INCOME", "POPULATION"]
/// on = ["state", "county"]
/// stale_after = "36h"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub datasets: Vec<DatasetConfig>,
    #[serde(default)]
    pub joins: Vec<JoinConfig>,
}

/// One `[[datasets]]` entry: descriptor fields plus its recurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    pub gcs_bucket: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub fileprefix: Option<String>,
    /// Fixed period, e.g. `"6h"`.
    #[serde(default)]
    pub every: Option<String>,
    /// Cron expression, 5 or 6 fields.
    #[serde(default)]
    pub cron: Option<String>,
    /// Fire one tick immediately at startup.
    #[serde(default)]
    pub run_on_start: bool,
    /// Columns loaded as text regardless of what autodetection infers,
    /// e.g. FIPS codes whose leading zeros matter.
    #[serde(default)]
    pub string_columns: Vec<String>,
}

impl DatasetConfig {
    pub fn descriptor(&self) -> Result<DatasetDescriptor, CoreError> {
        let target = match (&self.filename, &self.fileprefix) {
            (Some(name), None) => ObjectTarget::Exact(name.clone()),
            (None, Some(prefix)) => ObjectTarget::Prefix(prefix.clone()),
            _ => {
                return Err(CoreError::InvalidDescriptor(format!(
                    "dataset '{}' must set exactly one of filename or fileprefix",
                    self.id
                )))
            }
        };
        DatasetDescriptor::new(&self.id, self.url.clone(), &self.gcs_bucket, target)
    }

    /// Resolve the recurrence. Datasets with neither `every` nor `cron` are
    /// only fetched on manual trigger.
    pub fn recurrence(&self) -> Result<Option<Recurrence>, CoreError> {
        match (&self.every, &self.cron) {
            (Some(_), Some(_)) => Err(CoreError::Config(format!(
                "dataset '{}' sets both every and cron",
                self.id
            ))),
            (Some(every), None) => Recurrence::every(every).map(Some),
            (None, Some(cron)) => Recurrence::cron(cron).map(Some),
            (None, None) => Ok(None),
        }
    }
}

/// One `[[joins]]` entry: a derived table gated on its source tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Derived table name.
    pub name: String,
    /// Dataset ids whose tables must be loaded first (two or more).
    pub depends_on: Vec<String>,
    /// Equi-join key columns present in every dependency.
    pub on: Vec<String>,
    /// Report the task as stale after waiting this long.
    #[serde(default)]
    pub stale_after: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

impl JoinConfig {
    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after.as_deref().and_then(parse_duration)
    }
}

impl PipelineConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, CoreError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn dataset(&self, id: &str) -> Option<&DatasetConfig> {
        self.datasets.iter().find(|d| d.id == id)
    }

    /// Apply environment variable overrides.
    ///
    /// - `DATAFEED_LANDING_BUCKET` replaces every dataset's `gcs_bucket`
    /// - `DATAFEED_RUN_ON_START=true` fires all datasets at startup
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(bucket) = std::env::var("DATAFEED_LANDING_BUCKET") {
            if !bucket.is_empty() {
                for ds in &mut self.datasets {
                    ds.gcs_bucket = bucket.clone();
                }
            }
        }
        if std::env::var("DATAFEED_RUN_ON_START").is_ok_and(|v| v == "true") {
            for ds in &mut self.datasets {
                ds.run_on_start = true;
            }
        }
    }
}
