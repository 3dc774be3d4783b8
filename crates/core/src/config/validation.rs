use std::collections::HashSet;

use super::pipeline::PipelineConfig;
use crate::error::CoreError;

impl PipelineConfig {
    /// Validate the topology: unique names, well-formed descriptors and
    /// recurrences, and joins that reference known datasets.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.validate_datasets()?;
        self.validate_joins()?;
        Ok(())
    }

    fn validate_datasets(&self) -> Result<(), CoreError> {
        let mut seen = HashSet::new();
        for ds in &self.datasets {
            if !seen.insert(ds.id.as_str()) {
                return Err(CoreError::Config(format!("duplicate dataset id '{}'", ds.id)));
            }
            ds.descriptor()?;
            ds.recurrence()?;
        }
        Ok(())
    }

    fn validate_joins(&self) -> Result<(), CoreError> {
        let dataset_ids: HashSet<&str> = self.datasets.iter().map(|d| d.id.as_str()).collect();
        let mut names = HashSet::new();
        for join in &self.joins {
            if !names.insert(join.name.as_str()) {
                return Err(CoreError::Config(format!("duplicate join name '{}'", join.name)));
            }
            if dataset_ids.contains(join.name.as_str()) {
                return Err(CoreError::Config(format!(
                    "join '{}' would overwrite the dataset table of the same name",
                    join.name
                )));
            }
            if join.depends_on.len() < 2 {
                return Err(CoreError::Config(format!(
                    "join '{}' needs at least two dependencies",
                    join.name
                )));
            }
            for dep in &join.depends_on {
                if !dataset_ids.contains(dep.as_str()) {
                    return Err(CoreError::Config(format!(
                        "join '{}' depends on unknown dataset '{dep}'",
                        join.name
                    )));
                }
            }
            if join.on.is_empty() {
                return Err(CoreError::Config(format!(
                    "join '{}' has no key columns",
                    join.name
                )));
            }
            if join.max_attempts == 0 {
                return Err(CoreError::Config(format!(
                    "join '{}' max_attempts must be at least 1",
                    join.name
                )));
            }
            if join.stale_after.is_some() && join.stale_after().is_none() {
                return Err(CoreError::Config(format!(
                    "join '{}' has an invalid stale_after",
                    join.name
                )));
            }
        }
        Ok(())
    }
}
