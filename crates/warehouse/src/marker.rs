//! Per-table completion markers: what ran last, and what last succeeded.
//!
//! Readers of a table gate on `latest_attempt.state == Completed`, so a table
//! whose newest load is still running or has failed is never consumed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use datafeed_core::TableRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessRecord {
    pub job_id: String,
    /// Bumped on every successful replacement of the table.
    pub version: u64,
    pub completed_at: DateTime<Utc>,
    pub row_count: u64,
    /// SHA-256 of the table's Parquet encoding.
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub table: TableRef,
    pub latest_attempt: AttemptRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<SuccessRecord>,
}

/// Result of applying an attempt's outcome to a marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerUpdate {
    Applied,
    /// A newer attempt started since; its state was left alone.
    Superseded { newer_job_id: String },
}

impl CompletionMarker {
    /// Record that `job_id` started. The newest start always wins.
    pub fn begin(previous: Option<CompletionMarker>, table: &TableRef, job_id: &str, at: DateTime<Utc>) -> Self {
        let attempt = AttemptRecord {
            job_id: job_id.to_string(),
            started_at: at,
            state: JobState::Running,
            finished_at: None,
            error: None,
        };
        match previous {
            Some(mut marker) => {
                marker.latest_attempt = attempt;
                marker
            }
            None => CompletionMarker {
                table: table.clone(),
                latest_attempt: attempt,
                last_success: None,
            },
        }
    }

    /// Record that `job_id` completed with the given table contents.
    pub fn complete(
        &mut self,
        job_id: &str,
        at: DateTime<Utc>,
        row_count: u64,
        fingerprint: String,
    ) -> MarkerUpdate {
        if let Some(update) = self.superseded_by(job_id) {
            return update;
        }
        let version = self.version() + 1;
        self.latest_attempt.state = JobState::Completed;
        self.latest_attempt.finished_at = Some(at);
        self.latest_attempt.error = None;
        self.last_success = Some(SuccessRecord {
            job_id: job_id.to_string(),
            version,
            completed_at: at,
            row_count,
            fingerprint,
        });
        MarkerUpdate::Applied
    }

    pub fn fail(&mut self, job_id: &str, at: DateTime<Utc>, error: &str) -> MarkerUpdate {
        if let Some(update) = self.superseded_by(job_id) {
            return update;
        }
        self.latest_attempt.state = JobState::Failed;
        self.latest_attempt.finished_at = Some(at);
        self.latest_attempt.error = Some(error.to_string());
        MarkerUpdate::Applied
    }

    /// `Some` when an attempt other than `job_id` is now the newest.
    pub fn superseded_by(&self, job_id: &str) -> Option<MarkerUpdate> {
        (self.latest_attempt.job_id != job_id).then(|| MarkerUpdate::Superseded {
            newer_job_id: self.latest_attempt.job_id.clone(),
        })
    }

    pub fn is_completed(&self) -> bool {
        self.latest_attempt.state == JobState::Completed
    }

    /// Version of the last successful replacement, 0 if none.
    pub fn version(&self) -> u64 {
        self.last_success.as_ref().map_or(0, |s| s.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableRef {
        TableRef::new("census", "HOUSEHOLD_INCOME")
    }

    #[test]
    fn begin_then_complete_bumps_version() {
        let now = Utc::now();
        let mut m = CompletionMarker::begin(None, &table(), "job-1", now);
        assert_eq!(m.latest_attempt.state, JobState::Running);
        assert!(!m.is_completed());

        assert_eq!(m.complete("job-1", now, 10, "abc".into()), MarkerUpdate::Applied);
        assert!(m.is_completed());
        assert_eq!(m.version(), 1);

        let mut m = CompletionMarker::begin(Some(m), &table(), "job-2", now);
        assert!(!m.is_completed());
        // Last success survives a new attempt starting.
        assert_eq!(m.version(), 1);
        m.complete("job-2", now, 10, "abc".into());
        assert_eq!(m.version(), 2);
    }

    #[test]
    fn older_attempt_cannot_overwrite_newer() {
        let now = Utc::now();
        let m = CompletionMarker::begin(None, &table(), "job-old", now);
        let mut m = CompletionMarker::begin(Some(m), &table(), "job-new", now);

        let update = m.fail("job-old", now, "timeout");
        assert_eq!(
            update,
            MarkerUpdate::Superseded {
                newer_job_id: "job-new".into()
            }
        );
        assert_eq!(m.latest_attempt.state, JobState::Running);

        assert!(matches!(m.complete("job-old", now, 1, "x".into()), MarkerUpdate::Superseded { .. }));
        assert!(m.last_success.is_none());
    }

    #[test]
    fn failure_keeps_last_success_but_blocks_readers() {
        let now = Utc::now();
        let mut m = CompletionMarker::begin(None, &table(), "job-1", now);
        m.complete("job-1", now, 3, "f1".into());
        let mut m = CompletionMarker::begin(Some(m), &table(), "job-2", now);
        m.fail("job-2", now, "malformed input");

        assert!(!m.is_completed());
        assert_eq!(m.version(), 1);
        assert_eq!(m.latest_attempt.error.as_deref(), Some("malformed input"));
    }

    #[test]
    fn serializes_state_in_snake_case() {
        let m = CompletionMarker::begin(None, &table(), "job-1", Utc::now());
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["latest_attempt"]["state"], "running");
        assert!(json.get("last_success").is_none());
    }
}
