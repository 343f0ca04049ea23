//! Re-wrap job record and its state transitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::protocol::{JobErrorResponse, JobResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a job: `running → {completed | failed | cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A per-artifact failure kept for manual remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFailure {
    pub artifact_id: String,
    pub error: String,
    pub retryable: bool,
}

/// Progress record of one re-wrap job.
///
/// `processed == succeeded + failed`. Artifacts already at the target version
/// are counted in `skipped` and are not part of `processed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewrapJob {
    pub id: Uuid,
    pub tenant_id: String,
    /// Lowest TMK version a migrated artifact was wrapped under. Starts at
    /// the version preceding the target.
    pub source_version: u32,
    pub target_version: u32,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Last artifact id whose outcome has been recorded.
    pub cursor: Option<String>,
    /// Set when the job stopped for a reason not tied to one artifact.
    pub job_error: Option<String>,
    pub errors: Vec<ArtifactFailure>,
}

impl RewrapJob {
    pub fn new(tenant_id: impl Into<String>, source_version: u32, target_version: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            source_version,
            target_version,
            status: JobStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            total: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            cursor: None,
            job_error: None,
            errors: Vec::new(),
        }
    }

    /// Count a migrated artifact that was wrapped under `from_version`.
    pub(crate) fn record_success(&mut self, artifact_id: &str, from_version: u32) {
        self.source_version = self.source_version.min(from_version);
        self.processed += 1;
        self.succeeded += 1;
        self.cursor = Some(artifact_id.to_owned());
    }

    pub(crate) fn record_skip(&mut self, artifact_id: &str) {
        self.skipped += 1;
        self.cursor = Some(artifact_id.to_owned());
    }

    /// Count a failure and keep its detail while fewer than `max_errors` are held.
    pub(crate) fn record_failure(&mut self, failure: ArtifactFailure, max_errors: usize) {
        self.processed += 1;
        self.failed += 1;
        self.cursor = Some(failure.artifact_id.clone());
        if self.errors.len() < max_errors {
            self.errors.push(failure);
        }
    }

    /// Close the job. A cancelled job stays cancelled; otherwise it completes
    /// only if no artifact failed and no job-level error occurred.
    pub(crate) fn finish(&mut self) {
        if self.status == JobStatus::Running {
            self.status = if self.failed == 0 && self.job_error.is_none() {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
        }
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }

    pub(crate) fn abort(&mut self, error: impl fmt::Display) {
        self.job_error = Some(error.to_string());
        self.finish();
    }
}

impl From<&RewrapJob> for JobResponse {
    fn from(job: &RewrapJob) -> Self {
        Self {
            id: job.id,
            tenant_id: job.tenant_id.clone(),
            source_version: job.source_version,
            target_version: job.target_version,
            status: job.status.as_str().to_owned(),
            started_at: job.started_at,
            completed_at: job.completed_at,
            total: job.total,
            processed: job.processed,
            succeeded: job.succeeded,
            failed: job.failed,
            skipped: job.skipped,
            cursor: job.cursor.clone(),
            job_error: job.job_error.clone(),
            errors: job
                .errors
                .iter()
                .map(|e| JobErrorResponse {
                    artifact_id: e.artifact_id.clone(),
                    error: e.error.clone(),
                    retryable: e.retryable,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(id: &str) -> ArtifactFailure {
        ArtifactFailure {
            artifact_id: id.into(),
            error: "transient KMS failure".into(),
            retryable: true,
        }
    }

    #[test]
    fn counters_stay_consistent() {
        let mut job = RewrapJob::new("acme", 1, 2);
        job.record_success("a", 1);
        job.record_failure(failure("b"), 10);
        job.record_skip("c");
        assert_eq!(job.processed, job.succeeded + job.failed);
        assert_eq!(job.skipped, 1);
        assert_eq!(job.cursor.as_deref(), Some("c"));
    }

    #[test]
    fn source_version_tracks_oldest_migrated_artifact() {
        let mut job = RewrapJob::new("acme", 2, 3);
        job.record_success("a", 2);
        job.record_success("b", 1);
        job.record_success("c", 2);
        assert_eq!(job.source_version, 1);
    }

    #[test]
    fn error_list_is_bounded() {
        let mut job = RewrapJob::new("acme", 1, 2);
        for i in 0..5 {
            job.record_failure(failure(&format!("a{i}")), 3);
        }
        assert_eq!(job.failed, 5);
        assert_eq!(job.errors.len(), 3);
    }

    #[test]
    fn finish_completes_without_failures() {
        let mut job = RewrapJob::new("acme", 1, 2);
        job.record_success("a", 1);
        job.record_skip("b");
        job.finish();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn finish_fails_with_any_failure() {
        let mut job = RewrapJob::new("acme", 1, 2);
        job.record_success("a", 1);
        job.record_failure(failure("b"), 10);
        job.finish();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn abort_records_job_error() {
        let mut job = RewrapJob::new("acme", 1, 2);
        job.abort("page fetch failed");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.job_error.as_deref(), Some("page fetch failed"));
    }

    #[test]
    fn cancelled_survives_finish() {
        let mut job = RewrapJob::new("acme", 1, 2);
        job.status = JobStatus::Cancelled;
        job.finish();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn response_carries_status_string() {
        let job = RewrapJob::new("acme", 1, 2);
        let resp = JobResponse::from(&job);
        assert_eq!(resp.status, "running");
        assert_eq!(resp.target_version, 2);
    }
}
