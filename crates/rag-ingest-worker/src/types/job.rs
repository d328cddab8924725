//! Job records tracked in the record store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::FileChangeEvent;

/// Lifecycle status of a parsing job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Submitted => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    /// Whether this status is final
    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic
    ///
    /// Re-applying the current status is allowed so that pollers can be
    /// idempotent.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        self == next || next.rank() > self.rank()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Rejected backwards status change
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("job {job_id}: cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub job_id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// What the parsing service said when the job was accepted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionInfo {
    /// Status reported by the parser at submission time (e.g. `queued`)
    pub initial_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Persistent record of a parsing job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job id assigned by the parsing service
    pub job_id: String,
    /// File the job was created for
    pub file_id: i64,
    pub tenant: String,
    /// Owner derived from the file path
    pub owner_uid: String,
    pub file_path: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub trace_id: String,
    /// Response metadata from the submission call
    #[serde(rename = "parser_response", default)]
    pub submission: SubmissionInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Advisory retry counter, maintained by out-of-band pollers
    #[serde(default)]
    pub retry_count: u32,
}

impl JobRecord {
    /// Create a freshly submitted job record for an event
    pub fn submitted(
        job_id: String,
        event: &FileChangeEvent,
        owner_uid: String,
        submission: SubmissionInfo,
    ) -> Self {
        Self {
            job_id,
            file_id: event.file.id,
            tenant: event.tenant.clone(),
            owner_uid,
            file_path: event.file.path.clone(),
            status: JobStatus::Submitted,
            submitted_at: Utc::now(),
            trace_id: event.trace_id.clone(),
            submission,
            error_message: None,
            retry_count: 0,
        }
    }

    /// Move the job to a new status, refusing backwards transitions
    pub fn transition(
        &mut self,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(status) {
            return Err(InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        if error_message.is_some() {
            self.error_message = error_message;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: JobStatus) -> JobRecord {
        JobRecord {
            job_id: "job-1".to_string(),
            file_id: 7,
            tenant: "acme".to_string(),
            owner_uid: "alice".to_string(),
            file_path: "/alice/files/a.pdf".to_string(),
            status,
            submitted_at: Utc::now(),
            trace_id: "t-1".to_string(),
            submission: SubmissionInfo::default(),
            error_message: None,
            retry_count: 0,
        }
    }

    #[test]
    fn test_forward_transitions() {
        let mut job = record(JobStatus::Submitted);
        job.transition(JobStatus::Processing, None).unwrap();
        job.transition(JobStatus::Failed, Some("ocr failed".into())).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("ocr failed"));
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut job = record(JobStatus::Completed);
        let err = job.transition(JobStatus::Processing, None).unwrap_err();
        assert_eq!(err.from, JobStatus::Completed);
        assert_eq!(job.status, JobStatus::Completed);

        // Terminal states do not flip into each other
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Processing));
    }

    #[test]
    fn test_serialized_shape() {
        let mut job = record(JobStatus::Submitted);
        job.submission = SubmissionInfo {
            initial_status: "queued".to_string(),
            message: None,
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "submitted");
        assert_eq!(value["parser_response"]["initial_status"], "queued");
        assert!(value.get("error_message").is_none());
    }
}
