//! Parsing service provider trait

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{FileChangeEvent, SubmissionInfo};

/// Parsing service failures
#[derive(Debug, Clone, Error)]
pub enum SubmissionError {
    /// Connection failure or timeout before a response arrived
    #[error("parser request failed: {0}")]
    Transport(String),

    /// The service answered with a non-success status
    #[error("parser returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The service answered 2xx but the body was unusable
    #[error("invalid parser response: {0}")]
    InvalidResponse(String),

    /// Status or result lookup for an unknown job
    #[error("job not found: {0}")]
    JobNotFound(String),
}

impl SubmissionError {
    /// Whether a later attempt may succeed
    ///
    /// Transport failures, server errors, request timeouts and rate limiting
    /// are retryable. Any other 4xx means the request itself is at fault.
    pub fn is_retryable(&self) -> bool {
        match self {
            SubmissionError::Transport(_) => true,
            SubmissionError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            SubmissionError::InvalidResponse(_) | SubmissionError::JobNotFound(_) => false,
        }
    }

    /// The service answered with success but the reply was unusable, so a
    /// job may exist on its side
    pub fn may_have_created_job(&self) -> bool {
        matches!(self, SubmissionError::InvalidResponse(_))
    }
}

/// Context forwarded with every submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionMetadata {
    pub tenant: String,
    pub file_id: i64,
    pub file_path: String,
    pub trace_id: String,
    pub event_id: String,
}

impl SubmissionMetadata {
    pub fn from_event(event: &FileChangeEvent) -> Self {
        Self {
            tenant: event.tenant.clone(),
            file_id: event.file.id,
            file_path: event.file.path.clone(),
            trace_id: event.trace_id.clone(),
            event_id: event.event_id.clone(),
        }
    }
}

/// A file to submit for parsing
#[derive(Debug, Clone)]
pub struct SubmissionRequest<'a> {
    pub content: &'a [u8],
    pub filename: &'a str,
    pub media_type: &'a str,
    pub metadata: SubmissionMetadata,
}

/// Job descriptor returned by the parsing service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub job_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SubmissionReceipt {
    /// Typed metadata kept on the job record
    pub fn info(&self) -> SubmissionInfo {
        SubmissionInfo {
            initial_status: self.status.clone(),
            message: self.message.clone(),
        }
    }
}

/// Trait for the external parsing service
///
/// Only `submit` is used by the ingestion pipeline; the lookups serve status
/// pollers and operational tooling.
#[async_trait]
pub trait ParserService: Send + Sync {
    /// Submit file content and create a parsing job
    async fn submit(
        &self,
        request: SubmissionRequest<'_>,
    ) -> Result<SubmissionReceipt, SubmissionError>;

    /// Current status of a job
    async fn get_status(&self, job_id: &str) -> Result<SubmissionReceipt, SubmissionError>;

    /// Result document of a finished job
    async fn get_result(&self, job_id: &str) -> Result<serde_json::Value, SubmissionError>;

    /// Check if the service is reachable
    async fn health_check(&self) -> Result<(), SubmissionError>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
