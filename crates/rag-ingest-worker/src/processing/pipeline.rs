//! Per-message pipeline: decode → filter → claim → fetch → submit → persist

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::dedup::{Claim, ClaimOutcome, DedupGuard, ExistingClaim};
use crate::config::WorkerConfig;
use crate::ingestion::{decode_event, DecodeError, EventFilter, Ineligible};
use crate::providers::{
    FileStore, ParserService, RetrievalError, StoreError, SubmissionError, SubmissionMetadata,
    SubmissionReceipt, SubmissionRequest,
};
use crate::storage::JobStore;
use crate::types::{FileChangeEvent, JobRecord};

/// Why a message finished without a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Ineligible(Ineligible),
    AlreadyClaimed(ExistingClaim),
}

/// Successful end of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A parsing job was created and recorded
    Submitted { job_id: String },
    /// Nothing to do for this message
    Skipped(SkipReason),
}

/// How the consumption loop should settle a failed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Requeue with backoff, within the retry budget
    Retryable,
    /// Will never succeed; reject without requeue
    Terminal,
    /// Submitted but not recorded; must not be retried, needs an operator
    Reconcile,
}

/// Pipeline failures
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("undecodable message: {0}")]
    Decode(#[from] DecodeError),

    #[error("file {file_id} is claimed by another delivery")]
    ClaimHeld { file_id: i64 },

    #[error("dedup check for file {file_id} failed: {source}")]
    Dedup {
        file_id: i64,
        #[source]
        source: StoreError,
    },

    #[error("fetching file {file_id} failed: {source}")]
    Retrieval {
        file_id: i64,
        #[source]
        source: RetrievalError,
    },

    #[error("submitting file {file_id} failed: {source}")]
    Submission {
        file_id: i64,
        #[source]
        source: SubmissionError,
    },

    #[error("job {job_id} for file {file_id} was submitted but not recorded: {source}")]
    Persistence {
        job_id: String,
        file_id: i64,
        trace_id: String,
        #[source]
        source: StoreError,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("{0} interrupted by shutdown")]
    Cancelled(&'static str),
}

impl PipelineError {
    pub fn disposition(&self) -> Disposition {
        match self {
            PipelineError::Decode(_) => Disposition::Terminal,
            PipelineError::Dedup { .. } | PipelineError::ClaimHeld { .. } => {
                Disposition::Retryable
            }
            PipelineError::Retrieval { source, .. } if source.is_retryable() => {
                Disposition::Retryable
            }
            PipelineError::Retrieval { .. } => Disposition::Terminal,
            PipelineError::Submission { source, .. } if source.is_retryable() => {
                Disposition::Retryable
            }
            PipelineError::Submission { source, .. } if source.may_have_created_job() => {
                Disposition::Reconcile
            }
            PipelineError::Submission { .. } => Disposition::Terminal,
            PipelineError::Persistence { .. } => Disposition::Reconcile,
            PipelineError::Timeout { .. } | PipelineError::Cancelled(_) => Disposition::Retryable,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled(_))
    }

    /// Another delivery holds the file; retrying later does not spend the
    /// retry budget since the claim lease bounds the wait
    pub fn is_claim_held(&self) -> bool {
        matches!(self, PipelineError::ClaimHeld { .. })
    }
}

/// Limits applied to a single message
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Largest accepted file in bytes (inclusive)
    pub max_file_size: u64,
    pub fetch_timeout: Duration,
    pub submit_timeout: Duration,
    /// Owner recorded when the path has no user segment
    pub default_owner: String,
}

impl PipelineSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_file_size: config.file_store.max_file_size,
            fetch_timeout: config.file_store.timeout(),
            submit_timeout: config.parser.timeout(),
            default_owner: config.file_store.user.clone(),
        }
    }
}

/// Run a step under a deadline, abandoning it when shutdown starts
async fn guarded<T, E, F>(
    operation: &'static str,
    limit: Duration,
    cancel: &CancellationToken,
    step: F,
) -> Result<Result<T, E>, PipelineError>
where
    F: Future<Output = Result<T, E>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled(operation)),
        result = tokio::time::timeout(limit, step) => result.map_err(|_| PipelineError::Timeout {
            operation,
            timeout: limit,
        }),
    }
}

/// Processes one file-change message end to end
pub struct JobPipeline {
    filter: EventFilter,
    guard: DedupGuard,
    jobs: JobStore,
    files: Arc<dyn FileStore>,
    parser: Arc<dyn ParserService>,
    settings: PipelineSettings,
}

impl JobPipeline {
    pub fn new(
        jobs: JobStore,
        files: Arc<dyn FileStore>,
        parser: Arc<dyn ParserService>,
        filter: EventFilter,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            filter,
            guard: DedupGuard::new(jobs.clone()),
            jobs,
            files,
            parser,
            settings,
        }
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn files(&self) -> &Arc<dyn FileStore> {
        &self.files
    }

    pub fn parser(&self) -> &Arc<dyn ParserService> {
        &self.parser
    }

    /// Decode a raw payload and process it
    pub async fn process_message(
        &self,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Outcome, PipelineError> {
        let event = decode_event(payload)?;
        self.process_event(&event, cancel).await
    }

    /// Process a decoded event
    pub async fn process_event(
        &self,
        event: &FileChangeEvent,
        cancel: &CancellationToken,
    ) -> Result<Outcome, PipelineError> {
        let span = tracing::info_span!(
            "message",
            trace_id = %event.trace_id,
            event_id = %event.event_id,
            file_id = event.file.id,
        );
        self.run(event, cancel).instrument(span).await
    }

    async fn run(
        &self,
        event: &FileChangeEvent,
        cancel: &CancellationToken,
    ) -> Result<Outcome, PipelineError> {
        let file_id = event.file.id;

        if let Err(reason) = self.filter.check(event) {
            tracing::debug!("Skipping file {} (trace {}): {}", file_id, event.trace_id, reason);
            return Ok(Outcome::Skipped(SkipReason::Ineligible(reason)));
        }

        // The claim is not raced against shutdown: dropping it mid-write
        // would strand the lease.
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled("claim"));
        }
        let claim = match self
            .guard
            .try_claim(file_id)
            .await
            .map_err(|source| PipelineError::Dedup { file_id, source })?
        {
            ClaimOutcome::Acquired(claim) => claim,
            ClaimOutcome::AlreadyClaimed(ExistingClaim::InFlight) => {
                tracing::debug!("File {} is claimed by another delivery, deferring", file_id);
                return Err(PipelineError::ClaimHeld { file_id });
            }
            ClaimOutcome::AlreadyClaimed(existing) => {
                match &existing {
                    ExistingClaim::Job(job_id) => {
                        tracing::debug!("File {} already has job {}, skipping", file_id, job_id)
                    }
                    ExistingClaim::Unrecorded(job_id) => tracing::debug!(
                        "File {} awaits reconciliation (job '{}'), skipping",
                        file_id,
                        job_id
                    ),
                    ExistingClaim::InFlight => {}
                }
                return Ok(Outcome::Skipped(SkipReason::AlreadyClaimed(existing)));
            }
        };

        let receipt = match self.fetch_and_submit(event, cancel).await {
            Ok(receipt) => receipt,
            Err(e) if e.disposition() == Disposition::Reconcile => {
                self.mark_unrecorded(file_id, "").await;
                return Err(e);
            }
            Err(e) => {
                self.release(&claim).await;
                return Err(e);
            }
        };

        let owner = event
            .file
            .owner()
            .unwrap_or(&self.settings.default_owner)
            .to_string();
        let record = JobRecord::submitted(receipt.job_id.clone(), event, owner, receipt.info());

        // Persistence runs to completion even during shutdown; the record
        // store bounds each round trip itself.
        if let Err(source) = self.jobs.save_job(&record).await {
            self.mark_unrecorded(file_id, &record.job_id).await;
            return Err(PipelineError::Persistence {
                job_id: record.job_id,
                file_id,
                trace_id: event.trace_id.clone(),
                source,
            });
        }

        tracing::info!(
            "Recorded job {} for file {} ({}), trace {}",
            record.job_id,
            file_id,
            event.file.path,
            event.trace_id
        );
        Ok(Outcome::Submitted {
            job_id: record.job_id,
        })
    }

    async fn fetch_and_submit(
        &self,
        event: &FileChangeEvent,
        cancel: &CancellationToken,
    ) -> Result<SubmissionReceipt, PipelineError> {
        let file = &event.file;
        let limit = self.settings.max_file_size;

        if file.size > limit {
            return Err(PipelineError::Retrieval {
                file_id: file.id,
                source: RetrievalError::TooLarge {
                    size: file.size,
                    limit,
                },
            });
        }

        tracing::info!("Fetching file {} ({} bytes declared)", file.id, file.size);
        let content = guarded(
            "file fetch",
            self.settings.fetch_timeout,
            cancel,
            self.files.fetch(file, limit),
        )
        .await?
        .map_err(|source| PipelineError::Retrieval {
            file_id: file.id,
            source,
        })?;

        if content.len() as u64 > limit {
            return Err(PipelineError::Retrieval {
                file_id: file.id,
                source: RetrievalError::TooLarge {
                    size: content.len() as u64,
                    limit,
                },
            });
        }

        let request = SubmissionRequest {
            content: &content,
            filename: file.filename(),
            media_type: &file.media_type,
            metadata: SubmissionMetadata::from_event(event),
        };
        guarded(
            "parser submission",
            self.settings.submit_timeout,
            cancel,
            self.parser.submit(request),
        )
        .await?
        .map_err(|source| PipelineError::Submission {
            file_id: file.id,
            source,
        })
    }

    async fn mark_unrecorded(&self, file_id: i64, job_id: &str) {
        if let Err(e) = self.jobs.mark_unrecorded(file_id, job_id).await {
            tracing::warn!(
                "Failed to mark file {} as unrecorded: {} (claim expires on its own)",
                file_id,
                e
            );
        }
    }

    async fn release(&self, claim: &Claim) {
        if let Err(e) = self.guard.release(claim).await {
            tracing::warn!(
                "Failed to release claim on file {}: {} (expires on its own)",
                claim.file_id,
                e
            );
        }
    }
}
