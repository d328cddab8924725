//! Dedup guard: at most one active job per file
//!
//! The file's index entry doubles as the lock. A worker claims a file with a
//! single insert-if-absent; the winner submits and then overwrites the claim
//! with the job id. Losers skip a recorded file and wait out an in-flight one.

use uuid::Uuid;

use crate::providers::StoreError;
use crate::storage::{FileEntry, JobStore};

/// Rounds of claim/lookup before giving up on a flapping entry
const MAX_CLAIM_ROUNDS: usize = 3;

/// A held claim; release it if the submission does not happen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub file_id: i64,
    pub token: String,
}

/// Who already holds a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExistingClaim {
    /// A job was recorded for the file
    Job(String),
    /// Submitted earlier but never recorded; waits for reconciliation
    Unrecorded(String),
    /// Another delivery is submitting it right now, or crashed doing so
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Acquired(Claim),
    AlreadyClaimed(ExistingClaim),
}

/// Claims files through the job store's index
#[derive(Clone)]
pub struct DedupGuard {
    jobs: JobStore,
}

impl DedupGuard {
    pub fn new(jobs: JobStore) -> Self {
        Self { jobs }
    }

    /// Try to become the only submitter for a file
    pub async fn try_claim(&self, file_id: i64) -> Result<ClaimOutcome, StoreError> {
        let token = Uuid::new_v4().to_string();

        for _ in 0..MAX_CLAIM_ROUNDS {
            if self.jobs.try_claim_file(file_id, &token).await? {
                tracing::debug!("Claimed file {} ({})", file_id, token);
                return Ok(ClaimOutcome::Acquired(Claim { file_id, token }));
            }

            // Lost the race; find out to whom. The entry may expire or be
            // released between the two calls, in which case we try again.
            match self.jobs.lookup_file(file_id).await? {
                Some(FileEntry::Job(job_id)) => {
                    return Ok(ClaimOutcome::AlreadyClaimed(ExistingClaim::Job(job_id)))
                }
                Some(FileEntry::Unrecorded(job_id)) => {
                    return Ok(ClaimOutcome::AlreadyClaimed(ExistingClaim::Unrecorded(
                        job_id,
                    )))
                }
                Some(FileEntry::Pending(_)) => {
                    return Ok(ClaimOutcome::AlreadyClaimed(ExistingClaim::InFlight))
                }
                None => continue,
            }
        }

        Err(StoreError::Conflict(format!(
            "index entry for file {} kept changing during claim",
            file_id
        )))
    }

    /// Give a claim back so a later delivery can retry the file
    pub async fn release(&self, claim: &Claim) -> Result<(), StoreError> {
        if !self.jobs.release_claim(claim.file_id, &claim.token).await? {
            tracing::warn!(
                "Claim on file {} was no longer held when releasing",
                claim.file_id
            );
        }
        Ok(())
    }
}
