//! Job records and the file → job dedup index
//!
//! Key families:
//! - `job:<job_id>` holds the serialized [`JobRecord`]
//! - `file:<file_id>` holds either the job id, a claim marker
//!   `pending:<token>` while a submission is in flight, or
//!   `reconcile:<job_id>` when the parser may hold a job that was never
//!   recorded
//!
//! Both entries of a persisted job carry the same expiry.

use std::sync::Arc;
use std::time::Duration;

use crate::config::RecordStoreConfig;
use crate::providers::{RecordStore, StoreError};
use crate::types::{JobRecord, JobStatus};

/// Value prefix marking an in-flight claim in the dedup index
pub const CLAIM_PREFIX: &str = "pending:";

/// Value prefix marking a submission that could not be recorded
pub const UNRECORDED_PREFIX: &str = "reconcile:";

const JOB_PREFIX: &str = "job:";
const FILE_PREFIX: &str = "file:";

pub fn job_key(job_id: &str) -> String {
    format!("{}{}", JOB_PREFIX, job_id)
}

pub fn file_key(file_id: i64) -> String {
    format!("{}{}", FILE_PREFIX, file_id)
}

/// What the dedup index holds for a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEntry {
    /// A job was submitted and recorded
    Job(String),
    /// A worker holds the claim; the payload is the claim token
    Pending(String),
    /// Submitted but not recorded; the payload is the job id, empty when the
    /// parser did not return a usable one
    Unrecorded(String),
}

impl FileEntry {
    fn parse(raw: String) -> Self {
        if let Some(token) = raw.strip_prefix(CLAIM_PREFIX) {
            return FileEntry::Pending(token.to_string());
        }
        if let Some(job_id) = raw.strip_prefix(UNRECORDED_PREFIX) {
            return FileEntry::Unrecorded(job_id.to_string());
        }
        FileEntry::Job(raw)
    }
}

/// Job repository
#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn RecordStore>,
    job_ttl: Duration,
    claim_ttl: Duration,
}

impl JobStore {
    pub fn new(store: Arc<dyn RecordStore>, job_ttl: Duration, claim_ttl: Duration) -> Self {
        Self {
            store,
            job_ttl,
            claim_ttl,
        }
    }

    pub fn from_config(store: Arc<dyn RecordStore>, config: &RecordStoreConfig) -> Self {
        Self::new(store, config.job_ttl(), config.claim_ttl())
    }

    pub fn job_ttl(&self) -> Duration {
        self.job_ttl
    }

    /// Persist a job record and point the dedup index at it
    ///
    /// The record is written first so the index never refers to a missing
    /// job. Overwrites any claim marker on the file.
    pub async fn save_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(job).map_err(|e| StoreError::Corrupt {
            key: job_key(&job.job_id),
            message: e.to_string(),
        })?;

        self.store
            .set(&job_key(&job.job_id), &payload, self.job_ttl)
            .await?;
        self.store
            .set(&file_key(job.file_id), &job.job_id, self.job_ttl)
            .await?;

        tracing::debug!("Saved job {} for file {}", job.job_id, job.file_id);
        Ok(())
    }

    /// Load a job record by id
    pub async fn get_job(&self, job_id: &str) -> Result<JobRecord, StoreError> {
        let key = job_key(job_id);
        let raw = self.store.get(&key).await?;
        serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
            key,
            message: e.to_string(),
        })
    }

    /// Read the dedup index entry for a file
    pub async fn lookup_file(&self, file_id: i64) -> Result<Option<FileEntry>, StoreError> {
        match self.store.get(&file_key(file_id)).await {
            Ok(raw) => Ok(Some(FileEntry::parse(raw))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Load the job recorded for a file
    ///
    /// Fails with `NotFound` while the file is only claimed.
    pub async fn get_job_by_file(&self, file_id: i64) -> Result<JobRecord, StoreError> {
        match self.lookup_file(file_id).await? {
            Some(FileEntry::Job(job_id)) => self.get_job(&job_id).await,
            Some(FileEntry::Pending(_)) | Some(FileEntry::Unrecorded(_)) | None => {
                Err(StoreError::NotFound(file_key(file_id)))
            }
        }
    }

    /// Atomically claim a file for submission
    ///
    /// Returns `true` when this caller now holds the claim. The claim expires
    /// after the claim lease if its holder disappears.
    pub async fn try_claim_file(&self, file_id: i64, token: &str) -> Result<bool, StoreError> {
        let marker = format!("{}{}", CLAIM_PREFIX, token);
        self.store
            .set_if_absent(&file_key(file_id), &marker, self.claim_ttl)
            .await
    }

    /// Replace a file's entry with an unrecorded-submission marker
    ///
    /// Keeps later deliveries from submitting the file again for the full
    /// job lifetime while an operator reconciles it.
    pub async fn mark_unrecorded(&self, file_id: i64, job_id: &str) -> Result<(), StoreError> {
        let marker = format!("{}{}", UNRECORDED_PREFIX, job_id);
        self.store
            .set(&file_key(file_id), &marker, self.job_ttl)
            .await
    }

    /// Drop a claim, only if it is still ours
    pub async fn release_claim(&self, file_id: i64, token: &str) -> Result<bool, StoreError> {
        let marker = format!("{}{}", CLAIM_PREFIX, token);
        self.store
            .delete_if_equals(&file_key(file_id), &marker)
            .await
    }

    /// Move a job to a new status
    ///
    /// Backwards transitions fail with `StoreError::Conflict`. The write
    /// renews the record's expiry, and the index entry's when it still points
    /// at this job.
    pub async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<JobRecord, StoreError> {
        let mut job = self.get_job(job_id).await?;
        job.transition(status, error_message)
            .map_err(|e| StoreError::Conflict(e.to_string()))?;

        let payload = serde_json::to_string(&job).map_err(|e| StoreError::Corrupt {
            key: job_key(job_id),
            message: e.to_string(),
        })?;
        self.store
            .set(&job_key(job_id), &payload, self.job_ttl)
            .await?;

        if self.lookup_file(job.file_id).await? == Some(FileEntry::Job(job_id.to_string())) {
            self.store
                .set(&file_key(job.file_id), job_id, self.job_ttl)
                .await?;
        }

        tracing::debug!("Job {} moved to {}", job_id, job.status);
        Ok(job)
    }

    /// Remove a job and, if it still points here, its index entry
    pub async fn delete_job(&self, job_id: &str) -> Result<(), StoreError> {
        let job = self.get_job(job_id).await?;
        self.store.delete(&job_key(job_id)).await?;
        self.store
            .delete_if_equals(&file_key(job.file_id), job_id)
            .await?;
        Ok(())
    }

    /// Ids of all live jobs
    pub async fn list_jobs(&self) -> Result<Vec<String>, StoreError> {
        let keys = self.store.list_keys(JOB_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(JOB_PREFIX).map(str::to_string))
            .collect())
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.store.health_check().await
    }

    pub fn backend_name(&self) -> &str {
        self.store.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::InMemoryRecordStore;
    use crate::types::SubmissionInfo;
    use chrono::Utc;

    const HOUR: Duration = Duration::from_secs(3600);

    fn store() -> (Arc<InMemoryRecordStore>, JobStore) {
        let backend = Arc::new(InMemoryRecordStore::new());
        let jobs = JobStore::new(backend.clone(), HOUR * 24, Duration::from_secs(600));
        (backend, jobs)
    }

    fn job(job_id: &str, file_id: i64) -> JobRecord {
        JobRecord {
            job_id: job_id.to_string(),
            file_id,
            tenant: "acme".into(),
            owner_uid: "alice".into(),
            file_path: "/alice/files/a.pdf".into(),
            status: JobStatus::Submitted,
            submitted_at: Utc::now(),
            trace_id: "t-1".into(),
            submission: SubmissionInfo {
                initial_status: "queued".into(),
                message: None,
            },
            error_message: None,
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn test_save_and_lookup() {
        let (_, jobs) = store();
        jobs.save_job(&job("job-abc", 42)).await.unwrap();

        assert_eq!(
            jobs.lookup_file(42).await.unwrap(),
            Some(FileEntry::Job("job-abc".into()))
        );
        let loaded = jobs.get_job_by_file(42).await.unwrap();
        assert_eq!(loaded.job_id, "job-abc");
        assert_eq!(loaded.submission.initial_status, "queued");
        assert_eq!(jobs.list_jobs().await.unwrap(), vec!["job-abc"]);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_and_replaced_by_save() {
        let (_, jobs) = store();
        assert!(jobs.try_claim_file(7, "tok-a").await.unwrap());
        assert!(!jobs.try_claim_file(7, "tok-b").await.unwrap());
        assert_eq!(
            jobs.lookup_file(7).await.unwrap(),
            Some(FileEntry::Pending("tok-a".into()))
        );
        assert!(jobs.get_job_by_file(7).await.unwrap_err().is_not_found());

        jobs.save_job(&job("job-1", 7)).await.unwrap();
        // A stale release after persistence must not drop the index
        assert!(!jobs.release_claim(7, "tok-a").await.unwrap());
        assert_eq!(
            jobs.lookup_file(7).await.unwrap(),
            Some(FileEntry::Job("job-1".into()))
        );
    }

    #[tokio::test]
    async fn test_release_only_own_claim() {
        let (_, jobs) = store();
        jobs.try_claim_file(7, "tok-a").await.unwrap();
        assert!(!jobs.release_claim(7, "tok-b").await.unwrap());
        assert!(jobs.release_claim(7, "tok-a").await.unwrap());
        assert_eq!(jobs.lookup_file(7).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unrecorded_marker_replaces_claim() {
        let (_, jobs) = store();
        jobs.try_claim_file(9, "tok-a").await.unwrap();
        jobs.mark_unrecorded(9, "job-lost").await.unwrap();

        assert_eq!(
            jobs.lookup_file(9).await.unwrap(),
            Some(FileEntry::Unrecorded("job-lost".into()))
        );
        assert!(!jobs.try_claim_file(9, "tok-b").await.unwrap());
        assert!(!jobs.release_claim(9, "tok-a").await.unwrap());
        assert!(jobs.get_job_by_file(9).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_status_is_monotonic() {
        let (_, jobs) = store();
        jobs.save_job(&job("job-1", 1)).await.unwrap();

        let updated = jobs
            .update_status("job-1", JobStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Completed);

        let err = jobs
            .update_status("job-1", JobStatus::Processing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(
            jobs.get_job("job-1").await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_delete_keeps_newer_index_entry() {
        let (backend, jobs) = store();
        jobs.save_job(&job("job-old", 3)).await.unwrap();
        jobs.save_job(&job("job-new", 3)).await.unwrap();

        jobs.delete_job("job-old").await.unwrap();
        assert_eq!(
            jobs.lookup_file(3).await.unwrap(),
            Some(FileEntry::Job("job-new".into()))
        );

        jobs.delete_job("job-new").await.unwrap();
        assert_eq!(jobs.lookup_file(3).await.unwrap(), None);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_record() {
        let (backend, jobs) = store();
        backend.set("job:bad", "{not json", HOUR).await.unwrap();
        assert!(matches!(
            jobs.get_job("bad").await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}
