//! Test doubles for the external collaborators

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::providers::{
    FileStore, InMemoryRecordStore, ParserService, RecordStore, RetrievalError, StoreError,
    SubmissionError, SubmissionMetadata, SubmissionReceipt, SubmissionRequest,
};
use crate::types::FileRef;

/// Serialized file-change event as the publisher sends it
pub fn event_json(kind: &str, file_id: i64, path: &str, size: u64, media_type: &str) -> Vec<u8> {
    serde_json::json!({
        "trace_id": format!("trace-{}", file_id),
        "event_id": format!("event-{}", file_id),
        "type": kind,
        "tenant": "acme",
        "file": {
            "id": file_id,
            "path": path,
            "name": path.rsplit('/').next().unwrap_or(path),
            "size": size,
            "mimetype": media_type,
        },
        "received_at": "2024-05-01T10:00:00Z",
    })
    .to_string()
    .into_bytes()
}

/// File store returning fixed content (or a fixed error), counting calls
pub struct CountingFileStore {
    result: Result<Vec<u8>, RetrievalError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl CountingFileStore {
    pub fn with_content(content: Vec<u8>) -> Self {
        Self {
            result: Ok(content),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: RetrievalError) -> Self {
        Self {
            result: Err(error),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileStore for CountingFileStore {
    async fn fetch(&self, _file: &FileRef, _max_size: u64) -> Result<Vec<u8>, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone()
    }

    async fn health_check(&self) -> Result<(), RetrievalError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// What a fake parser saw
#[derive(Debug, Clone)]
pub struct SeenSubmission {
    pub content_len: usize,
    pub filename: String,
    pub metadata: SubmissionMetadata,
}

/// Parser handing out job ids in order, or failing every call
pub struct CountingParser {
    job_ids: Mutex<VecDeque<String>>,
    error: Option<SubmissionError>,
    seen: Mutex<Vec<SeenSubmission>>,
}

impl CountingParser {
    pub fn accepting<I, S>(job_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            job_ids: Mutex::new(job_ids.into_iter().map(Into::into).collect()),
            error: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: SubmissionError) -> Self {
        Self {
            job_ids: Mutex::new(VecDeque::new()),
            error: Some(error),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn requests(&self) -> Vec<SeenSubmission> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ParserService for CountingParser {
    async fn submit(
        &self,
        request: SubmissionRequest<'_>,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        self.seen.lock().push(SeenSubmission {
            content_len: request.content.len(),
            filename: request.filename.to_string(),
            metadata: request.metadata.clone(),
        });
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        let job_id = self
            .job_ids
            .lock()
            .pop_front()
            .ok_or_else(|| SubmissionError::Status {
                status: 500,
                body: "no job ids left".into(),
            })?;
        Ok(SubmissionReceipt {
            job_id,
            status: "queued".into(),
            message: None,
        })
    }

    async fn get_status(&self, job_id: &str) -> Result<SubmissionReceipt, SubmissionError> {
        Err(SubmissionError::JobNotFound(job_id.to_string()))
    }

    async fn get_result(&self, job_id: &str) -> Result<serde_json::Value, SubmissionError> {
        Err(SubmissionError::JobNotFound(job_id.to_string()))
    }

    async fn health_check(&self) -> Result<(), SubmissionError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// In-memory store that counts calls and can refuse or stall writes
pub struct FlakyStore {
    inner: InMemoryRecordStore,
    fail_job_writes: AtomicBool,
    stall_job_writes: AtomicBool,
    fail_claims: AtomicBool,
    down: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: InMemoryRecordStore) -> Self {
        Self {
            inner,
            fail_job_writes: AtomicBool::new(false),
            stall_job_writes: AtomicBool::new(false),
            fail_claims: AtomicBool::new(false),
            down: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_job_writes(&self, fail: bool) {
        self.fail_job_writes.store(fail, Ordering::SeqCst);
    }

    /// Make job record writes never complete
    pub fn stall_job_writes(&self, stall: bool) {
        self.stall_job_writes.store(stall, Ordering::SeqCst);
    }

    /// Make claim attempts fail
    pub fn fail_claims(&self, fail: bool) {
        self.fail_claims.store(fail, Ordering::SeqCst);
    }

    /// Make health checks fail
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryRecordStore {
        &self.inner
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.count();
        if key.starts_with("job:") {
            if self.stall_job_writes.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail_job_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
        }
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.count();
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<String, StoreError> {
        self.count();
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.count();
        self.inner.delete(key).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.count();
        self.inner.delete_if_equals(key, expected).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.count();
        self.inner.list_keys(prefix).await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.health_check().await
    }

    fn name(&self) -> &str {
        "flaky"
    }
}
