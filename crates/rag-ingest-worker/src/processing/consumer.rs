//! Consumption loop: a fixed pool of workers settling deliveries
//!
//! Each worker takes one delivery at a time, runs the pipeline on it and
//! settles it according to the outcome:
//!
//! | Result                 | Settlement                                      |
//! |------------------------|-------------------------------------------------|
//! | submitted / skipped    | ack                                             |
//! | retryable failure      | requeue after backoff, reject when out of budget |
//! | file claimed elsewhere | requeue after backoff, outside the budget       |
//! | terminal failure       | reject (dead-lettered when configured)          |
//! | submitted, not recorded| ack, logged for reconciliation                  |

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::pipeline::{Disposition, JobPipeline, Outcome, PipelineError};
use super::retry::{AttemptTracker, RetryPolicy};
use crate::config::WorkerPoolConfig;
use crate::error::{Error, Result};
use crate::queue::{Delivery, MessageSource};

/// Settlement counters
#[derive(Debug, Default)]
pub struct LoopStats {
    submitted: AtomicU64,
    skipped: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
    reconcile: AtomicU64,
}

/// Point-in-time copy of [`LoopStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub skipped: u64,
    pub requeued: u64,
    pub rejected: u64,
    /// Jobs submitted but not recorded
    pub reconcile: u64,
}

impl StatsSnapshot {
    /// Deliveries removed from the queue with a positive ack
    pub fn acked(&self) -> u64 {
        self.submitted + self.skipped + self.reconcile
    }
}

impl LoopStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            reconcile: self.reconcile.load(Ordering::Relaxed),
        }
    }
}

/// Bounded pool of workers pulling from one message source
pub struct ConsumptionLoop {
    pipeline: Arc<JobPipeline>,
    source: Arc<dyn MessageSource>,
    concurrency: usize,
    retry: RetryPolicy,
    shutdown_grace: Duration,
    attempts: Arc<AttemptTracker>,
    stats: Arc<LoopStats>,
}

impl ConsumptionLoop {
    pub fn new(
        pipeline: Arc<JobPipeline>,
        source: Arc<dyn MessageSource>,
        config: &WorkerPoolConfig,
    ) -> Self {
        Self {
            pipeline,
            source,
            concurrency: config.concurrency.max(1),
            retry: RetryPolicy::from_config(config),
            shutdown_grace: config.shutdown_grace(),
            attempts: Arc::new(AttemptTracker::new()),
            stats: Arc::new(LoopStats::default()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn source(&self) -> &Arc<dyn MessageSource> {
        &self.source
    }

    pub fn pipeline(&self) -> &Arc<JobPipeline> {
        &self.pipeline
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared counters, for reporting while the loop runs
    pub fn stats_handle(&self) -> Arc<LoopStats> {
        self.stats.clone()
    }

    /// Consume until `cancel` fires or the source closes
    ///
    /// After cancellation, in-flight messages get `shutdown_grace` to finish;
    /// workers still busy after that are abandoned. The source is closed
    /// before returning. Fails when a worker stopped on a source error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let source_failed = Arc::new(AtomicBool::new(false));
        let mut workers = JoinSet::new();

        for id in 0..self.concurrency {
            let worker = Worker {
                id,
                pipeline: self.pipeline.clone(),
                source: self.source.clone(),
                retry: self.retry,
                attempts: self.attempts.clone(),
                stats: self.stats.clone(),
                source_failed: source_failed.clone(),
            };
            let cancel = cancel.clone();
            workers.spawn(async move { worker.run(cancel).await });
        }

        tracing::info!(
            "Consumption loop started: {} workers on {} source",
            self.concurrency,
            self.source.name()
        );

        let drained = loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(result) => log_join(result),
                    None => break true,
                },
                _ = cancel.cancelled() => break false,
            }
        };

        if !drained {
            tracing::info!(
                "Shutdown requested, waiting up to {:?} for {} workers",
                self.shutdown_grace,
                workers.len()
            );
            let drain = async {
                while let Some(result) = workers.join_next().await {
                    log_join(result);
                }
            };
            if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
                tracing::warn!(
                    "Abandoning {} workers still busy after the grace period",
                    workers.len()
                );
                workers.detach_all();
            }
        }

        if let Err(e) = self.source.close().await {
            tracing::warn!("Failed to close {} source: {}", self.source.name(), e);
        }

        let stats = self.stats();
        tracing::info!(
            "Consumption loop stopped: {} submitted, {} skipped, {} requeued, {} rejected, {} to reconcile",
            stats.submitted,
            stats.skipped,
            stats.requeued,
            stats.rejected,
            stats.reconcile
        );

        if source_failed.load(Ordering::Relaxed) {
            return Err(Error::queue("message source failed"));
        }
        Ok(())
    }
}

fn log_join(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!("Worker task failed: {}", e);
    }
}

struct Worker {
    id: usize,
    pipeline: Arc<JobPipeline>,
    source: Arc<dyn MessageSource>,
    retry: RetryPolicy,
    attempts: Arc<AttemptTracker>,
    stats: Arc<LoopStats>,
    source_failed: Arc<AtomicBool>,
}

impl Worker {
    async fn run(self, cancel: CancellationToken) {
        tracing::debug!("Worker {} started", self.id);

        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.source.recv() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        tracing::error!("Worker {} stopping on queue error: {}", self.id, e);
                        self.source_failed.store(true, Ordering::Relaxed);
                        break;
                    }
                    None => {
                        tracing::info!("Worker {}: message source closed", self.id);
                        break;
                    }
                },
            };

            let span = tracing::info_span!("delivery", worker = self.id, tag = delivery.tag);
            self.handle(delivery, &cancel).instrument(span).await;
        }

        tracing::debug!("Worker {} stopped", self.id);
    }

    async fn handle(&self, delivery: Delivery, cancel: &CancellationToken) {
        let tag = delivery.tag;
        let key = delivery.retry_key();
        let attempt = match delivery.delivery_count {
            Some(previous) => previous.saturating_add(1),
            None => self.attempts.record(&key),
        };

        let result = self.pipeline.process_message(&delivery.body, cancel).await;

        let settled = match result {
            Ok(outcome) => {
                self.attempts.forget(&key);
                match &outcome {
                    Outcome::Submitted { job_id } => {
                        tracing::debug!("Delivery {} submitted as job {}", tag, job_id);
                        LoopStats::bump(&self.stats.submitted);
                    }
                    Outcome::Skipped(reason) => {
                        tracing::debug!("Delivery {} skipped: {:?}", tag, reason);
                        LoopStats::bump(&self.stats.skipped);
                    }
                }
                delivery.ack().await
            }
            Err(e) => self.settle_failure(delivery, e, attempt, &key, cancel).await,
        };

        if let Err(e) = settled {
            tracing::error!("Worker {} failed to settle delivery {}: {}", self.id, tag, e);
        }
    }

    /// Back off before a requeue; shutdown cuts the wait short
    async fn pause(&self, delay: Duration, cancel: &CancellationToken) {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    async fn settle_failure(
        &self,
        delivery: Delivery,
        error: PipelineError,
        attempt: u32,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tag = delivery.tag;

        match error.disposition() {
            Disposition::Retryable if error.is_cancelled() => {
                tracing::info!("Delivery {} interrupted ({}), requeueing", tag, error);
                LoopStats::bump(&self.stats.requeued);
                delivery.requeue().await
            }
            Disposition::Retryable if error.is_claim_held() => {
                let delay = self.retry.backoff(attempt);
                tracing::debug!(
                    "Delivery {} waits for a held claim: {}; requeueing in {:?}",
                    tag,
                    error,
                    delay
                );
                self.pause(delay, cancel).await;
                LoopStats::bump(&self.stats.requeued);
                delivery.requeue().await
            }
            Disposition::Retryable if self.retry.allows_retry(attempt) => {
                let delay = self.retry.backoff(attempt);
                tracing::warn!(
                    "Delivery {} failed on attempt {}/{}: {}; requeueing in {:?}",
                    tag,
                    attempt,
                    self.retry.max_attempts,
                    error,
                    delay
                );
                self.pause(delay, cancel).await;
                LoopStats::bump(&self.stats.requeued);
                delivery.requeue().await
            }
            Disposition::Retryable => {
                tracing::error!(
                    "Delivery {} failed {} times, giving up: {}",
                    tag,
                    attempt,
                    error
                );
                self.attempts.forget(key);
                LoopStats::bump(&self.stats.rejected);
                delivery.reject().await
            }
            Disposition::Terminal => {
                tracing::error!("Delivery {} rejected: {}", tag, error);
                self.attempts.forget(key);
                LoopStats::bump(&self.stats.rejected);
                delivery.reject().await
            }
            Disposition::Reconcile => {
                // Retrying would submit the file a second time
                match &error {
                    PipelineError::Persistence {
                        job_id,
                        file_id,
                        trace_id,
                        ..
                    } => tracing::error!(
                        "RECONCILE job {} file {} trace {} (delivery {}): {}",
                        job_id,
                        file_id,
                        trace_id,
                        tag,
                        error
                    ),
                    _ => tracing::error!("RECONCILE delivery {}: {}", tag, error),
                }
                self.attempts.forget(key);
                LoopStats::bump(&self.stats.reconcile);
                delivery.ack().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::EventFilter;
    use crate::processing::PipelineSettings;
    use crate::providers::{InMemoryRecordStore, RecordStore, RetrievalError};
    use crate::queue::{AckKind, MemoryQueue};
    use crate::storage::JobStore;
    use crate::testing::{event_json, CountingFileStore, CountingParser, FlakyStore};

    struct Harness {
        queue: Arc<MemoryQueue>,
        store: Arc<FlakyStore>,
        files: Arc<CountingFileStore>,
        parser: Arc<CountingParser>,
        consumer: ConsumptionLoop,
    }

    fn harness(files: CountingFileStore, parser: CountingParser, concurrency: usize) -> Harness {
        harness_with(
            files,
            parser,
            WorkerPoolConfig {
                concurrency,
                max_attempts: 3,
                retry_base_delay_ms: 0,
                retry_max_delay_ms: 0,
                shutdown_grace_secs: 5,
            },
        )
    }

    fn harness_with(
        files: CountingFileStore,
        parser: CountingParser,
        config: WorkerPoolConfig,
    ) -> Harness {
        let store = Arc::new(FlakyStore::new(InMemoryRecordStore::new()));
        let files = Arc::new(files);
        let parser = Arc::new(parser);
        let pipeline = JobPipeline::new(
            JobStore::new(
                store.clone(),
                Duration::from_secs(86_400),
                Duration::from_secs(600),
            ),
            files.clone(),
            parser.clone(),
            EventFilter::new(),
            PipelineSettings {
                max_file_size: 52_428_800,
                fetch_timeout: Duration::from_secs(5),
                submit_timeout: Duration::from_secs(5),
                default_owner: "admin".into(),
            },
        );
        let queue = Arc::new(MemoryQueue::new());
        let consumer = ConsumptionLoop::new(Arc::new(pipeline), queue.clone(), &config);
        Harness {
            queue,
            store,
            files,
            parser,
            consumer,
        }
    }

    fn pdf(file_id: i64) -> Vec<u8> {
        event_json("created", file_id, "/alice/files/a.pdf", 128, "application/pdf")
    }

    #[tokio::test]
    async fn test_acks_submitted_and_skipped() {
        let h = harness(
            CountingFileStore::with_content(vec![0u8; 128]),
            CountingParser::accepting(["job-1", "job-2"]),
            2,
        );
        h.queue.publish(pdf(1));
        h.queue.publish(pdf(2));
        h.queue.publish(event_json("deleted", 3, "/alice/files/a.pdf", 1, "application/pdf"));
        h.queue.close_when_drained();

        h.consumer.run(CancellationToken::new()).await.unwrap();

        assert_eq!(h.queue.count(AckKind::Ack), 3);
        assert_eq!(h.parser.calls(), 2);
        let stats = h.consumer.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.acked(), 3);
    }

    #[tokio::test]
    async fn test_malformed_message_is_rejected_once() {
        let h = harness(
            CountingFileStore::with_content(vec![]),
            CountingParser::accepting(["job-1"]),
            1,
        );
        h.queue.publish("definitely not json");
        h.queue.close_when_drained();

        h.consumer.run(CancellationToken::new()).await.unwrap();

        assert_eq!(h.queue.count(AckKind::Reject), 1);
        assert_eq!(h.queue.count(AckKind::Requeue), 0);
    }

    #[tokio::test]
    async fn test_transport_failures_requeue_until_budget_spent() {
        let h = harness(
            CountingFileStore::failing(RetrievalError::Transport("timeout".into())),
            CountingParser::accepting(["job-1"]),
            1,
        );
        h.queue.publish(pdf(42));
        h.queue.close_when_drained();

        h.consumer.run(CancellationToken::new()).await.unwrap();

        assert_eq!(h.files.calls(), 3);
        assert_eq!(h.queue.count(AckKind::Requeue), 2);
        assert_eq!(h.queue.count(AckKind::Reject), 1);
        assert_eq!(h.parser.calls(), 0);
        assert!(h.store.inner().is_empty());
    }

    #[tokio::test]
    async fn test_unrecorded_submission_is_acked_for_reconciliation() {
        let h = harness(
            CountingFileStore::with_content(vec![0u8; 128]),
            CountingParser::accepting(["job-abc"]),
            1,
        );
        h.store.fail_job_writes(true);
        h.queue.publish(pdf(42));
        h.queue.close_when_drained();

        h.consumer.run(CancellationToken::new()).await.unwrap();

        assert_eq!(h.queue.count(AckKind::Ack), 1);
        assert_eq!(h.queue.count(AckKind::Requeue), 0);
        assert_eq!(h.consumer.stats().reconcile, 1);
        assert_eq!(h.parser.calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_deliveries_submit_once() {
        let h = harness(
            CountingFileStore::with_content(vec![0u8; 128]).with_delay(Duration::from_millis(30)),
            CountingParser::accepting(["job-abc"]),
            4,
        );
        for _ in 0..4 {
            h.queue.publish(pdf(42));
        }
        h.queue.close_when_drained();

        h.consumer.run(CancellationToken::new()).await.unwrap();

        assert_eq!(h.parser.calls(), 1);
        assert_eq!(h.queue.count(AckKind::Ack), 4);
    }

    #[tokio::test]
    async fn test_cancellation_stops_workers_and_requeues_in_flight() {
        let h = harness(
            CountingFileStore::with_content(vec![0u8; 128]).with_delay(Duration::from_secs(60)),
            CountingParser::accepting(["job-abc"]),
            2,
        );
        h.queue.publish(pdf(42));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), h.consumer.run(cancel))
            .await
            .expect("loop did not stop")
            .unwrap();

        assert_eq!(h.queue.count(AckKind::Requeue), 1);
        assert_eq!(h.parser.calls(), 0);
        assert_eq!(h.consumer.stats().requeued, 1);
    }

    #[tokio::test]
    async fn test_stale_claim_is_waited_out_not_dropped() {
        let h = harness_with(
            CountingFileStore::with_content(vec![0u8; 128]),
            CountingParser::accepting(["job-abc"]),
            WorkerPoolConfig {
                concurrency: 1,
                max_attempts: 3,
                retry_base_delay_ms: 20,
                retry_max_delay_ms: 50,
                shutdown_grace_secs: 5,
            },
        );
        // Left behind by a worker that died mid-submission
        h.store
            .set("file:42", "pending:dead-worker", Duration::from_millis(300))
            .await
            .unwrap();
        h.queue.publish(pdf(42));
        h.queue.close_when_drained();

        tokio::time::timeout(Duration::from_secs(5), h.consumer.run(CancellationToken::new()))
            .await
            .expect("loop did not finish")
            .unwrap();

        assert_eq!(h.parser.calls(), 1);
        assert_eq!(h.files.calls(), 1);
        assert_eq!(h.queue.count(AckKind::Ack), 1);
        assert_eq!(h.queue.count(AckKind::Reject), 0);
        // More waits than the retry budget allows for failures
        assert!(h.queue.count(AckKind::Requeue) > 3);
        assert_eq!(h.consumer.stats().submitted, 1);
    }

    #[tokio::test]
    async fn test_dedup_store_errors_are_retried() {
        let h = harness(
            CountingFileStore::with_content(vec![0u8; 128]),
            CountingParser::accepting(["job-abc"]),
            1,
        );
        h.store.fail_claims(true);
        h.queue.publish(pdf(42));
        h.queue.close_when_drained();

        h.consumer.run(CancellationToken::new()).await.unwrap();

        assert_eq!(h.queue.count(AckKind::Requeue), 2);
        assert_eq!(h.queue.count(AckKind::Reject), 1);
        assert_eq!(h.files.calls(), 0);
        assert_eq!(h.parser.calls(), 0);
    }

    #[tokio::test]
    async fn test_busy_workers_abandoned_after_grace() {
        let h = harness_with(
            CountingFileStore::with_content(vec![0u8; 128]),
            CountingParser::accepting(["job-abc"]),
            WorkerPoolConfig {
                concurrency: 1,
                max_attempts: 3,
                retry_base_delay_ms: 0,
                retry_max_delay_ms: 0,
                shutdown_grace_secs: 1,
            },
        );
        h.store.stall_job_writes(true);
        h.queue.publish(pdf(42));

        let cancel = CancellationToken::new();
        let consumer = Arc::new(h.consumer);
        let running = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(cancel).await })
        };

        // Wait until the worker is stuck persisting
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.parser.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("submission never happened");

        let started = std::time::Instant::now();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(3), running)
            .await
            .expect("loop ignored the grace period")
            .unwrap()
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(consumer.stats().submitted, 0);
        assert!(h.queue.acks().is_empty());
    }
}
