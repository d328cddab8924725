//! rag-ingest-worker: queue-driven ingestion worker for the RAG parsing service
//!
//! Consumes file-change notifications from an AMQP queue, fetches the referenced
//! file over WebDAV, submits it to the external parsing service and records the
//! resulting job in a Redis-backed record store. The record store doubles as the
//! dedup index that keeps a file from being submitted twice.

pub mod config;
pub mod error;
pub mod ingestion;
pub mod processing;
pub mod providers;
pub mod queue;
pub mod server;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::WorkerConfig;
pub use error::{Error, Result};
pub use processing::{ConsumptionLoop, JobPipeline, Outcome, PipelineError};
pub use types::{EventKind, FileChangeEvent, FileRef, JobRecord, JobStatus};
