//! Core types for the ingest worker

pub mod event;
pub mod job;

pub use event::{EventKind, FileChangeEvent, FileRef, ShareInfo};
pub use job::{InvalidTransition, JobRecord, JobStatus, SubmissionInfo};
