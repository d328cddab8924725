//! Persistent job tracking on top of the record store

mod job_store;

pub use job_store::{file_key, job_key, FileEntry, JobStore, CLAIM_PREFIX, UNRECORDED_PREFIX};
