//! Provider abstractions for the worker's external collaborators
//!
//! Each collaborator sits behind a trait so the pipeline can run against the
//! production backends (Redis, WebDAV, the HTTP parser API) or in-memory
//! doubles.

pub mod file_store;
pub mod memory;
pub mod parser;
pub mod record_store;
pub mod redis_store;
pub mod webdav;

pub use file_store::{FileStore, RetrievalError};
pub use memory::InMemoryRecordStore;
pub use parser::{
    ParserService, SubmissionError, SubmissionMetadata, SubmissionReceipt, SubmissionRequest,
};
pub use record_store::{RecordStore, StoreError};
pub use redis_store::RedisRecordStore;
pub use webdav::WebDavFileStore;
