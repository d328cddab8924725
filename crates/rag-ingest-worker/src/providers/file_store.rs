//! File store provider trait for retrieving raw file content

use async_trait::async_trait;
use thiserror::Error;

use crate::types::FileRef;

/// File retrieval failures
#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    /// The file no longer exists at its path
    #[error("file not found: {0}")]
    NotFound(String),

    /// The file exceeds the size limit
    #[error("file too large: {size} bytes (max {limit})")]
    TooLarge { size: u64, limit: u64 },

    /// Network failure, timeout or unexpected response
    #[error("file store request failed: {0}")]
    Transport(String),
}

impl RetrievalError {
    /// Only transport failures can succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetrievalError::Transport(_))
    }
}

/// Trait for fetching file content
///
/// Implementations map the file path to their own addressing scheme and must
/// stop reading once more than `max_size` bytes have arrived.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Fetch the full content of a file, at most `max_size` bytes
    async fn fetch(&self, file: &FileRef, max_size: u64) -> Result<Vec<u8>, RetrievalError>;

    /// Check if the store is reachable with the configured credentials
    async fn health_check(&self) -> Result<(), RetrievalError>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
