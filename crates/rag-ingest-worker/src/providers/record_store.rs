//! Record store provider trait: expiring key-value storage

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Record store failures
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No (unexpired) value under the key
    #[error("key not found: {0}")]
    NotFound(String),

    /// Backend unreachable or command failed
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    /// Round trip exceeded its deadline
    #[error("record store call timed out after {0:?}")]
    Timeout(Duration),

    /// Stored value could not be decoded
    #[error("corrupt record under '{key}': {message}")]
    Corrupt { key: String, message: String },

    /// Update refused because it would violate a record invariant
    #[error("update rejected: {0}")]
    Conflict(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Trait for expiring key-value storage
///
/// Implementations:
/// - `RedisRecordStore`: Redis over a multiplexed async connection
/// - `InMemoryRecordStore`: process-local map, for tests and dry runs
///
/// Consistency is last-write-wins per key; there are no cross-key
/// transactions. `set_if_absent` and `delete_if_equals` are the only atomic
/// conditional operations.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Store a value with an expiry, overwriting any existing value
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Store a value only if the key holds no unexpired value
    ///
    /// Returns `true` when the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Fetch a value, failing with `StoreError::NotFound` when absent or expired
    async fn get(&self, key: &str) -> Result<String, StoreError>;

    /// Remove a key; removing a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove a key only while it still holds `expected`
    ///
    /// Returns `true` when the key was removed.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// List live keys starting with `prefix`
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Check if the backend is reachable
    async fn health_check(&self) -> Result<(), StoreError>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
