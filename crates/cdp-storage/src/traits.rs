//! Storage traits.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StorageError;

/// Key-value store over binary blobs (Redis-like).
///
/// This is the only contract the distributed lock needs from its backing
/// store. Values set with a TTL must disappear once the TTL elapses.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a value by key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Set a value with optional TTL.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<(), StorageError>;

    /// Delete a key.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Check if key exists.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Thread-blocking twin of [`KvStore`].
///
/// Used by callers that hold a profile lock from synchronous code.
pub trait BlockingKvStore: Send + Sync {
    /// Get a value by key.
    fn get_blocking(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Set a value with optional TTL.
    fn set_blocking(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<(), StorageError>;

    /// Delete a key.
    fn delete_blocking(&self, key: &str) -> Result<(), StorageError>;

    /// Check if key exists.
    fn exists_blocking(&self, key: &str) -> Result<bool, StorageError>;
}
