//! In-memory key-value store with TTL support.
//!
//! Shared between tasks and threads of one process. Expired entries are
//! purged lazily on access, which matches the observable behavior of a
//! Redis key with an expiry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::StorageError;
use crate::traits::{BlockingKvStore, KvStore};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|e| !e.is_expired(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StorageError> {
        self.entries
            .lock()
            .map_err(|e| StorageError::ConnectionFailed(format!("store poisoned: {e}")))
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut entries = self.entries()?;
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    fn write(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StorageError> {
        let expires_at = match ttl {
            Some(ttl) if ttl.is_zero() => {
                return Err(StorageError::SetFailed(format!("zero ttl for key {key}")))
            }
            Some(ttl) => Some(Instant::now() + ttl),
            None => None,
        };
        self.entries()?
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries()?.remove(key);
        Ok(())
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.read(key)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.write(key, value, ttl)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.remove(key)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.read(key)?.is_some())
    }
}

impl BlockingKvStore for InMemoryKvStore {
    fn get_blocking(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.read(key)
    }

    fn set_blocking(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.write(key, value, ttl)
    }

    fn delete_blocking(&self, key: &str) -> Result<(), StorageError> {
        self.remove(key)
    }

    fn exists_blocking(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.read(key)?.is_some())
    }
}
