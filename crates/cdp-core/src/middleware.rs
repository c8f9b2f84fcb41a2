//! Handler wrappers that add caching or mutual exclusion.
//!
//! [`Cached`] serves repeated inputs from a [`KvStore`]. [`Locked`] runs the
//! inner handler while holding a [`GlobalMutex`] keyed by the input. Both
//! implement [`Handler`] themselves, so they stack.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use profileflow_core::middleware::{Cached, Handler, HandlerError};
//! use profileflow_storage::InMemoryKvStore;
//!
//! struct Geo;
//!
//! #[async_trait]
//! impl Handler for Geo {
//!     type Input = String;
//!     type Output = String;
//!
//!     async fn handle(&self, ip: String) -> Result<String, HandlerError> {
//!         Ok(format!("country-of-{ip}"))
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let geo = Cached::new(Geo, Arc::new(InMemoryKvStore::new()), "geo", |ip: &String| ip.clone());
//! assert_eq!(geo.handle("1.2.3.4".into()).await.unwrap(), "country-of-1.2.3.4");
//! # }
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::lock::{GlobalMutex, LockError};
use profileflow_storage::{KeyPatterns, KvStore, StorageError};

// ============================================================================
// HANDLER
// ============================================================================

/// Errors surfaced by handlers and their wrappers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// An async operation from `Input` to `Output`.
#[async_trait]
pub trait Handler: Send + Sync {
    type Input: Send + Sync;
    type Output: Serialize + DeserializeOwned + Send;

    async fn handle(&self, input: Self::Input) -> Result<Self::Output, HandlerError>;
}

// ============================================================================
// CACHED
// ============================================================================

/// Serves results from a key-value store, computing them on a miss.
pub struct Cached<H, K> {
    inner: H,
    store: Arc<dyn KvStore>,
    namespace: String,
    ttl: Option<Duration>,
    key_fn: K,
}

impl<H, K> Cached<H, K>
where
    H: Handler,
    K: Fn(&H::Input) -> String + Send + Sync,
{
    pub fn new(inner: H, store: Arc<dyn KvStore>, namespace: impl Into<String>, key_fn: K) -> Self {
        Self {
            inner,
            store,
            namespace: namespace.into(),
            ttl: None,
            key_fn,
        }
    }

    /// Expire cached entries after `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<H, K> Handler for Cached<H, K>
where
    H: Handler,
    K: Fn(&H::Input) -> String + Send + Sync,
{
    type Input = H::Input;
    type Output = H::Output;

    async fn handle(&self, input: Self::Input) -> Result<Self::Output, HandlerError> {
        let key = KeyPatterns::cache(&self.namespace, &(self.key_fn)(&input));

        if let Some(bytes) = self.store.get(&key).await? {
            match serde_json::from_slice(&bytes) {
                Ok(output) => {
                    debug!(key = %key, "Cache hit");
                    return Ok(output);
                }
                Err(e) => warn!(key = %key, error = %e, "Unreadable cache entry, recomputing"),
            }
        }

        let output = self.inner.handle(input).await?;
        let bytes =
            serde_json::to_vec(&output).map_err(|e| HandlerError::Serialization(e.to_string()))?;
        if let Err(e) = self.store.set(&key, bytes, self.ttl).await {
            warn!(key = %key, error = %e, "Failed to write cache entry");
        }

        Ok(output)
    }
}

// ============================================================================
// LOCKED
// ============================================================================

/// Runs the inner handler under a distributed lock keyed by the input.
pub struct Locked<H, K> {
    inner: H,
    store: Arc<dyn KvStore>,
    namespace: String,
    config: LockConfig,
    worker: String,
    key_fn: K,
}

impl<H, K> Locked<H, K>
where
    H: Handler,
    K: Fn(&H::Input) -> String + Send + Sync,
{
    pub fn new(
        inner: H,
        store: Arc<dyn KvStore>,
        namespace: impl Into<String>,
        config: LockConfig,
        key_fn: K,
    ) -> Self {
        Self {
            inner,
            store,
            namespace: namespace.into(),
            config,
            worker: "worker".into(),
            key_fn,
        }
    }

    /// Name prefixed to the owner recorded in the lock.
    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = worker.into();
        self
    }
}

#[async_trait]
impl<H, K> Handler for Locked<H, K>
where
    H: Handler,
    K: Fn(&H::Input) -> String + Send + Sync,
{
    type Input = H::Input;
    type Output = H::Output;

    async fn handle(&self, input: Self::Input) -> Result<Self::Output, HandlerError> {
        let key = KeyPatterns::lock(&self.namespace, &(self.key_fn)(&input));
        let mutex = GlobalMutex::new(key, Arc::clone(&self.store), self.config.clone());
        let owner = format!("{}:{}", self.worker, Uuid::new_v4());

        mutex
            .scoped(&owner, || self.inner.handle(input))
            .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use profileflow_storage::InMemoryKvStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Arc<Counting> {
        type Input = u32;
        type Output = u32;

        async fn handle(&self, input: u32) -> Result<u32, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(15)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if input == 0 {
                return Err(HandlerError::Failed("zero".into()));
            }
            Ok(input * 2)
        }
    }

    #[tokio::test]
    async fn test_cached_serves_repeats_from_store() {
        let counting = Arc::new(Counting::default());
        let store = Arc::new(InMemoryKvStore::new());
        let cached = Cached::new(Arc::clone(&counting), store.clone(), "double", |n: &u32| {
            n.to_string()
        });

        assert_eq!(cached.handle(4).await.unwrap(), 8);
        assert_eq!(cached.handle(4).await.unwrap(), 8);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        assert_eq!(cached.handle(5).await.unwrap(), 10);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
        assert!(store.exists(&KeyPatterns::cache("double", "4")).await.unwrap());
    }

    #[tokio::test]
    async fn test_cached_does_not_store_errors() {
        let counting = Arc::new(Counting::default());
        let cached = Cached::new(
            Arc::clone(&counting),
            Arc::new(InMemoryKvStore::new()),
            "double",
            |n: &u32| n.to_string(),
        );

        assert!(cached.handle(0).await.is_err());
        assert!(cached.handle(0).await.is_err());
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_locked_serializes_same_key() {
        let counting = Arc::new(Counting::default());
        let locked = Locked::new(
            Arc::clone(&counting),
            Arc::new(InMemoryKvStore::new()),
            "profile",
            LockConfig::new().with_poll_interval_ms(2),
            |_: &u32| "same".to_string(),
        );

        let results = join_all((1..=4).map(|n| locked.handle(n))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(counting.calls.load(Ordering::SeqCst), 4);
        assert_eq!(counting.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_locked_releases_after_error() {
        let store = Arc::new(InMemoryKvStore::new());
        let locked = Locked::new(
            Arc::new(Counting::default()),
            store.clone(),
            "profile",
            LockConfig::new(),
            |n: &u32| n.to_string(),
        );

        assert_eq!(
            locked.handle(0).await.unwrap_err(),
            HandlerError::Failed("zero".into())
        );
        assert!(!store.exists(&KeyPatterns::lock("profile", "0")).await.unwrap());
    }
}
