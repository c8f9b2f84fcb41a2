//! GlobalMutex - a TTL lock shared by every worker through a key-value store.
//!
//! The lock is one JSON [`LockRecord`] under one key, written with a TTL so
//! a crashed owner never blocks forever. A contender polls while the key is
//! held. Once the grace period has passed it overwrites the record with
//! state BROKE and proceeds as the new owner.
//!
//! The async and blocking variants share the decision logic and differ only
//! in how they talk to the store and how they sleep.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use profileflow_core::config::LockConfig;
//! use profileflow_core::lock::GlobalMutex;
//! use profileflow_storage::InMemoryKvStore;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryKvStore::new());
//! let mutex = GlobalMutex::for_profile(store, "profile-42", LockConfig::default());
//!
//! let total = mutex.scoped("worker-1", || async { 40 + 2 }).await?;
//! assert_eq!(total, 42);
//! assert!(!mutex.is_locked().await?);
//! # Ok(())
//! # }
//! ```

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use super::record::{now_epoch, LockRecord, LockState};
use super::LockError;
use crate::config::LockConfig;
use profileflow_storage::{BlockingKvStore, KeyPatterns, KvStore};

// ============================================================================
// ACQUISITION
// ============================================================================

/// How a lock was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// The key was free, or freed while waiting.
    Acquired { waited: Duration },
    /// The grace period ran out and the previous owner was displaced.
    BrokeIn {
        previous_owner: String,
        waited: Duration,
    },
}

impl Acquisition {
    pub fn waited(&self) -> Duration {
        match self {
            Self::Acquired { waited } | Self::BrokeIn { waited, .. } => *waited,
        }
    }

    pub fn is_break_in(&self) -> bool {
        matches!(self, Self::BrokeIn { .. })
    }
}

/// Next step of an acquisition loop.
enum Decision {
    Take(LockRecord),
    BreakIn(LockRecord),
    Refuse(String),
    Wait,
}

// ============================================================================
// GLOBAL MUTEX
// ============================================================================

/// Distributed mutex over one store key.
pub struct GlobalMutex<S: ?Sized> {
    key: String,
    store: Arc<S>,
    config: LockConfig,
}

impl<S: ?Sized> GlobalMutex<S> {
    pub fn new(key: impl Into<String>, store: Arc<S>, config: LockConfig) -> Self {
        Self {
            key: key.into(),
            store,
            config,
        }
    }

    /// Mutex guarding one profile.
    pub fn for_profile(store: Arc<S>, profile_id: &str, config: LockConfig) -> Self {
        Self::new(KeyPatterns::profile_lock(profile_id), store, config)
    }

    /// Mutex guarding one session.
    pub fn for_session(store: Arc<S>, session_id: &str, config: LockConfig) -> Self {
        Self::new(KeyPatterns::session_lock(session_id), store, config)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Store TTL of the record: lock TTL plus tolerance.
    pub fn expires(&self) -> Duration {
        self.config.ttl() + self.config.tolerance()
    }

    /// How long a contender waits before breaking in.
    pub fn grace(&self) -> Duration {
        self.config
            .break_after_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.expires())
    }

    fn decode(&self, bytes: &[u8]) -> Option<LockRecord> {
        match LockRecord::decode(bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Unreadable lock record, treating as released");
                None
            }
        }
    }

    fn decide(&self, owner: &str, current: Option<LockRecord>, now: f64) -> Decision {
        match current {
            None => Decision::Take(LockRecord::locked(&self.key, owner)),
            // Re-entry by the current holder refreshes the record.
            Some(held) if held.owner == owner => Decision::Take(LockRecord::locked(&self.key, owner)),
            Some(held) if self.config.raise_error_when_locked => Decision::Refuse(held.owner),
            Some(held) if held.grace_elapsed(self.grace(), now) => {
                Decision::BreakIn(LockRecord::broken(&held, owner))
            }
            Some(_) => Decision::Wait,
        }
    }

    fn log_break_in(&self, record: &LockRecord) {
        warn!(
            key = %self.key,
            owner = %record.owner,
            previous_owner = record.broken_from.as_deref().unwrap_or_default(),
            grace_ms = self.grace().as_millis() as u64,
            "Lock grace period elapsed, breaking in"
        );
    }
}

// ============================================================================
// ASYNC OPERATIONS
// ============================================================================

impl<S: KvStore + ?Sized> GlobalMutex<S> {
    /// Write a LOCKED record for `owner` without checking the current holder.
    pub async fn lock(&self, owner: &str) -> Result<(), LockError> {
        self.write(&LockRecord::locked(&self.key, owner)).await
    }

    pub async fn unlock(&self) -> Result<(), LockError> {
        debug!(key = %self.key, "Unlocking");
        Ok(self.store.delete(&self.key).await?)
    }

    /// Unlock only if `owner` still holds the lock. Returns whether it did.
    pub async fn release(&self, owner: &str) -> Result<bool, LockError> {
        match self.record().await? {
            Some(record) if record.owner == owner => {
                self.unlock().await?;
                Ok(true)
            }
            Some(record) => {
                warn!(key = %self.key, owner, holder = %record.owner, "Lock taken over, not releasing");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    pub async fn is_locked(&self) -> Result<bool, LockError> {
        Ok(self.store.exists(&self.key).await?)
    }

    /// Current state; an unreadable record is deleted and reported released.
    pub async fn state(&self) -> Result<LockState, LockError> {
        let Some(bytes) = self.store.get(&self.key).await? else {
            return Ok(LockState::Released);
        };
        match self.decode(&bytes) {
            Some(record) => Ok(record.state),
            None => {
                self.unlock().await?;
                Ok(LockState::Released)
            }
        }
    }

    /// Current record, `None` when absent or unreadable.
    pub async fn record(&self) -> Result<Option<LockRecord>, LockError> {
        let bytes = self.store.get(&self.key).await?;
        Ok(bytes.and_then(|b| self.decode(&b)))
    }

    /// Take the lock for `owner`, waiting for the holder or breaking in.
    ///
    /// If `owner` already holds the key the record is rewritten with a fresh
    /// timestamp and the call returns at once.
    ///
    /// # Errors
    ///
    /// `LockError::Locked` in fail-fast mode when another owner holds the
    /// key, or a store error.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn acquire(&self, owner: &str) -> Result<Acquisition, LockError> {
        let started = Instant::now();
        loop {
            let current = self.record().await?;
            match self.decide(owner, current, now_epoch()) {
                Decision::Take(record) => {
                    self.write(&record).await?;
                    debug!(owner, "Lock acquired");
                    return Ok(Acquisition::Acquired {
                        waited: started.elapsed(),
                    });
                }
                Decision::BreakIn(record) => {
                    self.write(&record).await?;
                    self.log_break_in(&record);
                    return Ok(Acquisition::BrokeIn {
                        previous_owner: record.broken_from.unwrap_or_default(),
                        waited: started.elapsed(),
                    });
                }
                Decision::Refuse(holder) => {
                    return Err(LockError::Locked {
                        key: self.key.clone(),
                        owner: holder,
                    });
                }
                Decision::Wait => tokio::time::sleep(self.config.poll_interval()).await,
            }
        }
    }

    /// Run `f` while holding the lock.
    ///
    /// The lock is released on every exit path. A panic inside `f` is
    /// re-raised after the release.
    pub async fn scoped<F, Fut, T>(&self, owner: &str, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire(owner).await?;
        let outcome = AssertUnwindSafe(f()).catch_unwind().await;

        if let Err(e) = self.release(owner).await {
            warn!(key = %self.key, error = %e, "Failed to release lock");
        }

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn write(&self, record: &LockRecord) -> Result<(), LockError> {
        let bytes = record.encode()?;
        Ok(self.store.set(&self.key, bytes, Some(self.expires())).await?)
    }
}

// ============================================================================
// BLOCKING OPERATIONS
// ============================================================================

impl<S: BlockingKvStore + ?Sized> GlobalMutex<S> {
    pub fn lock_blocking(&self, owner: &str) -> Result<(), LockError> {
        self.write_blocking(&LockRecord::locked(&self.key, owner))
    }

    pub fn unlock_blocking(&self) -> Result<(), LockError> {
        Ok(self.store.delete_blocking(&self.key)?)
    }

    pub fn release_blocking(&self, owner: &str) -> Result<bool, LockError> {
        match self.record_blocking()? {
            Some(record) if record.owner == owner => {
                self.unlock_blocking()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn is_locked_blocking(&self) -> Result<bool, LockError> {
        Ok(self.store.exists_blocking(&self.key)?)
    }

    pub fn state_blocking(&self) -> Result<LockState, LockError> {
        let Some(bytes) = self.store.get_blocking(&self.key)? else {
            return Ok(LockState::Released);
        };
        match self.decode(&bytes) {
            Some(record) => Ok(record.state),
            None => {
                self.unlock_blocking()?;
                Ok(LockState::Released)
            }
        }
    }

    pub fn record_blocking(&self) -> Result<Option<LockRecord>, LockError> {
        let bytes = self.store.get_blocking(&self.key)?;
        Ok(bytes.and_then(|b| self.decode(&b)))
    }

    /// Blocking twin of [`acquire`](GlobalMutex::acquire).
    pub fn acquire_blocking(&self, owner: &str) -> Result<Acquisition, LockError> {
        let started = Instant::now();
        loop {
            let current = self.record_blocking()?;
            match self.decide(owner, current, now_epoch()) {
                Decision::Take(record) => {
                    self.write_blocking(&record)?;
                    return Ok(Acquisition::Acquired {
                        waited: started.elapsed(),
                    });
                }
                Decision::BreakIn(record) => {
                    self.write_blocking(&record)?;
                    self.log_break_in(&record);
                    return Ok(Acquisition::BrokeIn {
                        previous_owner: record.broken_from.unwrap_or_default(),
                        waited: started.elapsed(),
                    });
                }
                Decision::Refuse(holder) => {
                    return Err(LockError::Locked {
                        key: self.key.clone(),
                        owner: holder,
                    });
                }
                Decision::Wait => std::thread::sleep(self.config.poll_interval()),
            }
        }
    }

    /// Acquire and return a guard that releases on drop.
    pub fn guard(&self, owner: impl Into<String>) -> Result<BlockingMutexGuard<'_, S>, LockError> {
        let owner = owner.into();
        let acquisition = self.acquire_blocking(&owner)?;
        Ok(BlockingMutexGuard {
            mutex: self,
            owner,
            acquisition,
        })
    }

    fn write_blocking(&self, record: &LockRecord) -> Result<(), LockError> {
        let bytes = record.encode()?;
        Ok(self
            .store
            .set_blocking(&self.key, bytes, Some(self.expires()))?)
    }
}

impl<S: ?Sized> std::fmt::Debug for GlobalMutex<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalMutex")
            .field("key", &self.key)
            .field("config", &self.config)
            .finish()
    }
}

/// Holds a blocking lock until dropped.
pub struct BlockingMutexGuard<'a, S: BlockingKvStore + ?Sized> {
    mutex: &'a GlobalMutex<S>,
    owner: String,
    acquisition: Acquisition,
}

impl<S: BlockingKvStore + ?Sized> BlockingMutexGuard<'_, S> {
    pub fn acquisition(&self) -> &Acquisition {
        &self.acquisition
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl<S: BlockingKvStore + ?Sized> Drop for BlockingMutexGuard<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.release_blocking(&self.owner) {
            warn!(key = %self.mutex.key, error = %e, "Failed to release lock");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
