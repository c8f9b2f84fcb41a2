//! # profileflow-storage
//!
//! Storage adapters for profileflow.
//!
//! - [`KvStore`] / [`BlockingKvStore`]: the binary key-value contract used by
//!   the distributed profile lock and the handler cache
//! - [`InMemoryKvStore`]: TTL-aware store for tests and single-node setups
//! - `RedisKvStore` (feature `redis`): shared store for multi-worker setups

mod error;
mod keys;
mod memory_store;
mod traits;

#[cfg(feature = "redis")]
mod redis_store;

pub use error::StorageError;
pub use keys::KeyPatterns;
pub use memory_store::InMemoryKvStore;
pub use traits::{BlockingKvStore, KvStore};

#[cfg(feature = "redis")]
pub use redis_store::RedisKvStore;
