//! Distributed mutual exclusion over a shared key-value store.
//!
//! Profiles and sessions are the units of exclusion: a worker takes the
//! profile lock (and the session lock inside it) before mutating either.

mod mutex;
mod record;

pub use mutex::{Acquisition, BlockingMutexGuard, GlobalMutex};
pub use record::{now_epoch, LockRecord, LockState};

use profileflow_storage::StorageError;
use thiserror::Error;

/// Errors from lock operations.
///
/// A break-in is not an error; it is reported as
/// [`Acquisition::BrokeIn`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock store error: {0}")]
    Store(#[from] StorageError),

    #[error("Key {key} is locked by {owner}")]
    Locked { key: String, owner: String },

    #[error("Failed to encode lock record: {0}")]
    Encode(String),
}
