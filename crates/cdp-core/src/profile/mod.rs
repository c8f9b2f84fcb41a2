//! Customer profiles and duplicate merging.

mod deep_merge;
mod keys;
mod merger;
mod model;
mod store;

pub use deep_merge::{record_conflicts, Conflict, DeepMerge};
pub use keys::{merge_key_values, needs_merge, resolve_path};
pub use merger::{merge_profiles, MergeOutcome, ProfileMerger};
pub use model::{Profile, ProfileMetadata, ProfileStats, ProfileTime, VisitTime, CONFLICTS_KEY};
pub use store::{InMemoryProfileStore, ProfileStore};

use profileflow_storage::StorageError;
use thiserror::Error;

/// Errors from the merge engine.
///
/// Failures after the merged profile is written are logged, not returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("Profile storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
