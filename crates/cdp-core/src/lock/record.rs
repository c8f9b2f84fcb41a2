//! The value stored under a lock key.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::LockError;

/// Lifecycle state of a lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockState {
    Locked,
    /// Taken over after the grace period; still held.
    Broke,
    /// Key absent or unreadable.
    Released,
}

impl LockState {
    /// Whether some owner holds the lock in this state.
    pub fn is_held(self) -> bool {
        matches!(self, Self::Locked | Self::Broke)
    }
}

/// JSON blob stored under the lock key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    /// Epoch seconds.
    pub acquired_at: f64,
    pub owner: String,
    pub state: LockState,
    /// Owner displaced by a break-in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_from: Option<String>,
}

impl LockRecord {
    /// Fresh record for `owner`.
    pub fn locked(key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            acquired_at: now_epoch(),
            owner: owner.into(),
            state: LockState::Locked,
            broken_from: None,
        }
    }

    /// Record for `owner` taking over from `previous`.
    pub fn broken(previous: &LockRecord, owner: impl Into<String>) -> Self {
        Self {
            key: previous.key.clone(),
            acquired_at: now_epoch(),
            owner: owner.into(),
            state: LockState::Broke,
            broken_from: Some(previous.owner.clone()),
        }
    }

    /// Whether `grace` has passed since acquisition.
    pub fn grace_elapsed(&self, grace: Duration, now: f64) -> bool {
        now >= self.acquired_at + grace.as_secs_f64()
    }

    pub fn encode(&self) -> Result<Vec<u8>, LockError> {
        serde_json::to_vec(self).map_err(|e| LockError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Current time in epoch seconds with microsecond precision.
pub fn now_epoch() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let record = LockRecord {
            key: "k".into(),
            acquired_at: 1_700_000_000.5,
            owner: "worker-1".into(),
            state: LockState::Locked,
            broken_from: None,
        };

        let json: serde_json::Value = serde_json::from_slice(&record.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "key": "k",
                "acquired_at": 1_700_000_000.5,
                "owner": "worker-1",
                "state": "LOCKED"
            })
        );
    }

    #[test]
    fn test_broken_record_keeps_previous_owner() {
        let held = LockRecord::locked("k", "a");
        let taken = LockRecord::broken(&held, "b");

        assert_eq!(taken.state, LockState::Broke);
        assert_eq!(taken.owner, "b");
        assert_eq!(taken.broken_from.as_deref(), Some("a"));
        assert!(taken.state.is_held());
        assert!(!LockState::Released.is_held());
    }

    #[test]
    fn test_grace_elapsed() {
        let mut record = LockRecord::locked("k", "a");
        record.acquired_at = 100.0;

        assert!(!record.grace_elapsed(Duration::from_secs(5), 104.9));
        assert!(record.grace_elapsed(Duration::from_secs(5), 105.0));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(LockRecord::decode(b"not json").is_err());
    }
}
