//! Profile storage contract and an in-memory implementation.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::keys::resolve_path;
use super::model::Profile;
use profileflow_storage::StorageError;

/// Storage the merge engine and processor rely on.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<Profile>, StorageError>;

    /// Profiles matching ANY of the `(dot-path, value)` pairs.
    async fn find_by_fields(
        &self,
        fields: &[(String, Value)],
        limit: usize,
    ) -> Result<Vec<Profile>, StorageError>;

    async fn upsert(&self, profile: &Profile) -> Result<(), StorageError>;

    /// Make recent writes visible to queries.
    async fn refresh(&self) -> Result<(), StorageError>;

    async fn delete(&self, id: &str) -> Result<(), StorageError>;

    /// Re-point events and sessions owned by `from` to `to`; returns how
    /// many records moved.
    async fn reassign(&self, from: &str, to: &str) -> Result<usize, StorageError>;
}

/// In-memory profile store for testing.
///
/// Events and sessions are tracked only as ownership maps
/// (record id -> profile id).
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<BTreeMap<String, Profile>>,
    events: RwLock<HashMap<String, String>>,
    sessions: RwLock<HashMap<String, String>>,
    refreshes: AtomicUsize,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach_event(&self, event_id: impl Into<String>, profile_id: impl Into<String>) {
        self.events
            .write()
            .await
            .insert(event_id.into(), profile_id.into());
    }

    pub async fn attach_session(&self, session_id: impl Into<String>, profile_id: impl Into<String>) {
        self.sessions
            .write()
            .await
            .insert(session_id.into(), profile_id.into());
    }

    /// Event ids owned by `profile_id`, sorted.
    pub async fn events_of(&self, profile_id: &str) -> Vec<String> {
        owned_by(&*self.events.read().await, profile_id)
    }

    /// Session ids owned by `profile_id`, sorted.
    pub async fn sessions_of(&self, profile_id: &str) -> Vec<String> {
        owned_by(&*self.sessions.read().await, profile_id)
    }

    pub async fn len(&self) -> usize {
        self.profiles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.profiles.read().await.is_empty()
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::Relaxed)
    }
}

fn owned_by(records: &HashMap<String, String>, profile_id: &str) -> Vec<String> {
    let mut ids: Vec<String> = records
        .iter()
        .filter(|(_, owner)| owner.as_str() == profile_id)
        .map(|(id, _)| id.clone())
        .collect();
    ids.sort();
    ids
}

fn reassign_owner(records: &mut HashMap<String, String>, from: &str, to: &str) -> usize {
    let mut moved = 0;
    for owner in records.values_mut().filter(|owner| owner.as_str() == from) {
        *owner = to.to_string();
        moved += 1;
    }
    moved
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn load(&self, id: &str) -> Result<Option<Profile>, StorageError> {
        Ok(self.profiles.read().await.get(id).cloned())
    }

    async fn find_by_fields(
        &self,
        fields: &[(String, Value)],
        limit: usize,
    ) -> Result<Vec<Profile>, StorageError> {
        let profiles = self.profiles.read().await;
        let mut found = Vec::new();

        for profile in profiles.values() {
            if found.len() >= limit {
                break;
            }
            let document = serde_json::to_value(profile)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            let matches = fields
                .iter()
                .any(|(path, value)| resolve_path(&document, path) == Some(value));
            if matches {
                found.push(profile.clone());
            }
        }

        Ok(found)
    }

    async fn upsert(&self, profile: &Profile) -> Result<(), StorageError> {
        self.profiles
            .write()
            .await
            .insert(profile.id.clone(), profile.clone());
        Ok(())
    }

    async fn refresh(&self) -> Result<(), StorageError> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.profiles
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn reassign(&self, from: &str, to: &str) -> Result<usize, StorageError> {
        let events = reassign_owner(&mut *self.events.write().await, from, to);
        let sessions = reassign_owner(&mut *self.sessions.write().await, from, to);
        Ok(events + sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_email(id: &str, email: &str) -> Profile {
        let mut profile = Profile::new(id);
        profile.data.insert("contact".into(), json!({ "email": email }));
        profile
    }

    #[tokio::test]
    async fn test_find_by_fields_uses_or() {
        let store = InMemoryProfileStore::new();
        store.upsert(&with_email("a", "a@x.io")).await.unwrap();
        store.upsert(&with_email("b", "b@x.io")).await.unwrap();
        store.upsert(&with_email("c", "c@x.io")).await.unwrap();

        let fields = vec![
            ("data.contact.email".to_string(), json!("a@x.io")),
            ("data.contact.email".to_string(), json!("c@x.io")),
        ];
        let found = store.find_by_fields(&fields, 10).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|p| p.id.as_str()).collect();

        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(store.find_by_fields(&fields, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reassign_moves_events_and_sessions() {
        let store = InMemoryProfileStore::new();
        store.attach_event("e-1", "old").await;
        store.attach_event("e-2", "other").await;
        store.attach_session("s-1", "old").await;

        assert_eq!(store.reassign("old", "new").await.unwrap(), 2);
        assert_eq!(store.events_of("new").await, vec!["e-1".to_string()]);
        assert_eq!(store.sessions_of("new").await, vec!["s-1".to_string()]);
        assert!(store.events_of("old").await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_profile() {
        let store = InMemoryProfileStore::new();
        assert_eq!(
            store.delete("ghost").await.unwrap_err(),
            StorageError::NotFound("ghost".into())
        );
    }
}
