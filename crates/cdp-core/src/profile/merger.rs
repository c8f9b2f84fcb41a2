//! ProfileMerger - collapses duplicate profiles into one record.
//!
//! Duplicates are found by querying the store for any profile sharing a
//! merge-key value with the subject. The merge is field-aware: counters sum,
//! sets union, lists concatenate and conflicting scalars resolve by the
//! configured strategy with the losing value recorded under
//! `aux.conflicts`.
//!
//! Callers must hold the subject's profile lock; the merger takes none.

use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::deep_merge::{record_conflicts, DeepMerge};
use super::keys::merge_key_values;
use super::model::{Profile, CONFLICTS_KEY};
use super::store::ProfileStore;
use super::MergeError;
use crate::config::MergeConfig;

/// Result of a merge attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// Merged record, `None` when there was nothing to merge.
    pub merged: Option<Profile>,
    /// Profiles consumed by the merge.
    pub duplicates: Vec<Profile>,
}

impl MergeOutcome {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_merged(&self) -> bool {
        self.merged.is_some()
    }
}

/// Finds and merges duplicates of a profile.
pub struct ProfileMerger<S: ?Sized> {
    store: Arc<S>,
    config: MergeConfig,
}

impl<S: ProfileStore + ?Sized> ProfileMerger<S> {
    pub fn new(store: Arc<S>, config: MergeConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Merge `subject` with every stored profile sharing a merge-key value.
    ///
    /// # Errors
    ///
    /// Fails only if the candidate query or the write of the merged profile
    /// fails. Reassigning and deleting duplicates is best effort.
    #[instrument(skip(self, subject), fields(profile_id = %subject.id))]
    pub async fn merge(&self, subject: &Profile) -> Result<MergeOutcome, MergeError> {
        let fields = merge_key_values(subject, &self.config.merge_keys)
            .map_err(|e| MergeError::Serialization(e.to_string()))?;
        if fields.is_empty() {
            debug!("No merge key set, nothing to merge");
            return Ok(MergeOutcome::none());
        }

        let duplicates: Vec<Profile> = self
            .store
            .find_by_fields(&fields, self.config.max_candidates)
            .await?
            .into_iter()
            .filter(|candidate| candidate.id != subject.id)
            .collect();

        if duplicates.is_empty() {
            debug!("No duplicates found");
            return Ok(MergeOutcome::none());
        }

        let merged = merge_profiles(subject, &duplicates, &self.config);

        self.store.upsert(&merged).await?;
        self.store.refresh().await?;

        for duplicate in &duplicates {
            match self.store.reassign(&duplicate.id, &merged.id).await {
                Ok(moved) => debug!(from = %duplicate.id, moved, "Reassigned records"),
                Err(e) => warn!(from = %duplicate.id, error = %e, "Failed to reassign records"),
            }
        }

        let deletions = duplicates.iter().map(|d| self.store.delete(&d.id));
        for (duplicate, result) in duplicates.iter().zip(join_all(deletions).await) {
            if let Err(e) = result {
                warn!(
                    duplicate_id = %duplicate.id,
                    error = %e,
                    "Storage conflict deleting merged duplicate"
                );
            }
        }

        info!(
            merged_id = %merged.id,
            duplicates = duplicates.len(),
            "Merged duplicate profiles"
        );

        Ok(MergeOutcome {
            merged: Some(merged),
            duplicates,
        })
    }
}

/// Merge `duplicates` and `subject` into one profile carrying the subject id.
///
/// Duplicates are applied oldest first (insert time, then id) and the
/// subject last, so with `LastWins` the subject's values prevail.
pub fn merge_profiles(subject: &Profile, duplicates: &[Profile], config: &MergeConfig) -> Profile {
    let mut ordered: Vec<&Profile> = duplicates.iter().collect();
    ordered.sort_by(|a, b| {
        a.metadata
            .time
            .insert
            .cmp(&b.metadata.time.insert)
            .then_with(|| a.id.cmp(&b.id))
    });
    ordered.push(subject);

    let deep = DeepMerge::new(config.conflict_strategy, config.list_rule);
    let mut conflicts = Vec::new();
    let mut merged = Profile::new(subject.id.clone());
    merged.metadata.time.insert = subject.metadata.time.insert;

    for profile in &ordered {
        merged.ids.extend(profile.all_ids());

        let time = &profile.metadata.time;
        let target = &mut merged.metadata.time;
        target.insert = target.insert.min(time.insert);
        target.visit.current = target.visit.current.max(time.visit.current);
        target.visit.last = target.visit.last.max(time.visit.last);
        target.visit.count = target.visit.count.saturating_add(time.visit.count);

        deep.merge_maps(&mut merged.traits, &profile.traits, "traits", &mut conflicts);
        deep.merge_maps(&mut merged.data, &profile.data, "data", &mut conflicts);

        let mut aux = profile.aux.clone();
        let earlier_conflicts = aux.remove(CONFLICTS_KEY);
        deep.merge_maps(&mut merged.aux, &aux, "aux", &mut conflicts);
        if let Some(Value::Object(by_path)) = earlier_conflicts {
            carry_conflicts(&mut merged.aux, by_path);
        }

        merged.stats.views = merged.stats.views.saturating_add(profile.stats.views);
        merged.stats.visits = merged.stats.visits.saturating_add(profile.stats.visits);
        for (name, value) in &profile.stats.counters {
            *merged.stats.counters.entry(name.clone()).or_default() += value;
        }

        merged.segments.extend(profile.segments.iter().cloned());
        merged
            .consents
            .extend(profile.consents.iter().map(|(k, v)| (k.clone(), v.clone())));
        for (interest, weight) in &profile.interests {
            *merged.interests.entry(interest.clone()).or_default() += weight;
        }
    }

    record_conflicts(&mut merged.aux, conflicts);
    merged
}

/// Keep conflicts recorded by earlier merges.
fn carry_conflicts(aux: &mut serde_json::Map<String, Value>, by_path: serde_json::Map<String, Value>) {
    let carried = by_path
        .into_iter()
        .flat_map(|(path, values)| {
            let values = match values {
                Value::Array(values) => values,
                other => vec![other],
            };
            values
                .into_iter()
                .map(move |value| super::deep_merge::Conflict {
                    path: path.clone(),
                    value,
                })
        })
        .collect();
    record_conflicts(aux, carried);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::InMemoryProfileStore;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn with_email(id: &str, email: &str) -> Profile {
        let mut profile = Profile::new(id);
        profile.data.insert("contact".into(), json!({ "email": email }));
        profile
    }

    fn config() -> MergeConfig {
        MergeConfig::default()
    }

    #[tokio::test]
    async fn test_no_candidates_is_noop() {
        let store = Arc::new(InMemoryProfileStore::new());
        let merger = ProfileMerger::new(store.clone(), config());

        let subject = with_email("a", "a@x.io");
        assert_eq!(merger.merge(&subject).await.unwrap(), MergeOutcome::none());

        store.upsert(&subject).await.unwrap();
        assert_eq!(merger.merge(&subject).await.unwrap(), MergeOutcome::none());
    }

    #[tokio::test]
    async fn test_no_merge_key_is_noop() {
        let store = Arc::new(InMemoryProfileStore::new());
        store.upsert(&Profile::new("b")).await.unwrap();
        let merger = ProfileMerger::new(store, config());

        assert!(!merger.merge(&Profile::new("a")).await.unwrap().is_merged());
    }

    #[test]
    fn test_counters_sum() {
        let mut a = Profile::new("a");
        a.stats.views = 1;
        a.stats.counters.insert("orders".into(), 2.0);
        let mut b = Profile::new("b");
        b.stats.views = 2;
        b.stats.counters.insert("orders".into(), 3.0);

        let merged = merge_profiles(&a, &[b], &config());
        assert_eq!(merged.stats.views, 3);
        assert_eq!(merged.stats.counters["orders"], 5.0);
    }

    #[test]
    fn test_totals_saturate() {
        let mut a = Profile::new("a");
        a.stats.views = u64::MAX - 1;
        a.stats.visits = u64::MAX;
        a.metadata.time.visit.count = u64::MAX;
        let mut b = Profile::new("b");
        b.stats.views = 5;
        b.stats.visits = 1;
        b.metadata.time.visit.count = 3;

        let merged = merge_profiles(&a, &[b], &config());
        assert_eq!(merged.stats.views, u64::MAX);
        assert_eq!(merged.stats.visits, u64::MAX);
        assert_eq!(merged.metadata.time.visit.count, u64::MAX);
    }

    #[test]
    fn test_segments_union() {
        let mut a = Profile::new("a");
        a.segments.insert("vip".into());
        let mut b = Profile::new("b");
        b.segments.insert("new".into());

        let merged = merge_profiles(&a, &[b], &config());
        assert_eq!(
            merged.segments,
            BTreeSet::from(["vip".to_string(), "new".to_string()])
        );
    }

    #[test]
    fn test_traits_lists_concat_and_scalars_conflict() {
        let now = Utc::now();
        let mut a = Profile::new("a");
        a.metadata.time.insert = now - Duration::days(2);
        a.traits.insert("x".into(), json!([1]));
        a.traits.insert("y".into(), json!("a"));

        let mut b = Profile::new("b");
        b.metadata.time.insert = now;
        b.traits.insert("x".into(), json!([2]));
        b.traits.insert("y".into(), json!("b"));

        // `b` is the subject, so it is applied last and wins.
        let merged = merge_profiles(&b, &[a], &config());

        assert_eq!(merged.traits["x"], json!([1, 2]));
        assert_eq!(merged.traits["y"], json!("b"));
        assert_eq!(
            merged.conflicts().unwrap()["traits.y"],
            json!(["a"])
        );
    }

    #[test]
    fn test_identity_and_timestamps() {
        let now = Utc::now();
        let mut subject = Profile::new("s");
        subject.metadata.time.insert = now;
        subject.metadata.time.visit.current = Some(now);
        subject.metadata.time.visit.count = 2;
        subject.consents.insert("email".into(), json!({"granted": true}));
        subject.interests.insert("shoes".into(), 1.5);

        let mut old = Profile::new("d");
        old.ids.insert("legacy".into());
        old.metadata.time.insert = now - Duration::days(30);
        old.metadata.time.visit.current = Some(now + Duration::minutes(5));
        old.metadata.time.visit.count = 3;
        old.consents.insert("email".into(), json!({"granted": false}));
        old.interests.insert("shoes".into(), 0.5);

        let merged = merge_profiles(&subject, &[old], &config());

        assert_eq!(merged.id, "s");
        assert_eq!(
            merged.ids,
            BTreeSet::from(["s".to_string(), "d".to_string(), "legacy".to_string()])
        );
        assert_eq!(merged.metadata.time.insert, now - Duration::days(30));
        assert_eq!(merged.metadata.time.visit.current, Some(now + Duration::minutes(5)));
        assert_eq!(merged.metadata.time.visit.count, 5);
        assert_eq!(merged.consents["email"], json!({"granted": true}));
        assert_eq!(merged.interests["shoes"], 2.0);
    }

    #[test]
    fn test_earlier_conflicts_survive() {
        let mut a = Profile::new("a");
        a.aux.insert(CONFLICTS_KEY.into(), json!({"traits.z": ["old"]}));
        let b = Profile::new("b");

        let merged = merge_profiles(&b, &[a], &config());
        assert_eq!(merged.conflicts().unwrap()["traits.z"], json!(["old"]));
    }

    #[tokio::test]
    async fn test_merge_persists_and_cleans_up() {
        let store = Arc::new(InMemoryProfileStore::new());

        let mut duplicate = with_email("dup", "same@x.io");
        duplicate.stats.views = 2;
        store.upsert(&duplicate).await.unwrap();
        store.attach_event("e-1", "dup").await;
        store.attach_session("s-1", "dup").await;

        let mut subject = with_email("main", "same@x.io");
        subject.stats.views = 1;
        store.upsert(&subject).await.unwrap();

        let merger = ProfileMerger::new(store.clone(), config());
        let outcome = merger.merge(&subject).await.unwrap();

        let merged = outcome.merged.unwrap();
        assert_eq!(merged.stats.views, 3);
        assert_eq!(outcome.duplicates.len(), 1);
        assert_eq!(outcome.duplicates[0].id, "dup");

        assert_eq!(store.load("main").await.unwrap(), Some(merged));
        assert_eq!(store.load("dup").await.unwrap(), None);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.events_of("main").await, vec!["e-1".to_string()]);
        assert_eq!(store.sessions_of("main").await, vec!["s-1".to_string()]);
        assert_eq!(store.refresh_count(), 1);
    }
}
