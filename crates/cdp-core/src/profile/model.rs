//! The canonical customer profile.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Key under `aux` holding values discarded by merges.
pub const CONFLICTS_KEY: &str = "conflicts";

/// One customer's record.
///
/// Owned by whoever holds the profile lock; every other copy may be stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    /// Ids of profiles merged into this one.
    #[serde(default)]
    pub ids: BTreeSet<String>,
    #[serde(default)]
    pub metadata: ProfileMetadata,
    #[serde(default)]
    pub traits: Map<String, Value>,
    /// Structured data (`pii`, `contact`, ...).
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub stats: ProfileStats,
    #[serde(default)]
    pub segments: BTreeSet<String>,
    #[serde(default)]
    pub consents: BTreeMap<String, Value>,
    #[serde(default)]
    pub interests: BTreeMap<String, f64>,
    #[serde(default)]
    pub aux: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    #[serde(default)]
    pub time: ProfileTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileTime {
    pub insert: DateTime<Utc>,
    #[serde(default)]
    pub visit: VisitTime,
}

impl Default for ProfileTime {
    fn default() -> Self {
        Self {
            insert: Utc::now(),
            visit: VisitTime::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisitTime {
    pub current: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
    #[serde(default)]
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileStats {
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub visits: u64,
    /// Named counters.
    #[serde(default)]
    pub counters: BTreeMap<String, f64>,
}

impl Profile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ids: BTreeSet::new(),
            metadata: ProfileMetadata::default(),
            traits: Map::new(),
            data: Map::new(),
            stats: ProfileStats::default(),
            segments: BTreeSet::new(),
            consents: BTreeMap::new(),
            interests: BTreeMap::new(),
            aux: Map::new(),
        }
    }

    /// Own id followed by every alias.
    pub fn all_ids(&self) -> BTreeSet<String> {
        let mut ids = self.ids.clone();
        ids.insert(self.id.clone());
        ids
    }

    /// Start a new visit at `at`.
    pub fn record_visit(&mut self, at: DateTime<Utc>) {
        let visit = &mut self.metadata.time.visit;
        visit.last = visit.current.take();
        visit.current = Some(at);
        visit.count = visit.count.saturating_add(1);
        self.stats.visits = self.stats.visits.saturating_add(1);
    }

    /// Losing values recorded by merges, keyed by dot-path.
    pub fn conflicts(&self) -> Option<&Map<String, Value>> {
        self.aux.get(CONFLICTS_KEY).and_then(Value::as_object)
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_record_visit_rolls_current() {
        let mut profile = Profile::new("p-1");
        let first = Utc::now();
        let second = first + Duration::minutes(30);

        profile.record_visit(first);
        profile.record_visit(second);

        let visit = &profile.metadata.time.visit;
        assert_eq!(visit.current, Some(second));
        assert_eq!(visit.last, Some(first));
        assert_eq!(visit.count, 2);
        assert_eq!(profile.stats.visits, 2);
    }

    #[test]
    fn test_deserialize_sparse_document() {
        let profile: Profile = serde_json::from_value(serde_json::json!({
            "id": "p-9",
            "metadata": {"time": {"insert": "2024-01-01T00:00:00Z"}},
            "segments": ["vip"]
        }))
        .unwrap();

        assert_eq!(profile.id, "p-9");
        assert!(profile.segments.contains("vip"));
        assert_eq!(profile.stats.views, 0);
        assert_eq!(profile.all_ids(), BTreeSet::from(["p-9".to_string()]));
    }
}
