//! Recursive JSON merge that records the values it discards.

use serde_json::{Map, Value};

use crate::config::{ConflictStrategy, ListMergeRule};

/// A value that lost a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub path: String,
    pub value: Value,
}

/// Merges JSON documents field by field.
///
/// Objects merge per key, lists concatenate, null never overrides a value,
/// and two different non-null leaves are settled by the conflict strategy
/// with the loser kept in `conflicts`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepMerge {
    pub strategy: ConflictStrategy,
    pub list_rule: ListMergeRule,
}

impl DeepMerge {
    pub fn new(strategy: ConflictStrategy, list_rule: ListMergeRule) -> Self {
        Self {
            strategy,
            list_rule,
        }
    }

    /// Merge `incoming` into `base`. `path` prefixes recorded conflicts.
    pub fn merge(&self, base: &mut Value, incoming: &Value, path: &str, conflicts: &mut Vec<Conflict>) {
        match (base, incoming) {
            (_, Value::Null) => {}
            (base @ Value::Null, incoming) => *base = incoming.clone(),
            (Value::Object(target), Value::Object(source)) => {
                self.merge_maps(target, source, path, conflicts);
            }
            (Value::Array(target), Value::Array(source)) => self.extend_list(target, source),
            (Value::Array(target), scalar) => self.extend_list(target, std::slice::from_ref(scalar)),
            (base, Value::Array(source)) => {
                let mut list = vec![base.clone()];
                self.extend_list(&mut list, source);
                *base = Value::Array(list);
            }
            (base, incoming) if base == incoming => {}
            (base, incoming) => {
                let loser = match self.strategy {
                    ConflictStrategy::LastWins => std::mem::replace(base, incoming.clone()),
                    ConflictStrategy::FirstWins => incoming.clone(),
                };
                conflicts.push(Conflict {
                    path: path.to_string(),
                    value: loser,
                });
            }
        }
    }

    pub fn merge_maps(
        &self,
        target: &mut Map<String, Value>,
        source: &Map<String, Value>,
        path: &str,
        conflicts: &mut Vec<Conflict>,
    ) {
        for (key, value) in source {
            let child = join_path(path, key);
            match target.get_mut(key) {
                Some(existing) => self.merge(existing, value, &child, conflicts),
                None => {
                    if !value.is_null() {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }

    fn extend_list(&self, target: &mut Vec<Value>, items: &[Value]) {
        for item in items {
            if self.list_rule == ListMergeRule::KeepAll || !target.contains(item) {
                target.push(item.clone());
            }
        }
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Append `conflicts` to `aux.conflicts.<path>`, skipping values already recorded.
pub fn record_conflicts(aux: &mut Map<String, Value>, conflicts: Vec<Conflict>) {
    if conflicts.is_empty() {
        return;
    }

    let entry = aux
        .entry(super::model::CONFLICTS_KEY)
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }

    if let Value::Object(by_path) = entry {
        for conflict in conflicts {
            let slot = by_path
                .entry(conflict.path)
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(values) = slot {
                if !values.contains(&conflict.value) {
                    values.push(conflict.value);
                }
            } else {
                let previous = slot.take();
                *slot = Value::Array(vec![previous, conflict.value]);
            }
        }
    }
}
