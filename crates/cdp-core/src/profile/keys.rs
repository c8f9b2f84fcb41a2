//! Merge keys: dot-paths into a profile's JSON form.

use serde_json::Value;

use super::model::Profile;

/// Resolve `path` (e.g. `data.contact.email`) inside `value`.
pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// The `(path, value)` pairs of `keys` that resolve to non-null values.
pub fn merge_key_values(
    profile: &Profile,
    keys: &[String],
) -> Result<Vec<(String, Value)>, serde_json::Error> {
    let document = profile.to_value()?;
    Ok(keys
        .iter()
        .filter_map(|key| {
            resolve_path(&document, key)
                .filter(|v| !v.is_null())
                .map(|v| (key.clone(), v.clone()))
        })
        .collect())
}

/// Whether any merge key resolves to a non-null value.
pub fn needs_merge(profile: &Profile, keys: &[String]) -> bool {
    merge_key_values(profile, keys).is_ok_and(|values| !values.is_empty())
}
