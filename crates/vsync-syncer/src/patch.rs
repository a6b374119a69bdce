//! JSON merge patch (RFC 7386) helpers.
//!
//! Updates to physical objects are targeted merge patches: only fields that
//! differ are sent, keys that disappeared become `null`, and fields the
//! engine does not own are never mentioned.

use serde_json::{Map, Value};

/// Compute a merge patch turning `current` into `desired`.
///
/// Returns `None` when they are equal. Objects are diffed key by key; any
/// other value (arrays included) is replaced wholesale.
pub fn merge_diff(current: &Value, desired: &Value) -> Option<Value> {
    if current == desired {
        return None;
    }

    match (current, desired) {
        (Value::Object(cur), Value::Object(des)) => {
            let mut patch = Map::new();
            for (key, des_val) in des {
                match cur.get(key) {
                    Some(cur_val) => {
                        if let Some(diff) = merge_diff(cur_val, des_val) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), des_val.clone());
                    }
                }
            }
            for key in cur.keys() {
                if !des.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Some(Value::Object(patch))
        }
        // Null members of a desired value cannot be expressed in a merge patch;
        // dropping them matches what the server stores.
        _ => Some(without_nulls(desired)),
    }
}

/// Apply a merge patch in place
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                apply_merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Remove the value at a nested object path, if present
pub fn remove_path(value: &mut Value, path: &[&str]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = value;
    for key in parents {
        match cursor.get_mut(*key) {
            Some(next) => cursor = next,
            None => return,
        }
    }
    if let Value::Object(map) = cursor {
        map.remove(*last);
    }
}

/// Mutable object at a nested path, if every segment exists and is an object
pub fn object_at_mut<'a>(
    value: &'a mut Value,
    path: &[&str],
) -> Option<&'a mut Map<String, Value>> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get_mut(*key)?;
    }
    cursor.as_object_mut()
}

/// Object stored under `key` in `map`, replacing an absent, null or
/// non-object value with an empty object first
pub fn child_object_mut<'a>(
    map: &'a mut Map<String, Value>,
    key: &str,
) -> Option<&'a mut Map<String, Value>> {
    if !map.get(key).is_some_and(Value::is_object) {
        map.insert(key.to_string(), Value::Object(Map::new()));
    }
    map.get_mut(key).and_then(Value::as_object_mut)
}

fn without_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), without_nulls(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
