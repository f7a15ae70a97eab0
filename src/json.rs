//! JSON value helpers shared by the store and synchronizer layers.
//!
//! Remote payloads arrive with inconsistent key casing depending on which
//! backend version produced them, so field extraction tries every known
//! spelling.

use serde_json::{Map, Value};

/// Get a trimmed, non-empty string field trying multiple key spellings.
pub(crate) fn str_any(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Get a numeric field trying multiple key spellings. Accepts numbers and
/// numeric strings.
pub(crate) fn num_any(value: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match value.get(key) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(v) = s.trim().parse::<f64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

/// Get an integer field trying multiple key spellings.
pub(crate) fn i64_any(value: &Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        match value.get(key) {
            Some(Value::Number(n)) => {
                if let Some(v) = n.as_i64() {
                    return Some(v);
                }
                if let Some(v) = n.as_f64() {
                    return Some(v.round() as i64);
                }
            }
            Some(Value::String(s)) => {
                if let Ok(v) = s.trim().parse::<i64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

/// Merge `incoming` over `existing`.
///
/// For two objects: keys present in `incoming` with non-null values override,
/// keys absent (or null) in `incoming` keep their existing value. This is the
/// upsert merge rule: a writer that does not know about a field (e.g. a
/// `backendId` assigned by a concurrent writer) cannot erase it.
///
/// For non-objects, `incoming` wins outright.
pub(crate) fn merge_objects(existing: &Value, incoming: &Value) -> Value {
    match (existing, incoming) {
        (Value::Object(old), Value::Object(new)) => {
            let mut merged: Map<String, Value> = old.clone();
            for (key, value) in new {
                if value.is_null() {
                    continue;
                }
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => incoming.clone(),
    }
}

/// Remove local-only bookkeeping keys from a wire payload.
pub(crate) fn strip_keys(value: &Value, keys: &[&str]) -> Value {
    match value {
        Value::Object(map) => {
            let mut stripped = map.clone();
            for key in keys {
                stripped.remove(*key);
            }
            Value::Object(stripped)
        }
        other => other.clone(),
    }
}
