//! Response normalization.
//!
//! The backend is inconsistent about response shapes: some routes return the entity directly,
//! some wrap it as `{"success": true, "data": ...}`, a few double-wrap, and list routes
//! sometimes answer `{"data": {"items": [...]}}`. All of that is resolved here, once, at the
//! client boundary. Code downstream of [`crate::client::EdcClient`] always sees the innermost
//! payload; key-casing variants are absorbed by serde aliases in [`crate::model`].

use crate::types::EntityId;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Keys that may accompany `data` in a response envelope.
const ENVELOPE_KEYS: &[&str] = &[
    "success", "message", "status", "meta", "pagination", "total", "count", "code", "error",
    "timestamp",
];

/// Keys under which list routes nest their rows.
const LIST_KEYS: &[&str] = &["items", "rows", "results", "records", "list"];

/// Unwraps response envelopes until the innermost payload is reached.
pub fn payload(body: Value) -> Value {
    let mut current = body;
    loop {
        match current {
            Value::Object(mut map)
                if map.contains_key("data")
                    && map
                        .keys()
                        .all(|k| k == "data" || ENVELOPE_KEYS.contains(&k.as_str())) =>
            {
                current = map.remove("data").unwrap_or(Value::Null);
            }
            other => return other,
        }
    }
}

/// Extracts rows from a normalized list payload.
///
/// Accepts a bare array or an object nesting the array under one of the common list keys.
/// Anything else yields no rows.
pub fn rows(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => LIST_KEYS
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array))
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Deserializes every row that fits `T`, logging and skipping the ones that do not.
pub fn typed_rows<T: DeserializeOwned>(value: &Value) -> Vec<T> {
    rows(value)
        .into_iter()
        .filter_map(|row| match serde_json::from_value::<T>(row) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("skipping unparseable row: {}", e);
                None
            }
        })
        .collect()
}

/// Returns the first present, non-null value among `keys`.
pub fn field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .find(|v| !v.is_null())
}

/// Reads an entity id from `value`, trying `keys` in order and then `id`.
pub fn id(value: &Value, keys: &[&str]) -> Option<EntityId> {
    keys.iter()
        .chain(std::iter::once(&"id"))
        .filter_map(|k| value.get(*k))
        .find_map(EntityId::from_value)
}

/// Reads a count, accepting numbers and numeric strings.
pub fn count(value: &Value, keys: &[&str]) -> Option<u64> {
    field(value, keys).and_then(|v| match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Reads a boolean flag, accepting `true`/`false`, `0`/`1` and their string forms.
pub fn flag(value: &Value, keys: &[&str]) -> Option<bool> {
    field(value, keys).and_then(|v| match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

/// Produces a human-readable error message from a response body.
///
/// Prefers a `message` string, then an `error` string or `error.message`, and finally the
/// serialized body itself.
pub fn error_message(body: &Value) -> String {
    if let Some(message) = body.get("message").and_then(Value::as_str) {
        return message.to_string();
    }
    match body.get("error") {
        Some(Value::String(s)) => return s.clone(),
        Some(err) => {
            if let Some(message) = err.get("message").and_then(Value::as_str) {
                return message.to_string();
            }
        }
        None => {}
    }
    match body {
        Value::Null => String::from("empty response"),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Renders a JSON value the way the backend stores form data: everything as text.
pub fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_unwraps_envelopes() {
        assert_eq!(payload(json!({"success": true, "data": {"id": 3}})), json!({"id": 3}));
        assert_eq!(
            payload(json!({"data": {"success": true, "data": [1, 2]}})),
            json!([1, 2])
        );
        assert_eq!(payload(json!([{"id": 1}])), json!([{"id": 1}]));
    }

    #[test]
    fn test_payload_keeps_entities_with_a_data_field() {
        let snapshot = json!({"id": 4, "data": {"pain_level": "4"}, "locked": false});
        assert_eq!(payload(snapshot.clone()), snapshot);
    }

    #[test]
    fn test_rows_accepts_nested_lists() {
        assert_eq!(rows(&json!({"items": [1, 2]})), vec![json!(1), json!(2)]);
        assert_eq!(rows(&json!([3])), vec![json!(3)]);
        assert!(rows(&json!({"id": 1})).is_empty());
    }

    #[test]
    fn test_error_message_preference() {
        assert_eq!(error_message(&json!({"message": "nope", "error": "x"})), "nope");
        assert_eq!(error_message(&json!({"error": {"message": "deep"}})), "deep");
        assert_eq!(error_message(&json!({"error": "flat"})), "flat");
        assert_eq!(error_message(&json!({"detail": 1})), r#"{"detail":1}"#);
        assert_eq!(error_message(&Value::Null), "empty response");
    }

    #[test]
    fn test_scalar_readers() {
        let body = json!({"missing_count": "2", "valid": 1, "formId": 9});
        assert_eq!(count(&body, &["missingCount", "missing_count"]), Some(2));
        assert_eq!(flag(&body, &["valid"]), Some(true));
        assert_eq!(id(&body, &["formId"]), Some(EntityId::Num(9)));
        assert_eq!(coerce_to_string(&json!(72)), "72");
        assert_eq!(coerce_to_string(&json!("4")), "4");
    }
}
