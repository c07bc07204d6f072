//! Snapshot data round-trips.
//!
//! Data written to a snapshot must read back with the same values. The backend stores form
//! data as text, so values are compared after string coercion (`72` and `"72"` are equal).

use crate::client::{ApiRequest, ApiResponse};
use crate::normalize;
use crate::types::EntityId;
use crate::EdcClient;
use serde_json::{json, Map, Value};
use std::fmt;

/// A key whose value did not survive the round-trip.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundTripMismatch {
    pub key: String,
    pub expected: String,
    /// `None` when the key was absent from the fetched data.
    pub observed: Option<String>,
}

impl fmt::Display for RoundTripMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.observed {
            Some(observed) => write!(
                f,
                "'{}': expected '{}', observed '{}'",
                self.key, self.expected, observed
            ),
            None => write!(f, "'{}': expected '{}', key absent", self.key, self.expected),
        }
    }
}

/// Compares `keys` of `written` against `fetched`. An empty `keys` checks every written key.
pub fn compare(
    written: &Map<String, Value>,
    fetched: &Map<String, Value>,
    keys: &[&str],
) -> Vec<RoundTripMismatch> {
    let checked: Vec<&str> = if keys.is_empty() {
        written.keys().map(String::as_str).collect()
    } else {
        keys.to_vec()
    };

    checked
        .into_iter()
        .filter_map(|key| {
            let expected = normalize::coerce_to_string(written.get(key)?);
            let observed = fetched.get(key).map(normalize::coerce_to_string);
            (observed.as_deref() != Some(expected.as_str())).then(|| RoundTripMismatch {
                key: key.to_string(),
                expected,
                observed,
            })
        })
        .collect()
}

/// Writes `data` to a snapshot. The response is returned as-is for the caller to judge.
pub async fn save(
    client: &EdcClient,
    snapshot_id: &EntityId,
    data: &Map<String, Value>,
    quiet: bool,
) -> ApiResponse {
    let mut request = ApiRequest::put(format!("/events/patient-form/{snapshot_id}/data"))
        .json(json!({ "data": data }));
    if quiet {
        request = request.quiet();
    }
    client.call(request).await
}

/// Fetches a snapshot's current data, or `None` if the call fails or the payload is not an
/// object.
pub async fn fetch(client: &EdcClient, snapshot_id: &EntityId) -> Option<Map<String, Value>> {
    let response = client
        .call(ApiRequest::get(format!("/events/patient-form/{snapshot_id}/data")))
        .await;
    if !response.ok {
        return None;
    }
    match response.data {
        Value::Object(map) => Some(map),
        Value::Null => Some(Map::new()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_string_coercion_equality() {
        let written = map(json!({"assessment_date": "2026-02-17", "pain_level": "4", "heart_rate": 72}));
        let fetched = map(json!({"assessment_date": "2026-02-17", "pain_level": 4, "heart_rate": "72"}));
        assert!(compare(&written, &fetched, &[]).is_empty());
    }

    #[test]
    fn test_absent_and_changed_keys_reported() {
        let written = map(json!({"a": "1", "b": "2", "c": "3"}));
        let fetched = map(json!({"a": "1", "b": "20"}));

        let mismatches = compare(&written, &fetched, &[]);
        assert_eq!(mismatches.len(), 2);
        assert_eq!(mismatches[0].key, "b");
        assert_eq!(mismatches[0].observed.as_deref(), Some("20"));
        assert_eq!(mismatches[1].key, "c");
        assert!(mismatches[1].observed.is_none());
    }

    #[test]
    fn test_subset_only_checks_named_keys() {
        let written = map(json!({"a": "1", "b": "2"}));
        let fetched = map(json!({"a": "1"}));
        assert!(compare(&written, &fetched, &["a"]).is_empty());
        assert_eq!(compare(&written, &fetched, &["b"]).len(), 1);
    }
}
