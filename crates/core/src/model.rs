//! Typed views of backend payloads.
//!
//! Every struct here is deserialized from an already-normalized payload (see
//! [`crate::normalize`]). Snake-case spellings are accepted through serde aliases because the
//! backend emits both.

use crate::types::EntityId;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(alias = "access_token", alias = "token")]
    pub access_token: String,
    #[serde(default, alias = "refresh_token")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Option<UserSummary>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: EntityId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "organization_id")]
    pub organization_id: Option<EntityId>,
}

/// A scheduled (or unscheduled) visit instance for one patient.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEvent {
    pub id: EntityId,
    #[serde(alias = "event_definition_id", alias = "studyEventDefinitionId")]
    pub event_definition_id: EntityId,
    #[serde(default, alias = "event_name")]
    pub event_name: Option<String>,
    #[serde(default, alias = "start_date")]
    pub start_date: Option<String>,
    #[serde(default, alias = "is_unscheduled")]
    pub is_unscheduled: bool,
}

/// A template form assigned to an event definition, as seen from a visit instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitForm {
    #[serde(alias = "form_id", alias = "crfId")]
    pub form_id: EntityId,
    #[serde(default, alias = "form_name", alias = "name")]
    pub form_name: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, alias = "double_entry")]
    pub double_entry: bool,
    #[serde(default, alias = "electronic_signature")]
    pub electronic_signature: bool,
    #[serde(default)]
    pub hidden: bool,
}

/// A patient-visit copy of a template form.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormSnapshot {
    pub id: EntityId,
    #[serde(default, alias = "patient_event_id")]
    pub patient_event_id: Option<EntityId>,
    /// Source template the snapshot was materialized from.
    #[serde(alias = "form_id", alias = "templateId")]
    pub form_id: EntityId,
    #[serde(default, alias = "form_name")]
    pub form_name: Option<String>,
    #[serde(default, alias = "form_structure", deserialize_with = "json_or_packed_string")]
    pub structure: SnapshotStructure,
    #[serde(default, alias = "form_data", deserialize_with = "json_or_packed_string")]
    pub data: Map<String, Value>,
    #[serde(default, alias = "is_locked")]
    pub locked: bool,
    #[serde(default, alias = "is_frozen")]
    pub frozen: bool,
}

/// Frozen structural copy of a template. Fields are kept raw so content validation can see
/// exactly what the materializer produced.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SnapshotStructure {
    #[serde(default)]
    pub fields: Vec<Value>,
}

/// Accepts either a JSON value or a string containing JSON; the backend stores some columns
/// as text and returns them unparsed.
fn json_or_packed_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(T::default()),
        Value::String(s) if s.trim().is_empty() => Ok(T::default()),
        Value::String(s) => serde_json::from_str(&s).map_err(serde::de::Error::custom),
        other => serde_json::from_value(other).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_accepts_snake_case_and_packed_structure() {
        let raw = json!({
            "id": 41,
            "patient_event_id": 7,
            "form_id": 3,
            "form_structure": "{\"fields\":[{\"name\":\"heart_rate\",\"type\":\"number\"}]}",
            "form_data": {"heart_rate": "72"},
            "is_locked": true
        });

        let snapshot: FormSnapshot = serde_json::from_value(raw).unwrap();
        assert_eq!(snapshot.id, EntityId::Num(41));
        assert_eq!(snapshot.form_id, EntityId::Num(3));
        assert_eq!(snapshot.structure.fields.len(), 1);
        assert_eq!(snapshot.data["heart_rate"], json!("72"));
        assert!(snapshot.locked);
        assert!(!snapshot.frozen);
    }

    #[test]
    fn test_visit_form_defaults_flags() {
        let form: VisitForm = serde_json::from_value(json!({"crfId": "f-1"})).unwrap();
        assert_eq!(form.form_id, EntityId::Text("f-1".into()));
        assert!(!form.required && !form.hidden);
    }
}
