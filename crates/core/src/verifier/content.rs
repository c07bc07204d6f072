//! Field-level validation of snapshot structures.
//!
//! Each rule below catches a specific materializer defect observed in the backend: display
//! labels copied into technical names, storage type codes leaking through unparsed, complex
//! field kinds losing their metadata, and packed metadata strings that were never split.
//! Every violation is a failure.

use crate::constants::{
    CANONICAL_FIELD_TYPES, MAX_LABEL_LIKE_NAME_LEN, RAW_METADATA_DELIMITER, RAW_STORAGE_TYPE_CODES,
};
use crate::model::FormSnapshot;
use crate::normalize;
use crate::types::EntityId;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    MissingName,
    LabelUsedAsName,
    RawStorageType,
    UnknownType,
    MissingTableColumns,
    MissingCalculationFormula,
    PackedLabel,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ViolationKind::MissingName => "missing technical name",
            ViolationKind::LabelUsedAsName => "display label used as technical name",
            ViolationKind::RawStorageType => "raw storage type code",
            ViolationKind::UnknownType => "unknown field type",
            ViolationKind::MissingTableColumns => "table without tableColumns",
            ViolationKind::MissingCalculationFormula => "calculation without calculationFormula",
            ViolationKind::PackedLabel => "label contains packed metadata",
        };
        f.write_str(text)
    }
}

/// One content defect in one snapshot field.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentViolation {
    pub snapshot_id: EntityId,
    /// Field name, or `#<index>` when the field has none.
    pub field: String,
    pub kind: ViolationKind,
    pub expected: String,
    pub observed: String,
}

impl fmt::Display for ContentViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "snapshot {} field '{}': {} (expected {}, observed {})",
            self.snapshot_id, self.field, self.kind, self.expected, self.observed
        )
    }
}

fn text<'a>(field: &'a Value, keys: &[&str]) -> Option<&'a str> {
    normalize::field(field, keys).and_then(Value::as_str)
}

fn non_empty_array(field: &Value, keys: &[&str]) -> bool {
    normalize::field(field, keys)
        .and_then(Value::as_array)
        .is_some_and(|items| !items.is_empty())
}

/// Validates a single field definition.
pub fn validate_field(snapshot_id: &EntityId, index: usize, field: &Value) -> Vec<ContentViolation> {
    let mut violations = Vec::new();
    let name = text(field, &["name", "fieldName", "field_name"])
        .map(str::trim)
        .unwrap_or("");
    let field_ref = if name.is_empty() {
        format!("#{index}")
    } else {
        name.to_string()
    };
    let mut push = |kind: ViolationKind, expected: &str, observed: String| {
        violations.push(ContentViolation {
            snapshot_id: snapshot_id.clone(),
            field: field_ref.clone(),
            kind,
            expected: expected.to_string(),
            observed,
        });
    };

    if name.is_empty() {
        push(
            ViolationKind::MissingName,
            "non-empty technical name",
            "empty".into(),
        );
    } else if name.contains(' ') && name.len() > MAX_LABEL_LIKE_NAME_LEN {
        push(
            ViolationKind::LabelUsedAsName,
            "technical name without spaces",
            format!("'{name}'"),
        );
    }

    let field_type = text(field, &["type", "fieldType", "field_type"])
        .map(str::trim)
        .unwrap_or("");
    if RAW_STORAGE_TYPE_CODES.contains(&field_type) {
        push(
            ViolationKind::RawStorageType,
            "canonical field type",
            format!("'{field_type}'"),
        );
    } else if !CANONICAL_FIELD_TYPES.contains(&field_type) {
        push(
            ViolationKind::UnknownType,
            "canonical field type",
            format!("'{field_type}'"),
        );
    }

    if field_type == "table" && !non_empty_array(field, &["tableColumns", "table_columns"]) {
        push(
            ViolationKind::MissingTableColumns,
            "non-empty tableColumns",
            "absent".into(),
        );
    }

    if field_type == "calculation" {
        let formula = text(field, &["calculationFormula", "calculation_formula"])
            .map(str::trim)
            .unwrap_or("");
        if formula.is_empty() {
            push(
                ViolationKind::MissingCalculationFormula,
                "non-empty calculationFormula",
                "absent".into(),
            );
        }
    }

    if let Some(label) = text(field, &["label"]) {
        if label.contains(RAW_METADATA_DELIMITER) {
            push(
                ViolationKind::PackedLabel,
                "label without metadata delimiter",
                format!("'{label}'"),
            );
        }
    }

    violations
}

/// Validates every field of a snapshot's frozen structure.
pub fn validate_snapshot(snapshot: &FormSnapshot) -> Vec<ContentViolation> {
    snapshot
        .structure
        .fields
        .iter()
        .enumerate()
        .flat_map(|(index, field)| validate_field(&snapshot.id, index, field))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kinds(field: Value) -> Vec<ViolationKind> {
        validate_field(&EntityId::Num(1), 0, &field)
            .into_iter()
            .map(|v| v.kind)
            .collect()
    }

    #[test]
    fn test_well_formed_fields_pass() {
        assert!(kinds(json!({"name": "heart_rate", "label": "Heart rate", "type": "number"})).is_empty());
        assert!(kinds(json!({
            "name": "ae_table",
            "type": "table",
            "tableColumns": [{"name": "term", "type": "text"}]
        }))
        .is_empty());
        assert!(kinds(json!({
            "name": "bmi",
            "type": "calculation",
            "calculationFormula": "weight_kg / ((height_cm / 100) ^ 2)"
        }))
        .is_empty());
    }

    #[test]
    fn test_label_as_name_heuristic() {
        assert_eq!(
            kinds(json!({"name": "Date of the assessment visit", "type": "date"})),
            vec![ViolationKind::LabelUsedAsName]
        );
        // Short names with a space are tolerated.
        assert!(kinds(json!({"name": "pain level", "type": "number"})).is_empty());
        assert_eq!(kinds(json!({"type": "text"})), vec![ViolationKind::MissingName]);
    }

    #[test]
    fn test_type_rules() {
        assert_eq!(
            kinds(json!({"name": "dob", "type": "DATE"})),
            vec![ViolationKind::RawStorageType]
        );
        assert_eq!(
            kinds(json!({"name": "dob", "type": "calendar"})),
            vec![ViolationKind::UnknownType]
        );
        assert_eq!(
            kinds(json!({"name": "meds", "type": "table", "tableColumns": []})),
            vec![ViolationKind::MissingTableColumns]
        );
        assert_eq!(
            kinds(json!({"name": "bmi", "type": "calculation"})),
            vec![ViolationKind::MissingCalculationFormula]
        );
    }

    #[test]
    fn test_packed_label_detected() {
        let violations = validate_field(
            &EntityId::Num(9),
            3,
            &json!({"name": "sex", "type": "radio", "label": "Sex||options:M,F||required"}),
        );
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::PackedLabel);
        assert_eq!(violations[0].field, "sex");
        assert!(violations[0].to_string().contains("snapshot 9"));
    }
}
