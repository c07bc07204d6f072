//! Entities the harness creates on the backend.
//!
//! Unique keys (usernames, form names, protocol number, subject label, event names) are fixed
//! so that re-running a step finds what an earlier run created instead of duplicating it.

use serde_json::{json, Value};

pub const STUDY_NAME: &str = "Harness Snapshot Integrity Study";
pub const STUDY_PROTOCOL_NUMBER: &str = "HARNESS-001";
pub const SUBJECT_LABEL: &str = "HRN-001";
pub const FORK_SUFFIX: &str = " (Fork)";
pub const UNSCHEDULED_REASON: &str = "Harness unscheduled visit";
pub const QUERY_DESCRIPTION: &str = "Harness: please confirm the recorded heart rate";

/// Data written by the round-trip check.
pub fn round_trip_payload() -> Value {
    json!({
        "assessment_date": "2026-02-17",
        "pain_level": "4",
        "heart_rate": 72
    })
}

/// A payload that omits the required `assessment_date`.
pub fn incomplete_payload() -> Value {
    json!({
        "pain_level": "9",
        "heart_rate": 140
    })
}

#[derive(Debug, Clone)]
pub struct MemberFixture {
    pub username: &'static str,
    pub email: &'static str,
    pub first_name: &'static str,
    pub last_name: &'static str,
    pub role: &'static str,
}

pub fn members() -> Vec<MemberFixture> {
    vec![
        MemberFixture {
            username: "harness.coordinator",
            email: "harness.coordinator@example.org",
            first_name: "Casey",
            last_name: "Coordinator",
            role: "coordinator",
        },
        MemberFixture {
            username: "harness.monitor",
            email: "harness.monitor@example.org",
            first_name: "Morgan",
            last_name: "Monitor",
            role: "monitor",
        },
    ]
}

#[derive(Debug, Clone)]
pub struct FormFixture {
    pub name: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub fields: Value,
    pub required: bool,
    pub double_entry: bool,
    pub electronic_signature: bool,
}

impl FormFixture {
    pub fn to_request(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "category": self.category,
            "fields": self.fields,
        })
    }
}

/// The six template forms. The first one is the target of data round-trips.
pub fn forms() -> Vec<FormFixture> {
    vec![
        FormFixture {
            name: "Harness Vital Signs Assessment",
            description: "Vital signs captured at every visit",
            category: "vitals",
            fields: json!([
                {"name": "assessment_date", "label": "Assessment date", "type": "date", "required": true},
                {"name": "pain_level", "label": "Pain level (0-10)", "type": "select", "options": ["0","1","2","3","4","5","6","7","8","9","10"]},
                {"name": "heart_rate", "label": "Heart rate (bpm)", "type": "number", "min": 30, "max": 220},
                {"name": "systolic_bp", "label": "Systolic BP", "type": "number"},
                {"name": "diastolic_bp", "label": "Diastolic BP", "type": "number"},
                {"name": "notes", "label": "Notes", "type": "textarea"}
            ]),
            required: true,
            double_entry: true,
            electronic_signature: false,
        },
        FormFixture {
            name: "Harness Demographics",
            description: "Baseline demographics",
            category: "demographics",
            fields: json!([
                {"name": "birth_date", "label": "Date of birth", "type": "date", "required": true},
                {"name": "sex", "label": "Sex", "type": "radio", "options": ["female", "male", "other"]},
                {"name": "ethnicity", "label": "Ethnicity", "type": "select", "options": ["hispanic", "not_hispanic", "unknown"]}
            ]),
            required: true,
            double_entry: false,
            electronic_signature: false,
        },
        FormFixture {
            name: "Harness Medical History",
            description: "Relevant prior conditions",
            category: "history",
            fields: json!([
                {"name": "condition", "label": "Condition", "type": "text", "required": true},
                {"name": "onset_date", "label": "Onset date", "type": "date"},
                {"name": "ongoing", "label": "Ongoing", "type": "yesno"}
            ]),
            required: true,
            double_entry: false,
            electronic_signature: false,
        },
        FormFixture {
            name: "Harness Adverse Events",
            description: "Adverse event log",
            category: "safety",
            fields: json!([
                {"name": "ae_reported", "label": "Any adverse events?", "type": "yesno", "required": true},
                {"name": "ae_table", "label": "Adverse events", "type": "table", "tableColumns": [
                    {"name": "term", "label": "Term", "type": "text"},
                    {"name": "severity", "label": "Severity", "type": "select", "options": ["mild", "moderate", "severe"]},
                    {"name": "onset", "label": "Onset", "type": "date"}
                ]}
            ]),
            required: false,
            double_entry: false,
            electronic_signature: true,
        },
        FormFixture {
            name: "Harness BMI Calculation",
            description: "Derived body mass index",
            category: "vitals",
            fields: json!([
                {"name": "weight_kg", "label": "Weight (kg)", "type": "decimal", "required": true},
                {"name": "height_cm", "label": "Height (cm)", "type": "decimal", "required": true},
                {"name": "bmi", "label": "BMI", "type": "calculation", "calculationFormula": "weight_kg / ((height_cm / 100) ^ 2)"}
            ]),
            required: false,
            double_entry: false,
            electronic_signature: false,
        },
        FormFixture {
            name: "Harness Concomitant Medications",
            description: "Medications taken during the study",
            category: "medications",
            fields: json!([
                {"name": "medication_name", "label": "Medication", "type": "text", "required": true},
                {"name": "dose", "label": "Dose", "type": "text"},
                {"name": "route", "label": "Route", "type": "select", "options": ["oral", "iv", "topical"]}
            ]),
            required: false,
            double_entry: false,
            electronic_signature: false,
        },
    ]
}

#[derive(Debug, Clone)]
pub struct EventFixture {
    pub name: &'static str,
    pub description: &'static str,
    pub order: u32,
    /// Visit date offset from the enrollment date, in days.
    pub day_offset: i64,
}

pub fn event_definitions() -> Vec<EventFixture> {
    vec![
        EventFixture {
            name: "Screening",
            description: "Eligibility screening visit",
            order: 1,
            day_offset: 0,
        },
        EventFixture {
            name: "Baseline",
            description: "Baseline visit",
            order: 2,
            day_offset: 7,
        },
        EventFixture {
            name: "Follow-up",
            description: "Four week follow-up",
            order: 3,
            day_offset: 28,
        },
    ]
}

#[derive(Debug, Clone)]
pub struct SiteFixture {
    pub name: &'static str,
    pub site_number: &'static str,
}

pub fn sites() -> Vec<SiteFixture> {
    vec![SiteFixture {
        name: "Harness General Hospital",
        site_number: "HRN-S01",
    }]
}

#[derive(Debug, Clone)]
pub struct RuleFixture {
    pub field_name: &'static str,
    pub name: &'static str,
    pub min: f64,
    pub max: f64,
    pub message: &'static str,
}

/// Range rules on the vital signs form.
pub fn validation_rules() -> Vec<RuleFixture> {
    vec![
        RuleFixture {
            field_name: "heart_rate",
            name: "Heart rate plausible range",
            min: 30.0,
            max: 220.0,
            message: "Heart rate must be between 30 and 220 bpm",
        },
        RuleFixture {
            field_name: "pain_level",
            name: "Pain scale range",
            min: 0.0,
            max: 10.0,
            message: "Pain level must be between 0 and 10",
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::content::validate_field;
    use crate::EntityId;

    #[test]
    fn test_fixture_forms_pass_content_validation() {
        for form in forms() {
            let fields = form.fields.as_array().unwrap();
            for (i, field) in fields.iter().enumerate() {
                let violations = validate_field(&EntityId::Num(0), i, field);
                assert!(violations.is_empty(), "{}: {:?}", form.name, violations);
            }
        }
    }

    #[test]
    fn test_round_trip_payload_satisfies_required_fields() {
        let vitals = &forms()[0];
        let payload = round_trip_payload();
        for field in vitals.fields.as_array().unwrap() {
            if field["required"] == json!(true) {
                assert!(payload.get(field["name"].as_str().unwrap()).is_some());
            }
        }
        assert!(incomplete_payload().get("assessment_date").is_none());
    }
}
