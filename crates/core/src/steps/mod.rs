//! Harness steps.
//!
//! Each step is one unit of the end-to-end scenario. Steps read their prerequisites from the
//! persisted [`TestState`](crate::TestState), talk to the backend through the client, and merge
//! the identifiers they produce back into the state before returning. A step can therefore be
//! run on its own in a later process, as long as the steps it depends on have run at some
//! point.
//!
//! Steps are re-runnable: before creating anything they look the entity up by a unique key
//! (username, form name, protocol number, subject label, scheduled instance per event
//! definition) and reuse what they find.

mod forms;
mod organization;
mod queries;
mod snapshots;
mod study;
mod subjects;

use crate::client::ApiResponse;
use crate::normalize;
use crate::types::EntityId;
use crate::{Harness, HarnessError};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("missing prerequisite '{field}'; run '{producer}' first")]
    MissingPrerequisite {
        field: &'static str,
        producer: StepId,
    },
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Harness(#[from] HarnessError),
}

pub type StepResult = Result<(), StepError>;

/// The closed set of steps, in suite order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepId {
    RegisterOrganization,
    Login,
    CreateMembers,
    CreateForms,
    ConfigureForms,
    CreateValidationRules,
    CreateStudy,
    EnrollSubject,
    ScheduleEvents,
    VerifySnapshots,
    ValidateSnapshotContent,
    SaveFormData,
    RejectIncompleteData,
    RefreshAndRepair,
    UnscheduledVisit,
    RaiseQuery,
}

impl StepId {
    pub const ALL: [StepId; 16] = [
        StepId::RegisterOrganization,
        StepId::Login,
        StepId::CreateMembers,
        StepId::CreateForms,
        StepId::ConfigureForms,
        StepId::CreateValidationRules,
        StepId::CreateStudy,
        StepId::EnrollSubject,
        StepId::ScheduleEvents,
        StepId::VerifySnapshots,
        StepId::ValidateSnapshotContent,
        StepId::SaveFormData,
        StepId::RejectIncompleteData,
        StepId::RefreshAndRepair,
        StepId::UnscheduledVisit,
        StepId::RaiseQuery,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StepId::RegisterOrganization => "register-organization",
            StepId::Login => "login",
            StepId::CreateMembers => "create-members",
            StepId::CreateForms => "create-forms",
            StepId::ConfigureForms => "configure-forms",
            StepId::CreateValidationRules => "create-validation-rules",
            StepId::CreateStudy => "create-study",
            StepId::EnrollSubject => "enroll-subject",
            StepId::ScheduleEvents => "schedule-events",
            StepId::VerifySnapshots => "verify-snapshots",
            StepId::ValidateSnapshotContent => "validate-snapshot-content",
            StepId::SaveFormData => "save-form-data",
            StepId::RejectIncompleteData => "reject-incomplete-data",
            StepId::RefreshAndRepair => "refresh-and-repair",
            StepId::UnscheduledVisit => "unscheduled-visit",
            StepId::RaiseQuery => "raise-query",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            StepId::RegisterOrganization => "Register the organization and its admin account",
            StepId::Login => "Log in as the admin and store fresh tokens",
            StepId::CreateMembers => "Create the organization's staff accounts",
            StepId::CreateForms => "Create the template forms",
            StepId::ConfigureForms => "Fork a template and set per-form workflow flags",
            StepId::CreateValidationRules => "Attach range rules to the vital signs form",
            StepId::CreateStudy => "Create the study, its site and its event definitions",
            StepId::EnrollSubject => "Enroll the test subject",
            StepId::ScheduleEvents => "Schedule one visit per event definition",
            StepId::VerifySnapshots => "Verify every visit materialized its assigned forms",
            StepId::ValidateSnapshotContent => "Check snapshot field definitions for defects",
            StepId::SaveFormData => "Save form data and read it back",
            StepId::RejectIncompleteData => "Check that data missing a required field is rejected",
            StepId::RefreshAndRepair => "Force snapshot refresh and repair, then re-verify",
            StepId::UnscheduledVisit => "Create an unscheduled visit and verify its snapshots",
            StepId::RaiseQuery => "Raise a data query against a saved form",
        }
    }

    pub async fn run(self, harness: &Harness) -> StepResult {
        match self {
            StepId::RegisterOrganization => organization::register_organization(harness).await,
            StepId::Login => organization::login(harness).await,
            StepId::CreateMembers => organization::create_members(harness).await,
            StepId::CreateForms => forms::create_forms(harness).await,
            StepId::ConfigureForms => forms::configure_forms(harness).await,
            StepId::CreateValidationRules => forms::create_validation_rules(harness).await,
            StepId::CreateStudy => study::create_study(harness).await,
            StepId::EnrollSubject => subjects::enroll_subject(harness).await,
            StepId::ScheduleEvents => subjects::schedule_events(harness).await,
            StepId::VerifySnapshots => snapshots::verify_snapshots(harness).await,
            StepId::ValidateSnapshotContent => snapshots::validate_snapshot_content(harness).await,
            StepId::SaveFormData => snapshots::save_form_data(harness).await,
            StepId::RejectIncompleteData => snapshots::reject_incomplete_data(harness).await,
            StepId::RefreshAndRepair => snapshots::refresh_and_repair(harness).await,
            StepId::UnscheduledVisit => subjects::unscheduled_visit(harness).await,
            StepId::RaiseQuery => queries::raise_query(harness).await,
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StepId {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        StepId::ALL
            .into_iter()
            .find(|step| step.name() == wanted)
            .ok_or_else(|| HarnessError::UnknownStep(wanted.to_string()))
    }
}

/// Returns the value of a prerequisite field or the error naming the step that produces it.
pub(crate) fn require<'a, T>(
    value: &'a Option<T>,
    field: &'static str,
    producer: StepId,
) -> Result<&'a T, StepError> {
    value
        .as_ref()
        .ok_or(StepError::MissingPrerequisite { field, producer })
}

/// Like [`require`], but an empty list counts as missing.
pub(crate) fn require_list<'a, T>(
    value: &'a Option<Vec<T>>,
    field: &'static str,
    producer: StepId,
) -> Result<&'a [T], StepError> {
    match value {
        Some(items) if !items.is_empty() => Ok(items),
        _ => Err(StepError::MissingPrerequisite { field, producer }),
    }
}

/// Turns a failed response into a step failure.
pub(crate) fn expect_ok(response: ApiResponse, what: &str) -> Result<ApiResponse, StepError> {
    if response.ok {
        Ok(response)
    } else {
        Err(StepError::Failed(format!(
            "{what} failed ({}): {}",
            response.status,
            response.error_message()
        )))
    }
}

/// Reads the id of an entity the backend just created or returned.
pub(crate) fn entity_id(data: &Value, keys: &[&str], what: &str) -> Result<EntityId, StepError> {
    normalize::id(data, keys)
        .ok_or_else(|| StepError::Failed(format!("{what}: response carried no id: {data}")))
}

/// Finds the first row whose value under any of `keys` equals `wanted`, compared as text.
pub(crate) fn find_row<'a>(rows: &'a [Value], keys: &[&str], wanted: &str) -> Option<&'a Value> {
    rows.iter().find(|row| {
        normalize::field(row, keys)
            .map(normalize::coerce_to_string)
            .is_some_and(|value| value == wanted)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_names_round_trip_and_are_unique() {
        let mut names = std::collections::HashSet::new();
        for step in StepId::ALL {
            assert!(names.insert(step.name()));
            assert_eq!(step.name().parse::<StepId>().unwrap(), step);
        }
        assert_eq!(names.len(), 16);
    }

    #[test]
    fn test_unknown_step_name_is_rejected() {
        let err = "drop-database".parse::<StepId>().unwrap_err();
        assert!(matches!(err, HarnessError::UnknownStep(name) if name == "drop-database"));
    }

    #[test]
    fn test_require_reports_producer() {
        let missing: Option<EntityId> = None;
        let err = require(&missing, "subjectId", StepId::EnrollSubject).unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing prerequisite 'subjectId'; run 'enroll-subject' first"
        );

        let empty: Option<Vec<EntityId>> = Some(Vec::new());
        assert!(matches!(
            require_list(&empty, "formIds", StepId::CreateForms),
            Err(StepError::MissingPrerequisite { field: "formIds", .. })
        ));
    }

    #[test]
    fn test_find_row_compares_as_text() {
        let rows = vec![
            json!({"id": 1, "protocol_number": "OTHER"}),
            json!({"id": 2, "protocolNumber": "HARNESS-001"}),
        ];
        let found = find_row(&rows, &["protocolNumber", "protocol_number"], "HARNESS-001");
        assert_eq!(found.unwrap()["id"], json!(2));
        assert!(find_row(&rows, &["label"], "HARNESS-001").is_none());
    }
}
