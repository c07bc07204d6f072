//! Subject enrollment and visit scheduling.

use super::{entity_id, expect_ok, find_row, require, require_list, StepError, StepId, StepResult};
use crate::client::ApiRequest;
use crate::diagnostics::{Failure, ResultSink};
use crate::fixtures::{self, SUBJECT_LABEL, UNSCHEDULED_REASON};
use crate::model::{FormSnapshot, ScheduledEvent, VisitForm};
use crate::normalize;
use crate::types::EntityId;
use crate::verifier::compare_event;
use crate::{Harness, TestState};
use chrono::{Duration, NaiveDate, Utc};
use serde_json::json;

fn visit_date(start: NaiveDate, day_offset: i64) -> String {
    (start + Duration::days(day_offset))
        .format("%Y-%m-%d")
        .to_string()
}

async fn scheduled_events(
    harness: &Harness,
    subject_id: &EntityId,
) -> Result<Vec<ScheduledEvent>, StepError> {
    let response = expect_ok(
        harness
            .client()
            .call(ApiRequest::get(format!("/events/subject/{subject_id}")))
            .await,
        "scheduled event listing",
    )?;
    Ok(normalize::typed_rows(&response.data))
}

pub(super) async fn enroll_subject(harness: &Harness) -> StepResult {
    let state = harness.state();
    let study_id = require(&state.study_id, "studyId", StepId::CreateStudy)?;
    let site_ids = require_list(&state.site_ids, "siteIds", StepId::CreateStudy)?;
    let client = harness.client();

    let existing = expect_ok(
        client
            .call(
                ApiRequest::get("/subjects")
                    .query("studyId", study_id)
                    .query("label", SUBJECT_LABEL),
            )
            .await,
        "subject lookup",
    )?;
    let rows = normalize::rows(&existing.data);
    let label_keys = &["label", "studySubjectLabel", "subjectLabel", "study_subject_label"];
    let subject_id = match find_row(&rows, label_keys, SUBJECT_LABEL) {
        Some(row) => entity_id(row, &["subjectId", "studySubjectId"], "subject lookup")?,
        None => {
            let body = json!({
                "studyId": study_id,
                "siteId": site_ids[0],
                "label": SUBJECT_LABEL,
                "enrollmentDate": Utc::now().date_naive().format("%Y-%m-%d").to_string(),
                "gender": "female",
                "dateOfBirth": "1980-04-12",
            });
            let created = expect_ok(
                client.call(ApiRequest::post("/subjects").json(body)).await,
                "subject enrollment",
            )?;
            let id = entity_id(
                &created.data,
                &["subjectId", "studySubjectId"],
                "subject enrollment",
            )?;
            tracing::info!("enrolled subject {} ({})", SUBJECT_LABEL, id);
            id
        }
    };

    harness.update_state(TestState {
        subject_id: Some(subject_id),
        ..Default::default()
    })?;
    Ok(())
}

/// Schedules one visit per event definition, reusing instances that already exist.
pub(super) async fn schedule_events(harness: &Harness) -> StepResult {
    let state = harness.state();
    let subject_id = require(&state.subject_id, "subjectId", StepId::EnrollSubject)?;
    let definition_ids = require_list(
        &state.event_definition_ids,
        "eventDefinitionIds",
        StepId::CreateStudy,
    )?;
    let visits = fixtures::event_definitions();
    if definition_ids.len() != visits.len() {
        return Err(StepError::Failed(format!(
            "state holds {} visit definitions, expected {}; rerun 'create-study'",
            definition_ids.len(),
            visits.len()
        )));
    }

    let existing = scheduled_events(harness, subject_id).await?;
    let today = Utc::now().date_naive();
    let mut scheduled_event_ids = Vec::new();
    for (definition_id, fixture) in definition_ids.iter().zip(visits) {
        if let Some(event) = existing
            .iter()
            .find(|e| !e.is_unscheduled && &e.event_definition_id == definition_id)
        {
            scheduled_event_ids.push(event.id.clone());
            continue;
        }

        let body = json!({
            "subjectId": subject_id,
            "eventDefinitionId": definition_id,
            "startDate": visit_date(today, fixture.day_offset),
        });
        let created = expect_ok(
            harness
                .client()
                .call(ApiRequest::post("/events/schedule").json(body))
                .await,
            "event scheduling",
        )?;
        let id = entity_id(
            &created.data,
            &["patientEventId", "studyEventId", "eventId"],
            "event scheduling",
        )?;
        tracing::info!("scheduled '{}' as instance {}", fixture.name, id);
        scheduled_event_ids.push(id);
    }

    harness.update_state(TestState {
        scheduled_event_ids: Some(scheduled_event_ids),
        ..Default::default()
    })?;
    Ok(())
}

/// Creates an unscheduled visit and checks it materialized the assigned forms like any other.
pub(super) async fn unscheduled_visit(harness: &Harness) -> StepResult {
    let state = harness.state();
    let subject_id = require(&state.subject_id, "subjectId", StepId::EnrollSubject)?;
    let definition_ids = require_list(
        &state.event_definition_ids,
        "eventDefinitionIds",
        StepId::CreateStudy,
    )?;
    let client = harness.client();

    let existing = scheduled_events(harness, subject_id).await?;
    let reusable = state
        .unscheduled_event_id
        .as_ref()
        .filter(|id| existing.iter().any(|e| &e.id == *id));
    let event_id = match reusable {
        Some(id) => id.clone(),
        None => {
            let body = json!({
                "subjectId": subject_id,
                "eventDefinitionId": definition_ids[0],
                "startDate": Utc::now().date_naive().format("%Y-%m-%d").to_string(),
                "reason": UNSCHEDULED_REASON,
            });
            let created = expect_ok(
                client
                    .call(ApiRequest::post("/events/unscheduled").json(body))
                    .await,
                "unscheduled visit creation",
            )?;
            entity_id(
                &created.data,
                &["patientEventId", "studyEventId", "eventId"],
                "unscheduled visit creation",
            )?
        }
    };
    harness.update_state(TestState {
        unscheduled_event_id: Some(event_id.clone()),
        ..Default::default()
    })?;

    let event = scheduled_events(harness, subject_id)
        .await?
        .into_iter()
        .find(|e| e.id == event_id)
        .ok_or_else(|| {
            StepError::Failed(format!("unscheduled visit {event_id} not listed for subject"))
        })?;

    let expected = expect_ok(
        client
            .call(ApiRequest::get(format!("/events/instance/{event_id}/visit-forms")))
            .await,
        "visit form listing",
    )?;
    let actual = expect_ok(
        client
            .call(ApiRequest::get(format!(
                "/events/instance/{event_id}/form-snapshots"
            )))
            .await,
        "form snapshot listing",
    )?;
    let expected: Vec<VisitForm> = normalize::typed_rows(&expected.data);
    let actual: Vec<FormSnapshot> = normalize::typed_rows(&actual.data);

    let comparison = compare_event(&event, &expected, &actual);
    if !comparison.matches() {
        let error = format!(
            "unscheduled visit {event_id}: expected {} forms, found {} (missing {}, extra {})",
            comparison.expected_forms,
            comparison.actual_forms,
            comparison.missing_form_ids.len(),
            comparison.extra_snapshot_ids.len()
        );
        harness
            .sink()
            .record_failure(Failure::new("snapshot-integrity unscheduled", error.clone()));
        return Err(StepError::Failed(error));
    }

    tracing::info!(
        "unscheduled visit {} has all {} forms",
        event_id,
        comparison.expected_forms
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visit_date_offsets() {
        let start = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        assert_eq!(visit_date(start, 0), "2026-02-01");
        assert_eq!(visit_date(start, 28), "2026-03-01");
    }
}
