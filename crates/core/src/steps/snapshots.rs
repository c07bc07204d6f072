//! Snapshot verification, content checks, data round-trips and refresh behaviour.

use super::{expect_ok, require, require_list, StepError, StepId, StepResult};
use crate::client::ApiRequest;
use crate::config::RefreshDataPolicy;
use crate::diagnostics::{Failure, ResultSink};
use crate::fixtures;
use crate::model::FormSnapshot;
use crate::normalize;
use crate::types::EntityId;
use crate::verifier::{content, roundtrip, IntegrityReport};
use crate::{Harness, TestState};
use serde_json::{Map, Value};

const MARKER_FIELD: &str = "notes";

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

async fn event_snapshots(
    harness: &Harness,
    event_id: &EntityId,
) -> Result<Vec<FormSnapshot>, StepError> {
    let response = expect_ok(
        harness
            .client()
            .call(ApiRequest::get(format!(
                "/events/instance/{event_id}/form-snapshots"
            )))
            .await,
        "form snapshot listing",
    )?;
    Ok(normalize::typed_rows(&response.data))
}

/// The vital signs snapshot of the first scheduled visit, target of every data write.
async fn vitals_snapshot(
    harness: &Harness,
    state: &TestState,
) -> Result<(EntityId, FormSnapshot), StepError> {
    let form_ids = require_list(&state.form_ids, "formIds", StepId::CreateForms)?;
    let event_ids = require_list(
        &state.scheduled_event_ids,
        "scheduledEventIds",
        StepId::ScheduleEvents,
    )?;
    let event_id = &event_ids[0];

    event_snapshots(harness, event_id)
        .await?
        .into_iter()
        .find(|s| s.form_id == form_ids[0])
        .map(|s| (event_id.clone(), s))
        .ok_or_else(|| {
            StepError::Failed(format!(
                "visit {event_id} has no snapshot of form {}",
                form_ids[0]
            ))
        })
}

pub(super) async fn verify_snapshots(harness: &Harness) -> StepResult {
    let state = harness.state();
    let subject_id = require(&state.subject_id, "subjectId", StepId::EnrollSubject)?;
    let scheduled = require_list(
        &state.scheduled_event_ids,
        "scheduledEventIds",
        StepId::ScheduleEvents,
    )?;
    let verifier = harness.verifier();

    let run = verifier.verify(subject_id).await;
    if !run.is_valid() {
        return Err(StepError::Failed(run.outcome.to_string()));
    }
    let Some(discovery) = run.discovery else {
        return Err(StepError::Failed("verification produced no discovery".into()));
    };

    let unlisted: Vec<String> = scheduled
        .iter()
        .filter(|id| !discovery.events.iter().any(|e| &e.event.id == *id))
        .map(EntityId::to_string)
        .collect();
    if !unlisted.is_empty() {
        return Err(StepError::Failed(format!(
            "scheduled visits not returned for subject: {}",
            unlisted.join(", ")
        )));
    }

    match verifier
        .backend_report(subject_id)
        .await
        .filter(IntegrityReport::is_informative)
    {
        Some(report) => {
            if report.flag_contradicts_counts() {
                harness.sink().record_warning(&format!(
                    "backend valid flag {:?} contradicts its counts ({})",
                    report.reported_valid,
                    report.summary()
                ));
            }
            if !report.is_valid() {
                let error = format!(
                    "backend integrity report disagrees with local verification: {}",
                    report.summary()
                );
                harness
                    .sink()
                    .record_failure(Failure::new("snapshot-integrity backend", error.clone()));
                return Err(StepError::Failed(error));
            }
        }
        None => harness
            .sink()
            .record_warning("backend verification report unavailable"),
    }

    let snapshot_ids = discovery.snapshot_ids();
    tracing::info!(
        "{} snapshots across {} visits",
        snapshot_ids.len(),
        discovery.events.len()
    );
    harness.update_state(TestState {
        snapshot_ids: Some(snapshot_ids),
        ..Default::default()
    })?;
    Ok(())
}

pub(super) async fn validate_snapshot_content(harness: &Harness) -> StepResult {
    let state = harness.state();
    let event_ids = require_list(
        &state.scheduled_event_ids,
        "scheduledEventIds",
        StepId::ScheduleEvents,
    )?;

    let mut checked = 0;
    let mut violations = 0;
    for event_id in event_ids {
        for snapshot in event_snapshots(harness, event_id).await? {
            checked += snapshot.structure.fields.len();
            for violation in content::validate_snapshot(&snapshot) {
                violations += 1;
                harness.sink().record_failure(Failure::new(
                    format!("snapshot-content {}", violation.snapshot_id),
                    violation.to_string(),
                ));
            }
        }
    }

    if violations > 0 {
        return Err(StepError::Failed(format!(
            "{violations} content violations in {checked} fields"
        )));
    }
    tracing::info!("{} snapshot fields well formed", checked);
    Ok(())
}

/// Writes known values to a snapshot and requires them to read back unchanged.
pub(super) async fn save_form_data(harness: &Harness) -> StepResult {
    let state = harness.state();
    require_list(&state.snapshot_ids, "snapshotIds", StepId::VerifySnapshots)?;
    let (_, snapshot) = vitals_snapshot(harness, &state).await?;
    let client = harness.client();

    let written = object(fixtures::round_trip_payload());
    expect_ok(
        roundtrip::save(client, &snapshot.id, &written, false).await,
        "form data save",
    )?;

    let fetched = roundtrip::fetch(client, &snapshot.id)
        .await
        .ok_or_else(|| StepError::Failed(format!("could not read back snapshot {}", snapshot.id)))?;

    let mismatches = roundtrip::compare(&written, &fetched, &[]);
    for mismatch in &mismatches {
        harness.sink().record_failure(Failure::new(
            format!("GET /events/patient-form/{}/data", snapshot.id),
            format!("round-trip mismatch {mismatch}"),
        ));
    }
    if !mismatches.is_empty() {
        return Err(StepError::Failed(format!(
            "{} of {} keys did not round-trip",
            mismatches.len(),
            written.len()
        )));
    }

    tracing::info!("snapshot {} round-tripped {} keys", snapshot.id, written.len());
    Ok(())
}

/// Saving data that omits a required field must be refused and leave the stored data alone.
pub(super) async fn reject_incomplete_data(harness: &Harness) -> StepResult {
    let state = harness.state();
    require_list(&state.snapshot_ids, "snapshotIds", StepId::VerifySnapshots)?;
    let (_, snapshot) = vitals_snapshot(harness, &state).await?;
    let client = harness.client();

    let before = roundtrip::fetch(client, &snapshot.id)
        .await
        .ok_or_else(|| StepError::Failed(format!("could not read snapshot {}", snapshot.id)))?;

    let incomplete = object(fixtures::incomplete_payload());
    let response = roundtrip::save(client, &snapshot.id, &incomplete, true).await;
    if response.ok {
        let error = format!(
            "snapshot {} accepted data without a required field ({})",
            snapshot.id, response.status
        );
        harness.sink().record_failure(Failure {
            endpoint: format!("PUT /events/patient-form/{}/data", snapshot.id),
            status: Some(response.status),
            error: error.clone(),
            request_body: Some(Value::Object(incomplete)),
            response_body: Some(response.data),
        });
        return Err(StepError::Failed(error));
    }
    if !response.is_client_error() {
        return Err(StepError::Failed(format!(
            "expected a 4xx rejection, got {}: {}",
            response.status,
            response.error_message()
        )));
    }
    tracing::info!(
        "incomplete data rejected ({}): {}",
        response.status,
        response.error_message()
    );

    let after = roundtrip::fetch(client, &snapshot.id)
        .await
        .ok_or_else(|| StepError::Failed(format!("could not re-read snapshot {}", snapshot.id)))?;
    let changed = roundtrip::compare(&before, &after, &[]);
    let added: Vec<&String> = after.keys().filter(|k| !before.contains_key(*k)).collect();
    if !changed.is_empty() || !added.is_empty() {
        return Err(StepError::Failed(format!(
            "rejected save still modified snapshot {} ({} changed, {} added)",
            snapshot.id,
            changed.len(),
            added.len()
        )));
    }
    Ok(())
}

/// Forces the refresh protocol and judges what happened to previously saved data.
pub(super) async fn refresh_and_repair(harness: &Harness) -> StepResult {
    let state = harness.state();
    let subject_id = require(&state.subject_id, "subjectId", StepId::EnrollSubject)?;
    let client = harness.client();
    let policy = harness.config().refresh_data_policy();

    let marked = match vitals_snapshot(harness, &state).await {
        Ok((event_id, snapshot)) => {
            let marker = format!("refresh-marker-{}", uuid::Uuid::new_v4());
            let mut data = snapshot.data.clone();
            data.extend(object(fixtures::round_trip_payload()));
            data.insert(MARKER_FIELD.into(), Value::String(marker.clone()));
            let saved = roundtrip::save(client, &snapshot.id, &data, true).await;
            if saved.ok {
                Some((event_id, snapshot.form_id, marker))
            } else {
                harness
                    .sink()
                    .record_warning("could not write refresh marker; data preservation not checked");
                None
            }
        }
        Err(e) => {
            harness
                .sink()
                .record_warning(&format!("data preservation not checked: {e}"));
            None
        }
    };

    let run = harness.verifier().refresh_and_repair(subject_id).await;
    if !run.is_valid() {
        return Err(StepError::Failed(run.outcome.to_string()));
    }
    let Some(discovery) = run.discovery else {
        return Err(StepError::Failed("verification produced no discovery".into()));
    };
    harness.update_state(TestState {
        snapshot_ids: Some(discovery.snapshot_ids()),
        ..Default::default()
    })?;

    let Some((event_id, form_id, marker)) = marked else {
        return Ok(());
    };
    let survived = match discovery.snapshot_for(&event_id, &form_id) {
        Some(refreshed) => roundtrip::fetch(client, &refreshed.id)
            .await
            .and_then(|data| data.get(MARKER_FIELD).map(normalize::coerce_to_string))
            .is_some_and(|value| value == marker),
        None => false,
    };
    tracing::info!(
        "saved data {} refresh",
        if survived { "survived" } else { "did not survive" }
    );

    match (policy, survived) {
        (RefreshDataPolicy::Preserved, false) => {
            let error = "refresh discarded saved patient data".to_string();
            harness
                .sink()
                .record_failure(Failure::new("refresh-snapshots", error.clone()));
            Err(StepError::Failed(error))
        }
        (RefreshDataPolicy::Discarded, true) => {
            let error = "refresh kept saved patient data".to_string();
            harness
                .sink()
                .record_failure(Failure::new("refresh-snapshots", error.clone()));
            Err(StepError::Failed(error))
        }
        (RefreshDataPolicy::Observe, _) => {
            harness.sink().record_warning(&format!(
                "refresh {} saved patient data",
                if survived { "preserved" } else { "discarded" }
            ));
            Ok(())
        }
        _ => Ok(()),
    }
}
