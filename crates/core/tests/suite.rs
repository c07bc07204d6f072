//! End-to-end runs of the harness against the in-memory mock backend.

use edc_core::diagnostics::JsonlSink;
use edc_core::orchestrator::StepStatus;
use edc_core::verifier::{FailureReason, VerificationOutcome};
use edc_core::{
    ApiRequest, EntityId, Harness, HarnessConfig, Orchestrator, RefreshDataPolicy, StepId,
    TestState,
};
use mock_edc::MockEdc;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

struct Setup {
    edc: MockEdc,
    dir: TempDir,
    harness: Harness,
}

async fn setup_with(configure: impl FnOnce(HarnessConfig) -> HarnessConfig) -> Setup {
    let edc = MockEdc::spawn().await.unwrap();
    let dir = TempDir::new().unwrap();
    let cfg = HarnessConfig::new(
        edc.base_url(),
        dir.path().join("test-state.json"),
        dir.path().join("logs").join("failures.jsonl"),
    )
    .unwrap();
    let harness = Harness::new(Arc::new(configure(cfg))).unwrap();
    Setup { edc, dir, harness }
}

async fn setup() -> Setup {
    setup_with(|cfg| cfg).await
}

/// Runs every step up to and including `last`.
async fn run_through(harness: &Harness, last: StepId) {
    let end = StepId::ALL.iter().position(|s| *s == last).unwrap();
    let report = Orchestrator::new(harness)
        .run_steps(&StepId::ALL[..=end])
        .await;
    assert!(report.all_passed(), "setup steps failed: {:?}", report.steps);
}

fn num(id: &EntityId) -> i64 {
    match id {
        EntityId::Num(n) => *n,
        EntityId::Text(s) => s.parse().unwrap(),
    }
}

#[tokio::test]
async fn test_full_suite_passes() {
    let s = setup().await;

    let report = Orchestrator::new(&s.harness).run_all().await;
    assert!(report.all_passed(), "{:?}", report.steps);
    assert_eq!(report.steps.len(), StepId::ALL.len());
    assert_eq!(report.exit_code(), 0);

    let state = s.harness.state();
    assert_eq!(state.form_ids.as_ref().map(Vec::len), Some(6));
    assert_eq!(state.scheduled_event_ids.as_ref().map(Vec::len), Some(3));
    assert_eq!(state.snapshot_ids.as_ref().map(Vec::len), Some(18));
    assert!(state.forked_form_id.is_some());
    assert!(state.unscheduled_event_id.is_some());
    assert_eq!(state.query_ids.as_ref().map(Vec::len), Some(1));

    let counts = s.edc.store().counts();
    assert_eq!(counts.events, 4);
    assert_eq!(counts.snapshots, 24);
    assert_eq!(s.harness.sink().summary().failures, 0);
}

#[tokio::test]
async fn test_rerun_creates_nothing_new() {
    let s = setup().await;

    let first = Orchestrator::new(&s.harness).run_all().await;
    assert!(first.all_passed(), "{:?}", first.steps);
    let before = s.edc.store().counts();

    let second = Orchestrator::new(&s.harness).run_all().await;
    assert!(second.all_passed(), "{:?}", second.steps);
    assert_eq!(s.edc.store().counts(), before);
}

#[tokio::test]
async fn test_state_survives_a_new_harness() {
    let s = setup().await;
    run_through(&s.harness, StepId::CreateStudy).await;

    let cfg = HarnessConfig::new(
        s.edc.base_url(),
        s.dir.path().join("test-state.json"),
        s.dir.path().join("logs").join("failures.jsonl"),
    )
    .unwrap();
    let resumed = Harness::new(Arc::new(cfg)).unwrap();
    let report = Orchestrator::new(&resumed).run_one(StepId::EnrollSubject).await;
    assert_eq!(report.status, StepStatus::Passed);
    assert_eq!(s.edc.store().counts().subjects, 1);
}

#[tokio::test]
async fn test_missing_prerequisite_names_producer_and_logs_nothing() {
    let s = setup().await;

    let report = Orchestrator::new(&s.harness)
        .run_one(StepId::VerifySnapshots)
        .await;
    assert_eq!(
        report.status,
        StepStatus::Failed("missing prerequisite 'subjectId'".into())
    );
    assert_eq!(s.harness.sink().summary().failures, 0);
    assert!(!s.harness.config().diagnostics_log().exists());
    assert_eq!(s.edc.store().login_count(), 0);
}

#[tokio::test]
async fn test_stop_on_failure_skips_remaining_steps() {
    let s = setup_with(|cfg| cfg.with_stop_on_failure(true)).await;

    let report = Orchestrator::new(&s.harness)
        .run_steps(&[StepId::CreateMembers, StepId::Login])
        .await;
    assert!(matches!(report.steps[0].status, StepStatus::Failed(_)));
    assert_eq!(report.steps[1].status, StepStatus::Skipped);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_expired_token_is_refreshed_once() {
    let s = setup().await;
    run_through(&s.harness, StepId::Login).await;

    s.edc.store().expire_tokens();
    let logins = s.edc.store().login_count();

    let response = s.harness.client().call(ApiRequest::get("/forms")).await;
    assert!(response.ok, "{:?}", response);
    assert_eq!(s.edc.store().login_count(), logins + 1);
    assert!(!s.harness.client().is_refreshing());

    // The refreshed token is persisted, so the next call needs no login.
    let again = s.harness.client().call(ApiRequest::get("/forms")).await;
    assert!(again.ok);
    assert_eq!(s.edc.store().login_count(), logins + 1);
}

#[tokio::test]
async fn test_persistent_401_retries_only_once() {
    let s = setup().await;
    run_through(&s.harness, StepId::Login).await;

    s.edc.store().force_unauthorized("/forms");
    let logins = s.edc.store().login_count();
    let requests = s.edc.store().request_count("/forms");

    let response = s.harness.client().call(ApiRequest::get("/forms")).await;
    assert!(!response.ok);
    assert_eq!(response.status, 401);
    assert_eq!(s.edc.store().login_count(), logins + 1);
    assert_eq!(s.edc.store().request_count("/forms"), requests + 2);
    assert_eq!(s.harness.sink().summary().failures, 1);

    let entries = JsonlSink::read_entries(s.harness.config().diagnostics_log());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].endpoint, "GET /forms");
    assert_eq!(entries[0].status, Some(401));
}

#[tokio::test]
async fn test_no_auth_request_does_not_refresh() {
    let s = setup().await;
    run_through(&s.harness, StepId::Login).await;
    let logins = s.edc.store().login_count();

    let response = s
        .harness
        .client()
        .call(ApiRequest::get("/forms").no_auth().quiet())
        .await;
    assert_eq!(response.status, 401);
    assert_eq!(s.edc.store().login_count(), logins);
    assert_eq!(s.harness.sink().summary().failures, 0);
}

#[tokio::test]
async fn test_round_trip_values_read_back_as_text() {
    let s = setup().await;
    run_through(&s.harness, StepId::SaveFormData).await;

    let state = s.harness.state();
    let event = num(&state.scheduled_event_ids.unwrap()[0]);
    let vitals = num(&state.form_ids.unwrap()[0]);
    let snapshot = s
        .edc
        .store()
        .event_snapshots(event)
        .unwrap()
        .into_iter()
        .find(|snap| snap["form_id"] == json!(vitals))
        .unwrap();
    assert_eq!(snapshot["form_data"]["heart_rate"], json!("72"));
    assert_eq!(snapshot["form_data"]["assessment_date"], json!("2026-02-17"));
}

#[tokio::test]
async fn test_incomplete_data_is_rejected_without_side_effects() {
    let s = setup().await;
    run_through(&s.harness, StepId::RejectIncompleteData).await;

    // The rejected save is quiet: nothing lands in the diagnostics log.
    assert_eq!(s.harness.sink().summary().failures, 0);
}

#[tokio::test]
async fn test_deleted_snapshot_is_detected_and_repaired() {
    let s = setup().await;
    run_through(&s.harness, StepId::VerifySnapshots).await;

    let state = s.harness.state();
    let subject = state.subject_id.clone().unwrap();
    let victim = num(&state.snapshot_ids.unwrap()[4]);
    assert!(s.edc.store().delete_snapshot(victim));

    let run = s.harness.verifier().verify(&subject).await;
    let initial = run.initial.as_ref().unwrap();
    assert_eq!(initial.missing_count, 1);
    assert_eq!(initial.extra_count, 0);
    assert_eq!(run.outcome, VerificationOutcome::Valid { repaired: true });
    assert_eq!(run.final_report.as_ref().unwrap().snapshots_found, 18);
    assert_eq!(s.edc.store().counts().snapshots, 18);
}

#[tokio::test]
async fn test_refresh_failure_is_reported() {
    let s = setup().await;
    run_through(&s.harness, StepId::VerifySnapshots).await;
    s.edc.store().fail_refresh(true);

    let subject = s.harness.state().subject_id.unwrap();
    let run = s.harness.verifier().refresh_and_repair(&subject).await;
    assert!(matches!(
        run.outcome,
        VerificationOutcome::Failed(FailureReason::RefreshEndpoint(_))
    ));
    assert!(run.final_report.is_none());

    let report = Orchestrator::new(&s.harness)
        .run_one(StepId::RefreshAndRepair)
        .await;
    assert!(matches!(report.status, StepStatus::Failed(_)));

    let entries = JsonlSink::read_entries(s.harness.config().diagnostics_log());
    assert!(entries
        .iter()
        .any(|e| e.endpoint.ends_with("/refresh-snapshots") && e.status == Some(500)));
    assert!(entries.iter().all(|e| !e.timestamp.is_empty()));
    assert!(entries.iter().any(|e| e.step == "refresh-and-repair"));
}

#[tokio::test]
async fn test_corrupted_field_type_fails_content_validation() {
    let s = setup().await;
    run_through(&s.harness, StepId::VerifySnapshots).await;

    let event = num(&s.harness.state().scheduled_event_ids.unwrap()[0]);
    let listed = s.edc.store().event_snapshots(event).unwrap();
    let victim = listed[0]["id"].as_i64().unwrap();
    let structure: serde_json::Value =
        serde_json::from_str(listed[0]["form_structure"].as_str().unwrap()).unwrap();
    let field = structure["fields"][0]["name"].as_str().unwrap().to_string();
    assert!(s
        .edc
        .store()
        .corrupt_snapshot_field(victim, &field, "type", json!("DATE")));

    let report = Orchestrator::new(&s.harness)
        .run_one(StepId::ValidateSnapshotContent)
        .await;
    assert!(matches!(report.status, StepStatus::Failed(_)));

    let entries = JsonlSink::read_entries(s.harness.config().diagnostics_log());
    let violation = entries
        .iter()
        .find(|e| e.endpoint == format!("snapshot-content {victim}"))
        .unwrap();
    assert!(violation.error.contains("raw storage type code"));
}

#[tokio::test]
async fn test_preserved_policy_passes_when_backend_keeps_data() {
    let s = setup_with(|cfg| cfg.with_refresh_data_policy(RefreshDataPolicy::Preserved)).await;
    run_through(&s.harness, StepId::VerifySnapshots).await;
    s.edc.store().preserve_data_on_refresh(true);

    let report = Orchestrator::new(&s.harness)
        .run_one(StepId::RefreshAndRepair)
        .await;
    assert_eq!(report.status, StepStatus::Passed);
}

#[tokio::test]
async fn test_preserved_policy_fails_when_refresh_discards_data() {
    let s = setup_with(|cfg| cfg.with_refresh_data_policy(RefreshDataPolicy::Preserved)).await;
    run_through(&s.harness, StepId::VerifySnapshots).await;

    let report = Orchestrator::new(&s.harness)
        .run_one(StepId::RefreshAndRepair)
        .await;
    assert_eq!(
        report.status,
        StepStatus::Failed("refresh discarded saved patient data".into())
    );
}

#[tokio::test]
async fn test_refresh_replaces_snapshot_ids_in_state() {
    let s = setup().await;
    run_through(&s.harness, StepId::VerifySnapshots).await;
    let before = s.harness.state().snapshot_ids.unwrap();

    let report = Orchestrator::new(&s.harness)
        .run_one(StepId::RefreshAndRepair)
        .await;
    assert_eq!(report.status, StepStatus::Passed);

    let after = s.harness.state().snapshot_ids.unwrap();
    assert_eq!(after.len(), before.len());
    assert!(after.iter().all(|id| !before.contains(id)));
    assert!(s.harness.sink().summary().warnings >= 1);
}

#[tokio::test]
async fn test_repair_endpoint_failure_is_reported() {
    let s = setup().await;
    run_through(&s.harness, StepId::VerifySnapshots).await;

    let state = s.harness.state();
    let subject = state.subject_id.clone().unwrap();
    assert!(s.edc.store().delete_snapshot(num(&state.snapshot_ids.unwrap()[0])));
    s.edc.store().fail_repair(true);

    let run = s.harness.verifier().verify(&subject).await;
    assert!(matches!(
        run.outcome,
        VerificationOutcome::Failed(FailureReason::RepairEndpoint(_))
    ));
    assert_eq!(run.initial.as_ref().unwrap().missing_count, 1);
    assert!(run.final_report.is_none());

    let entries = JsonlSink::read_entries(s.harness.config().diagnostics_log());
    assert!(entries
        .iter()
        .any(|e| e.endpoint.ends_with("/repair") && e.status == Some(500)));
    assert!(entries
        .iter()
        .any(|e| e.endpoint == "snapshot-integrity" && e.error.contains("repair endpoint failed")));
}

#[tokio::test]
async fn test_surplus_snapshot_after_repair_fails_verification() {
    let s = setup().await;
    run_through(&s.harness, StepId::VerifySnapshots).await;
    s.edc.store().refresh_leaves_duplicate(true);

    let subject = s.harness.state().subject_id.unwrap();
    let run = s.harness.verifier().refresh_and_repair(&subject).await;
    assert!(matches!(
        run.outcome,
        VerificationOutcome::Failed(FailureReason::PostRepairMismatch(_))
    ));
    let report = run.final_report.as_ref().unwrap();
    assert_eq!(report.missing_count, 0);
    assert!(report.extra_count >= 1);

    let entries = JsonlSink::read_entries(s.harness.config().diagnostics_log());
    assert!(entries
        .iter()
        .any(|e| e.endpoint.starts_with("snapshot-integrity event") && e.status.is_none()));
    assert!(entries
        .iter()
        .any(|e| e.endpoint == "snapshot-integrity" && e.error.contains("still inconsistent")));
}

#[tokio::test]
async fn test_orphan_snapshot_is_detected_and_cleared_by_refresh() {
    let s = setup().await;
    run_through(&s.harness, StepId::VerifySnapshots).await;

    let state = s.harness.state();
    let subject = state.subject_id.clone().unwrap();
    let event = num(&state.scheduled_event_ids.unwrap()[1]);
    let forked = num(&state.forked_form_id.unwrap());
    let orphan = s.edc.store().add_orphan_snapshot(event, forked).unwrap();

    let run = s.harness.verifier().verify(&subject).await;
    let initial = run.initial.as_ref().unwrap();
    assert_eq!(initial.missing_count, 0);
    assert_eq!(initial.extra_count, 1);
    let flagged = initial.events.iter().find(|e| !e.matches()).unwrap();
    assert_eq!(flagged.extra_snapshot_ids, vec![EntityId::Num(orphan)]);

    assert_eq!(run.outcome, VerificationOutcome::Valid { repaired: true });
    assert_eq!(run.final_report.as_ref().unwrap().extra_count, 0);
    assert_eq!(s.edc.store().counts().snapshots, 18);
}

#[tokio::test]
async fn test_direct_repair_leaves_existing_snapshots_untouched() {
    let s = setup().await;
    run_through(&s.harness, StepId::SaveFormData).await;

    let subject = s.harness.state().subject_id.unwrap();
    let verifier = s.harness.verifier();
    let before = verifier.discover(&subject).await.unwrap().snapshot_ids();
    let (victim, kept) = before.split_last().unwrap();
    assert!(s.edc.store().delete_snapshot(num(victim)));

    let stored: Vec<serde_json::Value> = kept
        .iter()
        .map(|id| s.edc.store().snapshot_data(num(id)).unwrap())
        .collect();

    verifier.repair(&subject).await.unwrap();

    let after = verifier.discover(&subject).await.unwrap().snapshot_ids();
    assert_eq!(after.len(), before.len());
    assert!(kept.iter().all(|id| after.contains(id)));
    let created: Vec<&EntityId> = after.iter().filter(|id| !kept.contains(id)).collect();
    assert_eq!(created.len(), 1);
    assert_ne!(created[0], victim);

    for (id, data) in kept.iter().zip(&stored) {
        assert_eq!(&s.edc.store().snapshot_data(num(id)).unwrap(), data);
    }
}

#[tokio::test]
async fn test_schedule_rejects_unexpected_definition_count() {
    let s = setup().await;
    run_through(&s.harness, StepId::EnrollSubject).await;

    let mut definitions = s.harness.state().event_definition_ids.unwrap();
    definitions.push(definitions[0].clone());
    s.harness
        .update_state(TestState {
            event_definition_ids: Some(definitions),
            ..Default::default()
        })
        .unwrap();

    let report = Orchestrator::new(&s.harness)
        .run_one(StepId::ScheduleEvents)
        .await;
    match report.status {
        StepStatus::Failed(message) => assert!(message.contains("4 visit definitions")),
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(s.edc.store().counts().events, 0);
}

#[tokio::test]
async fn test_unwritable_marker_is_a_warning_only() {
    let s = setup().await;
    run_through(&s.harness, StepId::VerifySnapshots).await;

    let state = s.harness.state();
    let event = num(&state.scheduled_event_ids.unwrap()[0]);
    let vitals_form = num(&state.form_ids.unwrap()[0]);
    let vitals = s
        .edc
        .store()
        .event_snapshots(event)
        .unwrap()
        .into_iter()
        .find(|row| row["form_id"].as_i64() == Some(vitals_form))
        .unwrap();
    assert!(s.edc.store().lock_snapshot(vitals["id"].as_i64().unwrap()));

    let report = Orchestrator::new(&s.harness)
        .run_one(StepId::RefreshAndRepair)
        .await;
    assert_eq!(report.status, StepStatus::Passed);

    let summary = s.harness.sink().summary();
    assert_eq!(summary.failures, 0);
    assert!(summary.warnings >= 1);
    assert!(!s.harness.config().diagnostics_log().exists());
}
