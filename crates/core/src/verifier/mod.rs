//! Snapshot consistency verification and repair.
//!
//! For one patient the verifier compares the template assignment graph (event definition →
//! assigned form templates) with the materialized snapshot graph (scheduled event → snapshot
//! forms).
//!
//! ```text
//! DISCOVER → COMPARE ─┬─ valid ──────────────────────────────────────────→ REPORT (VALID)
//!                     └─ mismatch → REFRESH → REPAIR_MISSING → RE-VERIFY ─→ REPORT (VALID | FAILED)
//! ```
//!
//! Refresh deletes and recreates every snapshot of the patient from current template state.
//! Repair then creates only the snapshots still missing. A failure of either endpoint, or a
//! mismatch that survives both, is terminal: the backend's self-repair contract is broken.

pub mod content;
pub mod roundtrip;

use crate::client::ApiRequest;
use crate::diagnostics::{Failure, ResultSink};
use crate::model::{FormSnapshot, ScheduledEvent, VisitForm};
use crate::normalize;
use crate::types::EntityId;
use crate::Harness;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Comparison of expected and materialized forms for one scheduled event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventComparison {
    pub patient_event_id: EntityId,
    pub event_definition_id: Option<EntityId>,
    pub event_name: Option<String>,
    pub expected_forms: usize,
    pub actual_forms: usize,
    /// Assigned template ids with no snapshot.
    pub missing_form_ids: Vec<EntityId>,
    /// Snapshots with no matching assignment, including duplicates of an assigned template.
    pub extra_snapshot_ids: Vec<EntityId>,
}

impl EventComparison {
    pub fn matches(&self) -> bool {
        self.missing_form_ids.is_empty() && self.extra_snapshot_ids.is_empty()
    }
}

/// Compares one event's assignments with its snapshots.
///
/// Matching is by source template id with multiset semantics: each assignment consumes at most
/// one snapshot, so a second snapshot of the same template counts as extra.
pub fn compare_event(
    event: &ScheduledEvent,
    expected: &[VisitForm],
    actual: &[FormSnapshot],
) -> EventComparison {
    let mut outstanding: HashMap<&EntityId, usize> = HashMap::new();
    for form in expected {
        *outstanding.entry(&form.form_id).or_default() += 1;
    }

    let mut extra_snapshot_ids = Vec::new();
    for snapshot in actual {
        match outstanding.get_mut(&snapshot.form_id) {
            Some(remaining) if *remaining > 0 => *remaining -= 1,
            _ => extra_snapshot_ids.push(snapshot.id.clone()),
        }
    }

    let mut missing_form_ids = Vec::new();
    for form in expected {
        if let Some(remaining) = outstanding.get_mut(&form.form_id) {
            if *remaining > 0 {
                *remaining -= 1;
                missing_form_ids.push(form.form_id.clone());
            }
        }
    }

    EventComparison {
        patient_event_id: event.id.clone(),
        event_definition_id: Some(event.event_definition_id.clone()),
        event_name: event.event_name.clone(),
        expected_forms: expected.len(),
        actual_forms: actual.len(),
        missing_form_ids,
        extra_snapshot_ids,
    }
}

/// Integrity of a patient's snapshot graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntegrityReport {
    pub events_checked: usize,
    /// Number of template assignments checked across all events.
    pub forms_checked: usize,
    /// Number of snapshots found across all events.
    pub snapshots_found: usize,
    pub missing_count: usize,
    pub extra_count: usize,
    pub events: Vec<EventComparison>,
    /// Explicit `valid` flag, when the report came from the backend and carried one.
    pub reported_valid: Option<bool>,
    /// `false` when a backend report carried neither missing/extra counts nor event details,
    /// so the counts above are defaults rather than observations.
    pub counts_reported: bool,
}

impl IntegrityReport {
    pub fn from_comparisons(events: Vec<EventComparison>) -> Self {
        Self {
            events_checked: events.len(),
            forms_checked: events.iter().map(|e| e.expected_forms).sum(),
            snapshots_found: events.iter().map(|e| e.actual_forms).sum(),
            missing_count: events.iter().map(|e| e.missing_form_ids.len()).sum(),
            extra_count: events.iter().map(|e| e.extra_snapshot_ids.len()).sum(),
            events,
            reported_valid: None,
            counts_reported: true,
        }
    }

    /// Parses the backend's own verification report.
    ///
    /// Counts may be numbers, numeric strings, or arrays of ids; absent counts fall back to
    /// the per-event details when present.
    pub fn from_backend(body: &Value) -> Self {
        fn len_or_count(value: &Value, keys: &[&str]) -> Option<usize> {
            normalize::field(value, keys).and_then(|v| match v {
                Value::Array(items) => Some(items.len()),
                _ => normalize::count(value, keys).map(|n| n as usize),
            })
        }

        fn ids(value: &Value, keys: &[&str]) -> Vec<EntityId> {
            normalize::field(value, keys)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| {
                            EntityId::from_value(item).or_else(|| {
                                normalize::id(item, &["formId", "form_id", "snapshotId"])
                            })
                        })
                        .collect()
                })
                .unwrap_or_default()
        }

        let events: Vec<EventComparison> = normalize::field(body, &["events", "details"])
            .map(normalize::rows)
            .unwrap_or_default()
            .iter()
            .map(|event| {
                let missing_form_ids = ids(event, &["missing", "missingForms", "missing_forms"]);
                let extra_snapshot_ids = ids(event, &["extra", "extraForms", "extra_forms"]);
                EventComparison {
                    patient_event_id: normalize::id(event, &["patientEventId", "patient_event_id"])
                        .unwrap_or(EntityId::Num(0)),
                    event_definition_id: normalize::id(
                        event,
                        &["eventDefinitionId", "event_definition_id"],
                    ),
                    event_name: normalize::field(event, &["eventName", "event_name"])
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    expected_forms: len_or_count(
                        event,
                        &["expectedForms", "expected_forms", "expectedCount"],
                    )
                    .unwrap_or(0),
                    actual_forms: len_or_count(event, &["actualForms", "actual_forms", "actualCount"])
                        .unwrap_or(0),
                    missing_form_ids,
                    extra_snapshot_ids,
                }
            })
            .collect();

        let derived = Self::from_comparisons(events);
        let missing = len_or_count(
            body,
            &[
                "missingCount",
                "missing_count",
                "missingForms",
                "missing_forms",
                "missing",
            ],
        );
        let extra = len_or_count(
            body,
            &["extraCount", "extra_count", "extraForms", "extra_forms", "extra"],
        );
        let counts_reported = missing.is_some() || extra.is_some() || !derived.events.is_empty();

        Self {
            events_checked: len_or_count(
                body,
                &["totalEventsChecked", "total_events_checked", "eventsChecked"],
            )
            .unwrap_or(derived.events_checked),
            forms_checked: len_or_count(
                body,
                &["totalFormsChecked", "total_forms_checked", "formsChecked"],
            )
            .unwrap_or(derived.forms_checked),
            snapshots_found: len_or_count(body, &["totalSnapshots", "total_snapshots"])
                .unwrap_or(derived.snapshots_found),
            missing_count: missing.unwrap_or(derived.missing_count),
            extra_count: extra.unwrap_or(derived.extra_count),
            counts_reported,
            reported_valid: normalize::flag(body, &["valid", "isValid", "is_valid"]),
            events: derived.events,
        }
    }

    /// VALID iff nothing is missing and nothing is extra. An explicit flag is not required.
    ///
    /// A backend report without counts is judged by its flag alone, and without either it is
    /// not valid.
    pub fn is_valid(&self) -> bool {
        if self.counts_reported {
            self.missing_count == 0 && self.extra_count == 0
        } else {
            self.reported_valid == Some(true)
        }
    }

    /// `true` when the report carries counts or a flag to judge by.
    pub fn is_informative(&self) -> bool {
        self.counts_reported || self.reported_valid.is_some()
    }

    /// `true` when the backend sent a `valid` flag that contradicts its own counts.
    pub fn flag_contradicts_counts(&self) -> bool {
        self.counts_reported
            && self
                .reported_valid
                .is_some_and(|flag| flag != self.is_valid())
    }

    pub fn summary(&self) -> String {
        format!(
            "{} events, {} forms checked, {} snapshots, missing={}, extra={}",
            self.events_checked,
            self.forms_checked,
            self.snapshots_found,
            self.missing_count,
            self.extra_count
        )
    }
}

/// Everything fetched for one patient during DISCOVER.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub events: Vec<DiscoveredEvent>,
}

#[derive(Debug, Clone)]
pub struct DiscoveredEvent {
    pub event: ScheduledEvent,
    pub expected: Vec<VisitForm>,
    pub snapshots: Vec<FormSnapshot>,
}

impl Discovery {
    pub fn compare(&self) -> IntegrityReport {
        IntegrityReport::from_comparisons(
            self.events
                .iter()
                .map(|e| compare_event(&e.event, &e.expected, &e.snapshots))
                .collect(),
        )
    }

    pub fn snapshot_ids(&self) -> Vec<EntityId> {
        self.events
            .iter()
            .flat_map(|e| e.snapshots.iter().map(|s| s.id.clone()))
            .collect()
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &FormSnapshot> {
        self.events.iter().flat_map(|e| e.snapshots.iter())
    }

    /// Finds the snapshot materialized from `form_id` for the scheduled event `event_id`.
    pub fn snapshot_for(&self, event_id: &EntityId, form_id: &EntityId) -> Option<&FormSnapshot> {
        self.events
            .iter()
            .filter(|e| &e.event.id == event_id)
            .flat_map(|e| e.snapshots.iter())
            .find(|s| &s.form_id == form_id)
    }
}

/// Phases of a single verification run, in the order they were entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationPhase {
    Discover,
    Compare,
    Refresh,
    RepairMissing,
    Reverify,
    Report,
}

/// Why a verification run ended in FAILED.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FailureReason {
    #[error("could not enumerate snapshots: {0}")]
    Discovery(String),
    #[error("refresh endpoint failed: {0}")]
    RefreshEndpoint(String),
    #[error("repair endpoint failed: {0}")]
    RepairEndpoint(String),
    #[error("snapshots still inconsistent after refresh and repair: {0}")]
    PostRepairMismatch(String),
}

/// Terminal state of a verification run.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationOutcome {
    Valid { repaired: bool },
    Failed(FailureReason),
}

impl fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationOutcome::Valid { repaired: false } => write!(f, "VALID"),
            VerificationOutcome::Valid { repaired: true } => write!(f, "VALID (after repair)"),
            VerificationOutcome::Failed(reason) => write!(f, "FAILED: {reason}"),
        }
    }
}

/// Full record of one verification run.
#[derive(Debug, Clone)]
pub struct VerificationRun {
    pub phases: Vec<VerificationPhase>,
    pub initial: Option<IntegrityReport>,
    pub final_report: Option<IntegrityReport>,
    /// Discovery backing `final_report`.
    pub discovery: Option<Discovery>,
    pub outcome: VerificationOutcome,
}

impl VerificationRun {
    pub fn is_valid(&self) -> bool {
        matches!(self.outcome, VerificationOutcome::Valid { .. })
    }
}

/// Drives verification calls for one harness.
pub struct SnapshotVerifier<'a> {
    harness: &'a Harness,
}

impl<'a> SnapshotVerifier<'a> {
    pub fn new(harness: &'a Harness) -> Self {
        Self { harness }
    }

    /// DISCOVER: scheduled events, then per event the assigned forms and the snapshots.
    ///
    /// # Errors
    ///
    /// Returns `FailureReason::Discovery` if any listing call fails.
    pub async fn discover(&self, subject_id: &EntityId) -> Result<Discovery, FailureReason> {
        let client = self.harness.client();

        let response = client
            .call(ApiRequest::get(format!("/events/subject/{subject_id}")))
            .await;
        if !response.ok {
            return Err(FailureReason::Discovery(format!(
                "scheduled events for subject {subject_id}: {}",
                response.error_message()
            )));
        }
        let events: Vec<ScheduledEvent> = normalize::typed_rows(&response.data);

        let mut discovered = Vec::with_capacity(events.len());
        for event in events {
            let expected = client
                .call(ApiRequest::get(format!("/events/instance/{}/visit-forms", event.id)))
                .await;
            if !expected.ok {
                return Err(FailureReason::Discovery(format!(
                    "visit forms for event {}: {}",
                    event.id,
                    expected.error_message()
                )));
            }

            let actual = client
                .call(ApiRequest::get(format!(
                    "/events/instance/{}/form-snapshots",
                    event.id
                )))
                .await;
            if !actual.ok {
                return Err(FailureReason::Discovery(format!(
                    "form snapshots for event {}: {}",
                    event.id,
                    actual.error_message()
                )));
            }

            discovered.push(DiscoveredEvent {
                expected: normalize::typed_rows(&expected.data),
                snapshots: normalize::typed_rows(&actual.data),
                event,
            });
        }

        Ok(Discovery { events: discovered })
    }

    /// Fetches the backend's own integrity report, if the endpoint answers.
    pub async fn backend_report(&self, subject_id: &EntityId) -> Option<IntegrityReport> {
        let response = self
            .harness
            .client()
            .call(ApiRequest::get(format!("/events/verify/subject/{subject_id}")))
            .await;
        response
            .ok
            .then(|| IntegrityReport::from_backend(&response.data))
    }

    /// REFRESH: delete and recreate every snapshot of the patient.
    ///
    /// # Errors
    ///
    /// Returns `FailureReason::RefreshEndpoint` if the call fails.
    pub async fn refresh(&self, subject_id: &EntityId) -> Result<Value, FailureReason> {
        let response = self
            .harness
            .client()
            .call(ApiRequest::post(format!(
                "/events/verify/subject/{subject_id}/refresh-snapshots"
            )))
            .await;
        if response.ok {
            Ok(response.data)
        } else {
            Err(FailureReason::RefreshEndpoint(format!(
                "{} ({})",
                response.error_message(),
                response.status
            )))
        }
    }

    /// REPAIR_MISSING: create only the snapshots that do not exist.
    ///
    /// # Errors
    ///
    /// Returns `FailureReason::RepairEndpoint` if the call fails.
    pub async fn repair(&self, subject_id: &EntityId) -> Result<Value, FailureReason> {
        let response = self
            .harness
            .client()
            .call(ApiRequest::post(format!(
                "/events/verify/subject/{subject_id}/repair"
            )))
            .await;
        if response.ok {
            Ok(response.data)
        } else {
            Err(FailureReason::RepairEndpoint(format!(
                "{} ({})",
                response.error_message(),
                response.status
            )))
        }
    }

    /// Runs DISCOVER and COMPARE, repairing only when the graph is inconsistent.
    pub async fn verify(&self, subject_id: &EntityId) -> VerificationRun {
        self.run(subject_id, false).await
    }

    /// Runs the repair protocol unconditionally, then re-verifies.
    pub async fn refresh_and_repair(&self, subject_id: &EntityId) -> VerificationRun {
        self.run(subject_id, true).await
    }

    async fn run(&self, subject_id: &EntityId, force_repair: bool) -> VerificationRun {
        let sink = self.harness.sink();
        let mut run = VerificationRun {
            phases: vec![VerificationPhase::Discover],
            initial: None,
            final_report: None,
            discovery: None,
            outcome: VerificationOutcome::Valid { repaired: false },
        };

        let discovery = match self.discover(subject_id).await {
            Ok(discovery) => discovery,
            Err(reason) => return self.finish(run, VerificationOutcome::Failed(reason)),
        };

        run.phases.push(VerificationPhase::Compare);
        let initial = discovery.compare();
        tracing::info!("subject {}: {}", subject_id, initial.summary());
        self.log_events(&initial);

        if initial.is_valid() && !force_repair {
            run.initial = Some(initial.clone());
            run.final_report = Some(initial);
            run.discovery = Some(discovery);
            return self.finish(run, VerificationOutcome::Valid { repaired: false });
        }

        if !initial.is_valid() {
            sink.record_warning(&format!(
                "subject {subject_id} snapshots inconsistent ({}); attempting refresh and repair",
                initial.summary()
            ));
        }
        run.initial = Some(initial);

        run.phases.push(VerificationPhase::Refresh);
        match self.refresh(subject_id).await {
            Ok(body) => tracing::info!("refresh completed: {}", body),
            Err(reason) => return self.finish(run, VerificationOutcome::Failed(reason)),
        }

        run.phases.push(VerificationPhase::RepairMissing);
        match self.repair(subject_id).await {
            Ok(body) => tracing::info!("repair completed: {}", body),
            Err(reason) => return self.finish(run, VerificationOutcome::Failed(reason)),
        }

        run.phases.push(VerificationPhase::Reverify);
        let discovery = match self.discover(subject_id).await {
            Ok(discovery) => discovery,
            Err(reason) => return self.finish(run, VerificationOutcome::Failed(reason)),
        };
        let report = discovery.compare();
        tracing::info!("subject {} after repair: {}", subject_id, report.summary());
        self.log_events(&report);

        let outcome = if report.is_valid() {
            VerificationOutcome::Valid { repaired: true }
        } else {
            self.record_mismatches(&report);
            VerificationOutcome::Failed(FailureReason::PostRepairMismatch(report.summary()))
        };
        run.final_report = Some(report);
        run.discovery = Some(discovery);
        self.finish(run, outcome)
    }

    fn finish(
        &self,
        mut run: VerificationRun,
        outcome: VerificationOutcome,
    ) -> VerificationRun {
        run.phases.push(VerificationPhase::Report);
        match &outcome {
            VerificationOutcome::Valid { .. } => {
                self.harness.sink().record_pass(&format!("snapshot integrity {outcome}"));
            }
            VerificationOutcome::Failed(reason) => {
                self.harness.sink().record_failure(Failure::new(
                    "snapshot-integrity",
                    reason.to_string(),
                ));
            }
        }
        run.outcome = outcome;
        run
    }

    fn log_events(&self, report: &IntegrityReport) {
        for event in &report.events {
            tracing::info!(
                "  event {} ({}): expected={} actual={} match={}",
                event.patient_event_id,
                event.event_name.as_deref().unwrap_or("unnamed"),
                event.expected_forms,
                event.actual_forms,
                event.matches()
            );
        }
    }

    fn record_mismatches(&self, report: &IntegrityReport) {
        for event in report.events.iter().filter(|e| !e.matches()) {
            let missing: Vec<String> = event.missing_form_ids.iter().map(|id| id.to_string()).collect();
            let extra: Vec<String> = event.extra_snapshot_ids.iter().map(|id| id.to_string()).collect();
            self.harness.sink().record_failure(Failure {
                endpoint: format!("snapshot-integrity event {}", event.patient_event_id),
                status: None,
                error: format!(
                    "expected {} forms, found {}; missing templates [{}], extra snapshots [{}]",
                    event.expected_forms,
                    event.actual_forms,
                    missing.join(", "),
                    extra.join(", ")
                ),
                request_body: None,
                response_body: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: i64, definition: i64) -> ScheduledEvent {
        serde_json::from_value(json!({"id": id, "eventDefinitionId": definition})).unwrap()
    }

    fn assigned(form_ids: &[i64]) -> Vec<VisitForm> {
        form_ids
            .iter()
            .map(|id| serde_json::from_value(json!({"formId": id})).unwrap())
            .collect()
    }

    fn snapshots(pairs: &[(i64, i64)]) -> Vec<FormSnapshot> {
        pairs
            .iter()
            .map(|(id, form)| serde_json::from_value(json!({"id": id, "formId": form})).unwrap())
            .collect()
    }

    #[test]
    fn test_compare_event_exact_match() {
        let result = compare_event(
            &event(1, 10),
            &assigned(&[1, 2, 3]),
            &snapshots(&[(100, 3), (101, 1), (102, 2)]),
        );
        assert!(result.matches());
        assert_eq!((result.expected_forms, result.actual_forms), (3, 3));
    }

    #[test]
    fn test_compare_event_missing_extra_and_duplicate() {
        let result = compare_event(
            &event(1, 10),
            &assigned(&[1, 2, 3]),
            &snapshots(&[(100, 1), (101, 1), (102, 9)]),
        );
        assert_eq!(result.missing_form_ids, vec![EntityId::Num(2), EntityId::Num(3)]);
        assert_eq!(
            result.extra_snapshot_ids,
            vec![EntityId::Num(101), EntityId::Num(102)]
        );
        assert!(!result.matches());
    }

    #[test]
    fn test_report_totals_three_visits_of_six_forms() {
        let forms = [1, 2, 3, 4, 5, 6];
        let comparisons: Vec<EventComparison> = [10, 11, 12]
            .iter()
            .enumerate()
            .map(|(i, def)| {
                let base = (i as i64) * 100;
                let snaps: Vec<(i64, i64)> = forms.iter().map(|f| (base + f, *f)).collect();
                compare_event(&event(i as i64 + 1, *def), &assigned(&forms), &snapshots(&snaps))
            })
            .collect();

        let report = IntegrityReport::from_comparisons(comparisons);
        assert_eq!(report.events_checked, 3);
        assert_eq!(report.forms_checked, 18);
        assert_eq!(report.snapshots_found, 18);
        assert_eq!((report.missing_count, report.extra_count), (0, 0));
        assert!(report.is_valid());
    }

    #[test]
    fn test_backend_report_without_valid_flag_is_valid_on_zero_counts() {
        let report = IntegrityReport::from_backend(&json!({
            "totalEventsChecked": 3,
            "totalFormsChecked": 18,
            "missingCount": 0,
            "extraCount": 0
        }));
        assert_eq!(report.reported_valid, None);
        assert!(report.is_valid());
        assert!(!report.flag_contradicts_counts());
    }

    #[test]
    fn test_backend_report_counts_win_over_flag() {
        let report = IntegrityReport::from_backend(&json!({
            "valid": true,
            "events": [
                {"patientEventId": 5, "expectedForms": 6, "actualForms": 5, "missing": [4]}
            ]
        }));
        assert_eq!(report.missing_count, 1);
        assert_eq!(report.events_checked, 1);
        assert!(!report.is_valid());
        assert!(report.flag_contradicts_counts());
    }

    #[test]
    fn test_backend_report_accepts_id_arrays_for_counts() {
        let report = IntegrityReport::from_backend(&json!({
            "valid": false,
            "missing_forms": [{"formId": 3}],
            "extra": []
        }));
        assert_eq!(report.missing_count, 1);
        assert_eq!(report.extra_count, 0);
        assert!(!report.flag_contradicts_counts());
    }

    #[test]
    fn test_backend_flag_decides_when_counts_are_absent() {
        let invalid = IntegrityReport::from_backend(&json!({"valid": false}));
        assert!(!invalid.counts_reported);
        assert!(!invalid.is_valid());
        assert!(!invalid.flag_contradicts_counts());
        assert!(invalid.is_informative());

        let valid = IntegrityReport::from_backend(&json!({"success": true, "valid": true}));
        assert!(valid.is_valid());

        let empty = IntegrityReport::from_backend(&json!({"totalEventsChecked": 3}));
        assert!(!empty.is_informative());
        assert!(!empty.is_valid());
    }

    #[test]
    fn test_compare_event_matches_ids_across_shapes() {
        let expected: Vec<VisitForm> =
            vec![serde_json::from_value(json!({"formId": "3"})).unwrap()];
        let actual = snapshots(&[(100, 3)]);
        let result = compare_event(&event(1, 10), &expected, &actual);
        assert!(result.matches(), "{result:?}");
        assert!(result.missing_form_ids.is_empty());
        assert!(result.extra_snapshot_ids.is_empty());
    }
}
