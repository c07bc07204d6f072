use super::{entity_id, expect_ok, find_row, require, require_list, StepId, StepResult};
use crate::client::ApiRequest;
use crate::fixtures::QUERY_DESCRIPTION;
use crate::normalize;
use crate::{Harness, TestState};
use serde_json::json;

/// Raises a data clarification query on the first snapshot, once per subject.
pub(super) async fn raise_query(harness: &Harness) -> StepResult {
    let state = harness.state();
    let subject_id = require(&state.subject_id, "subjectId", StepId::EnrollSubject)?;
    let snapshot_ids = require_list(&state.snapshot_ids, "snapshotIds", StepId::VerifySnapshots)?;
    let client = harness.client();

    let existing = expect_ok(
        client
            .call(ApiRequest::get("/queries").query("subjectId", subject_id))
            .await,
        "query listing",
    )?;
    let rows = normalize::rows(&existing.data);
    let query_id = match find_row(&rows, &["description", "queryText"], QUERY_DESCRIPTION) {
        Some(row) => entity_id(row, &["queryId"], "query lookup")?,
        None => {
            let body = json!({
                "studyId": state.study_id,
                "subjectId": subject_id,
                "patientFormId": snapshot_ids[0],
                "fieldName": "heart_rate",
                "queryType": "data_clarification",
                "priority": "medium",
                "description": QUERY_DESCRIPTION,
            });
            let created = expect_ok(
                client.call(ApiRequest::post("/queries").json(body)).await,
                "query creation",
            )?;
            entity_id(&created.data, &["queryId"], "query creation")?
        }
    };
    tracing::info!("query {} open on snapshot {}", query_id, snapshot_ids[0]);

    harness.update_state(TestState {
        query_ids: Some(vec![query_id]),
        ..Default::default()
    })?;
    Ok(())
}
