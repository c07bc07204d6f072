//! Study, site and event definitions with their form assignments.

use super::{entity_id, expect_ok, find_row, require_list, StepId, StepResult};
use crate::client::ApiRequest;
use crate::fixtures::{self, STUDY_NAME, STUDY_PROTOCOL_NUMBER};
use crate::normalize;
use crate::types::EntityId;
use crate::{Harness, TestState};
use serde_json::{json, Value};

const PROTOCOL_KEYS: &[&str] = &["protocolNumber", "protocol_number", "protocolId"];

/// Assignment list for an event definition: every template with its fixture flags.
fn assignments(form_ids: &[EntityId]) -> Vec<Value> {
    form_ids
        .iter()
        .zip(fixtures::forms())
        .enumerate()
        .map(|(order, (form_id, fixture))| {
            json!({
                "formId": form_id,
                "order": order + 1,
                "required": fixture.required,
                "doubleEntry": fixture.double_entry,
                "electronicSignature": fixture.electronic_signature,
                "hidden": false,
            })
        })
        .collect()
}

pub(super) async fn create_study(harness: &Harness) -> StepResult {
    let state = harness.state();
    let form_ids = require_list(&state.form_ids, "formIds", StepId::CreateForms)?;
    let client = harness.client();

    let studies = expect_ok(
        client.call(ApiRequest::get("/studies")).await,
        "study listing",
    )?;
    let studies = normalize::rows(&studies.data);
    let (study_id, study) = match find_row(&studies, PROTOCOL_KEYS, STUDY_PROTOCOL_NUMBER) {
        Some(row) => (entity_id(row, &["studyId"], "study lookup")?, row.clone()),
        None => {
            let body = json!({
                "name": STUDY_NAME,
                "protocolNumber": STUDY_PROTOCOL_NUMBER,
                "description": "End-to-end snapshot consistency checks",
                "phase": "II",
                "status": "active",
                "expectedEnrollment": 10,
            });
            let created = expect_ok(
                client.call(ApiRequest::post("/studies").json(body)).await,
                "study creation",
            )?;
            let id = entity_id(&created.data, &["studyId"], "study creation")?;
            tracing::info!("created study {} ({})", STUDY_PROTOCOL_NUMBER, id);
            (id, created.data)
        }
    };

    let known_sites = normalize::field(&study, &["sites"])
        .map(normalize::rows)
        .unwrap_or_default();
    let mut site_ids = Vec::new();
    for site in fixtures::sites() {
        if let Some(row) = find_row(&known_sites, &["siteNumber", "site_number"], site.site_number)
        {
            site_ids.push(entity_id(row, &["siteId"], "site lookup")?);
            continue;
        }
        let body = json!({
            "name": site.name,
            "siteNumber": site.site_number,
            "status": "active",
        });
        let created = expect_ok(
            client
                .call(ApiRequest::post(format!("/studies/{study_id}/sites")).json(body))
                .await,
            "site creation",
        )?;
        site_ids.push(entity_id(&created.data, &["siteId"], "site creation")?);
    }

    let definitions = expect_ok(
        client
            .call(ApiRequest::get(format!("/studies/{study_id}/events")))
            .await,
        "event definition listing",
    )?;
    let definitions = normalize::rows(&definitions.data);
    let forms = assignments(form_ids);
    let mut event_definition_ids = Vec::new();
    for event in fixtures::event_definitions() {
        if let Some(row) = find_row(&definitions, &["name", "eventName"], event.name) {
            event_definition_ids.push(entity_id(row, &["eventDefinitionId"], "event lookup")?);
            continue;
        }
        let body = json!({
            "name": event.name,
            "description": event.description,
            "order": event.order,
            "type": "scheduled",
            "repeating": false,
            "dayOffset": event.day_offset,
            "forms": forms,
        });
        let created = expect_ok(
            client
                .call(ApiRequest::post(format!("/studies/{study_id}/events")).json(body))
                .await,
            "event definition creation",
        )?;
        event_definition_ids.push(entity_id(
            &created.data,
            &["eventDefinitionId"],
            "event definition creation",
        )?);
    }

    harness.update_state(TestState {
        study_id: Some(study_id),
        site_ids: Some(site_ids),
        event_definition_ids: Some(event_definition_ids),
        ..Default::default()
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignments_follow_fixture_order_and_flags() {
        let ids: Vec<EntityId> = (1..=6).map(EntityId::Num).collect();
        let forms = assignments(&ids);
        assert_eq!(forms.len(), 6);
        assert_eq!(forms[0]["formId"], json!(1));
        assert_eq!(forms[0]["doubleEntry"], json!(true));
        assert_eq!(forms[3]["electronicSignature"], json!(true));
        assert_eq!(forms[5]["order"], json!(6));
    }
}
