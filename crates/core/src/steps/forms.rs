//! Template forms: creation, forking, workflow flags and validation rules.

use super::{entity_id, expect_ok, find_row, require, require_list, StepError, StepId, StepResult};
use crate::client::ApiRequest;
use crate::fixtures::{self, FORK_SUFFIX};
use crate::normalize;
use crate::{Harness, TestState};
use serde_json::{json, Value};

const NAME_KEYS: &[&str] = &["name", "formName", "form_name"];

async fn list_forms(harness: &Harness) -> Result<Vec<Value>, StepError> {
    let response = expect_ok(
        harness.client().call(ApiRequest::get("/forms")).await,
        "form listing",
    )?;
    Ok(normalize::rows(&response.data))
}

pub(super) async fn create_forms(harness: &Harness) -> StepResult {
    let state = harness.state();
    require(&state.access_token, "accessToken", StepId::Login)?;

    let existing = list_forms(harness).await?;
    let mut form_ids = Vec::new();
    for form in fixtures::forms() {
        if let Some(row) = find_row(&existing, NAME_KEYS, form.name) {
            form_ids.push(entity_id(row, &["formId", "crfId"], "form lookup")?);
            continue;
        }

        let created = expect_ok(
            harness
                .client()
                .call(ApiRequest::post("/forms").json(form.to_request()))
                .await,
            "form creation",
        )?;
        let id = entity_id(&created.data, &["formId", "crfId"], "form creation")?;
        tracing::info!("created form '{}' ({})", form.name, id);
        form_ids.push(id);
    }

    harness.update_state(TestState {
        form_ids: Some(form_ids),
        ..Default::default()
    })?;
    Ok(())
}

/// Forks the first template and applies each fixture's workflow flags.
pub(super) async fn configure_forms(harness: &Harness) -> StepResult {
    let state = harness.state();
    let form_ids = require_list(&state.form_ids, "formIds", StepId::CreateForms)?;
    let client = harness.client();
    let fixtures = fixtures::forms();

    let source = &fixtures[0];
    let fork_name = format!("{}{}", source.name, FORK_SUFFIX);
    let existing = list_forms(harness).await?;
    let forked_form_id = match find_row(&existing, NAME_KEYS, &fork_name) {
        Some(row) => entity_id(row, &["formId"], "fork lookup")?,
        None => {
            let forked = expect_ok(
                client
                    .call(
                        ApiRequest::post(format!("/forms/{}/fork", form_ids[0]))
                            .json(json!({ "name": fork_name })),
                    )
                    .await,
                "form fork",
            )?;
            entity_id(&forked.data, &["formId", "newFormId"], "form fork")?
        }
    };
    tracing::info!("fork of form {} is {}", form_ids[0], forked_form_id);

    let mut workflow_form_ids = Vec::new();
    for (form_id, fixture) in form_ids.iter().zip(&fixtures) {
        let body = json!({
            "requiresSignature": fixture.electronic_signature,
            "requiresDoubleEntry": fixture.double_entry,
            "requiresSdv": fixture.required,
        });
        expect_ok(
            client
                .call(ApiRequest::put(format!("/forms/workflow-config/{form_id}")).json(body))
                .await,
            "workflow configuration",
        )?;
        workflow_form_ids.push(form_id.clone());
    }

    harness.update_state(TestState {
        forked_form_id: Some(forked_form_id),
        workflow_form_ids: Some(workflow_form_ids),
        ..Default::default()
    })?;
    Ok(())
}

pub(super) async fn create_validation_rules(harness: &Harness) -> StepResult {
    let state = harness.state();
    let form_ids = require_list(&state.form_ids, "formIds", StepId::CreateForms)?;
    let vitals = &form_ids[0];
    let client = harness.client();

    let existing = expect_ok(
        client
            .call(ApiRequest::get(format!("/validation-rules/form/{vitals}")))
            .await,
        "validation rule listing",
    )?;
    let existing = normalize::rows(&existing.data);

    let mut rule_ids = Vec::new();
    for rule in fixtures::validation_rules() {
        if let Some(row) = find_row(&existing, &["name", "ruleName"], rule.name) {
            rule_ids.push(entity_id(row, &["ruleId"], "rule lookup")?);
            continue;
        }

        let body = json!({
            "formId": vitals,
            "fieldName": rule.field_name,
            "name": rule.name,
            "ruleType": "range",
            "minValue": rule.min,
            "maxValue": rule.max,
            "errorMessage": rule.message,
            "severity": "error",
        });
        let created = expect_ok(
            client
                .call(ApiRequest::post("/validation-rules").json(body))
                .await,
            "validation rule creation",
        )?;
        rule_ids.push(entity_id(&created.data, &["ruleId"], "validation rule creation")?);
    }

    harness.update_state(TestState {
        rule_ids: Some(rule_ids),
        ..Default::default()
    })?;
    Ok(())
}
