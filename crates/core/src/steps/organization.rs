//! Organization, admin session and staff accounts.

use super::{entity_id, expect_ok, find_row, require, StepError, StepId, StepResult};
use crate::client::ApiRequest;
use crate::constants::LOGIN_PATH;
use crate::fixtures;
use crate::model::LoginResponse;
use crate::normalize;
use crate::{Harness, TestState};
use serde_json::json;

async fn log_in(harness: &Harness, username: &str, password: &str) -> Option<LoginResponse> {
    harness
        .client()
        .call(
            ApiRequest::post(LOGIN_PATH)
                .json(json!({ "username": username, "password": password }))
                .no_auth()
                .quiet(),
        )
        .await
        .parse::<LoginResponse>()
}

fn session_patch(tokens: LoginResponse) -> TestState {
    let (admin_user_id, organization_id) = match tokens.user {
        Some(user) => (Some(user.id), user.organization_id),
        None => (None, None),
    };
    TestState {
        access_token: Some(tokens.access_token),
        refresh_token: tokens.refresh_token,
        admin_user_id,
        organization_id,
        ..Default::default()
    }
}

/// Registers the organization and its admin, or reuses them if the admin can already log in.
pub(super) async fn register_organization(harness: &Harness) -> StepResult {
    let admin = harness.config().admin();
    let identity = TestState {
        admin_username: Some(admin.username.to_string()),
        admin_email: Some(admin.email.to_string()),
        admin_password: Some(admin.password.to_string()),
        ..Default::default()
    };

    if let Some(tokens) = log_in(harness, admin.username.as_str(), admin.password.as_str()).await
    {
        tracing::info!("admin {} already registered; reusing", admin.username);
        let mut patch = session_patch(tokens);
        patch.merge(identity);
        let state = harness.update_state(patch)?;
        if state.organization_id.is_none() {
            return Err(StepError::Failed(
                "admin exists but no organization id is known for it".into(),
            ));
        }
        return Ok(());
    }

    let body = json!({
        "organization": {
            "name": admin.organization_name.as_str(),
            "type": "research",
        },
        "admin": {
            "username": admin.username.as_str(),
            "email": admin.email.as_str(),
            "password": admin.password.as_str(),
            "firstName": "Harness",
            "lastName": "Admin",
        },
    });
    let response = expect_ok(
        harness
            .client()
            .call(ApiRequest::post("/organizations/register").json(body).no_auth())
            .await,
        "organization registration",
    )?;

    let organization =
        normalize::field(&response.data, &["organization"]).unwrap_or(&response.data);
    let organization_id = entity_id(
        organization,
        &["organizationId", "organization_id"],
        "organization registration",
    )?;
    let admin_user_id = normalize::field(&response.data, &["user", "admin"])
        .and_then(|user| normalize::id(user, &["userId", "user_id"]))
        .or_else(|| normalize::id(&response.data, &["userId", "adminUserId"]));

    let mut patch = identity;
    patch.organization_id = Some(organization_id.clone());
    patch.admin_user_id = admin_user_id;
    harness.update_state(patch)?;

    let tokens = log_in(harness, admin.username.as_str(), admin.password.as_str())
        .await
        .ok_or_else(|| StepError::Failed("registered admin cannot log in".into()))?;
    let mut session = session_patch(tokens);
    session.organization_id = Some(organization_id.clone());
    harness.update_state(session)?;

    tracing::info!("registered organization {}", organization_id);
    Ok(())
}

/// Logs in with the stored admin identity, falling back to the configured one.
pub(super) async fn login(harness: &Harness) -> StepResult {
    let state = harness.state();
    let admin = harness.config().admin();
    let username = state
        .admin_username
        .unwrap_or_else(|| admin.username.to_string());
    let password = state
        .admin_password
        .unwrap_or_else(|| admin.password.to_string());

    let tokens = log_in(harness, &username, &password)
        .await
        .ok_or_else(|| StepError::Failed(format!("login as {username} failed")))?;
    let mut patch = session_patch(tokens);
    // Login must not move the harness to another organization.
    if state.organization_id.is_some() {
        patch.organization_id = None;
    }
    harness.update_state(patch)?;
    tracing::info!("logged in as {}", username);
    Ok(())
}

pub(super) async fn create_members(harness: &Harness) -> StepResult {
    let state = harness.state();
    let organization_id = require(
        &state.organization_id,
        "organizationId",
        StepId::RegisterOrganization,
    )?;
    let client = harness.client();

    let mut member_ids = Vec::new();
    for member in fixtures::members() {
        let existing = client
            .call(ApiRequest::get("/users").query("search", member.username))
            .await;
        let rows = normalize::rows(&expect_ok(existing, "user lookup")?.data);
        if let Some(row) = find_row(&rows, &["username"], member.username) {
            member_ids.push(entity_id(row, &["userId"], "user lookup")?);
            continue;
        }

        let body = json!({
            "username": member.username,
            "email": member.email,
            "firstName": member.first_name,
            "lastName": member.last_name,
            "role": member.role,
            "password": harness.config().admin().password.as_str(),
            "organizationId": organization_id,
        });
        let created = expect_ok(
            client.call(ApiRequest::post("/users").json(body)).await,
            "user creation",
        )?;
        let id = entity_id(&created.data, &["userId"], "user creation")?;
        tracing::info!("created member {} ({})", member.username, id);
        member_ids.push(id);
    }

    harness.update_state(TestState {
        member_ids: Some(member_ids),
        ..Default::default()
    })?;
    Ok(())
}
