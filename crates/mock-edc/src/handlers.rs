//! HTTP handlers.
//!
//! Response envelopes are deliberately inconsistent across routes, the way the real backend's
//! are: some answer `{"success": true, "data": ...}`, some the bare entity, and list routes
//! mix bare arrays, `{"data": [...]}`, `{"data": {"items": [...]}}` and a double-wrapped
//! `{"data": {"data": [...]}}`.

use crate::store::{MockError, MockResult};
use crate::AppState;
use axum::{
    extract::{Path as AxumPath, Query, Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Paths reachable without a bearer token.
const OPEN_PATHS: &[&str] = &["/auth/login", "/organizations/register", "/health"];

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn failure(error: MockError) -> (StatusCode, Json<Value>) {
    (
        error.status,
        Json(json!({ "success": false, "message": error.message })),
    )
}

fn wrapped(result: MockResult<Value>) -> ApiResult {
    result
        .map(|data| Json(json!({ "success": true, "data": data })))
        .map_err(failure)
}

fn bare(result: MockResult<Value>) -> ApiResult {
    result.map(Json).map_err(failure)
}

fn query_id(params: &HashMap<String, String>, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.trim().parse().ok())
}

/// Counts every request and enforces bearer authentication outside [`OPEN_PATHS`].
pub async fn gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let full_path = request.uri().path().to_string();
    let path = full_path
        .strip_prefix("/api")
        .unwrap_or(&full_path)
        .to_string();
    state.store.record_request(&path);

    if OPEN_PATHS.contains(&path.as_str()) {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let authorized = match token {
        Some(token) => state.store.is_token_valid(&token),
        None => false,
    };
    if !authorized || state.store.is_forced_unauthorized(&path) {
        tracing::debug!("401 for {}", path);
        return failure(MockError::new(
            StatusCode::UNAUTHORIZED,
            "token expired or invalid",
        ))
        .into_response();
    }

    next.run(request).await
}

pub async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "message": "mock EDC is alive" }))
}

pub async fn login(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    bare(state.store.login(&body))
}

pub async fn register(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    wrapped(state.store.register(&body))
}

pub async fn list_users(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let users = state.store.search_users(params.get("search").map(String::as_str));
    Json(json!({ "success": true, "data": users }))
}

pub async fn create_user(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    bare(state.store.create_user(&body))
}

pub async fn list_forms(State(state): State<AppState>) -> Json<Value> {
    let forms = state.store.list_forms();
    Json(json!({ "success": true, "data": { "items": forms, "total": forms.len() } }))
}

pub async fn create_form(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    wrapped(state.store.create_form(&body))
}

pub async fn get_form(State(state): State<AppState>, AxumPath(id): AxumPath<i64>) -> ApiResult {
    wrapped(state.store.get_form(id))
}

pub async fn update_form(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<Value>,
) -> ApiResult {
    wrapped(state.store.update_form(id, &body))
}

pub async fn fork_form(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<Value>,
) -> ApiResult {
    wrapped(state.store.fork_form(id, &body))
}

pub async fn get_workflow_config(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult {
    bare(state.store.workflow_config(id))
}

pub async fn put_workflow_config(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<Value>,
) -> ApiResult {
    wrapped(state.store.set_workflow_config(id, &body))
}

pub async fn form_rules(State(state): State<AppState>, AxumPath(id): AxumPath<i64>) -> Json<Value> {
    Json(json!({ "success": true, "data": state.store.rules_for_form(id) }))
}

pub async fn create_rule(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    wrapped(state.store.create_rule(&body))
}

pub async fn list_studies(State(state): State<AppState>) -> Json<Value> {
    Json(Value::Array(state.store.list_studies()))
}

pub async fn create_study(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    wrapped(state.store.create_study(&body))
}

pub async fn create_site(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<Value>,
) -> ApiResult {
    bare(state.store.create_site(id, &body))
}

pub async fn list_definitions(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> Json<Value> {
    Json(json!({ "data": state.store.list_definitions(id) }))
}

pub async fn create_definition(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<Value>,
) -> ApiResult {
    wrapped(state.store.create_definition(id, &body))
}

pub async fn list_subjects(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let subjects = state.store.list_subjects(
        query_id(&params, "studyId"),
        params.get("label").map(String::as_str),
    );
    Json(json!({ "success": true, "data": { "data": subjects } }))
}

pub async fn create_subject(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    wrapped(state.store.create_subject(&body))
}

pub async fn schedule_event(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    wrapped(state.store.schedule(&body, false))
}

pub async fn unscheduled_event(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    bare(state.store.schedule(&body, true))
}

pub async fn subject_events(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> Json<Value> {
    Json(json!({ "success": true, "data": state.store.subject_events(id) }))
}

pub async fn visit_forms(State(state): State<AppState>, AxumPath(id): AxumPath<i64>) -> ApiResult {
    bare(state.store.visit_forms(id).map(Value::Array))
}

pub async fn form_snapshots(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult {
    wrapped(state.store.event_snapshots(id).map(Value::Array))
}

pub async fn snapshot_data(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult {
    wrapped(state.store.snapshot_data(id))
}

pub async fn save_snapshot_data(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<Value>,
) -> ApiResult {
    wrapped(state.store.save_snapshot_data(id, &body))
}

pub async fn verify_subject(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> Json<Value> {
    Json(json!({ "success": true, "data": state.store.verify(id) }))
}

pub async fn refresh_snapshots(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult {
    wrapped(state.store.refresh(id))
}

pub async fn repair_snapshots(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult {
    wrapped(state.store.repair(id))
}

pub async fn list_queries(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    Json(json!({ "success": true, "data": state.store.list_queries(query_id(&params, "subjectId")) }))
}

pub async fn create_query(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    wrapped(state.store.create_query(&body))
}
