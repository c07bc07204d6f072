//! Authenticated access to the EDC backend.
//!
//! [`EdcClient::call`] is the only way the harness talks to the backend. It:
//!
//! - attaches `Authorization: Bearer <token>` using the access token in the state store, unless
//!   the request opts out with [`ApiRequest::no_auth`], in which case an explicit empty
//!   `Authorization` header is sent and never overwritten;
//! - recovers from an expired token: on a 401 it logs in again with the stored admin identity,
//!   persists the new tokens and retries the original request once;
//! - never fails: transport errors and timeouts come back as an [`ApiResponse`] with
//!   `status == 0`;
//! - records every non-2xx final outcome to the result sink unless the request is `quiet`.
//!
//! ## Refresh state machine
//!
//! The client is either IDLE or REFRESHING. Entering REFRESHING is a compare-and-swap on an
//! atomic flag wrapped in [`RefreshGuard`]; the guard returns the flag to IDLE when dropped, so
//! every exit path (success, failed login, early return, unwinding) releases it. A 401 that
//! arrives while the flag is held, including the 401 of the retried request itself, is passed
//! through without a second login.

use crate::config::AdminIdentity;
use crate::constants::LOGIN_PATH;
use crate::diagnostics::{Failure, ResultSink};
use crate::model::LoginResponse;
use crate::normalize;
use crate::state::{StateStore, TestState};
use crate::{HarnessError, HarnessResult};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// An outbound request description.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: Option<Value>,
    query: Vec<(String, String)>,
    no_auth: bool,
    quiet: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            query: Vec::new(),
            no_auth: false,
            quiet: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Sends the request without a bearer token (login, registration).
    pub fn no_auth(mut self) -> Self {
        self.no_auth = true;
        self
    }

    /// Suppresses failure reporting; the caller inspects the response itself.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn endpoint(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Normalized outcome of a call. `data` holds the unwrapped payload on success and the raw
/// body on failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub ok: bool,
    pub status: u16,
    pub data: Value,
}

impl ApiResponse {
    fn transport_failure(message: String) -> Self {
        Self {
            ok: false,
            status: 0,
            data: json!({ "message": message }),
        }
    }

    /// Deserializes the payload into `T`, or `None` when the call failed or the shape is wrong.
    pub fn parse<T: DeserializeOwned>(&self) -> Option<T> {
        if !self.ok {
            return None;
        }
        match serde_json::from_value(self.data.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("unexpected response shape: {}", e);
                None
            }
        }
    }

    pub fn error_message(&self) -> String {
        normalize::error_message(&self.data)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }
}

/// Scoped ownership of the REFRESHING state.
///
/// At most one guard exists per flag at a time; dropping it returns the flag to IDLE.
#[derive(Debug)]
pub struct RefreshGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RefreshGuard<'a> {
    /// Attempts the IDLE → REFRESHING transition. Returns `None` if a refresh is in flight.
    pub fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// HTTP client bound to one backend, one state store and one result sink.
pub struct EdcClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    store: StateStore,
    sink: Arc<dyn ResultSink>,
    admin: AdminIdentity,
    refreshing: AtomicBool,
}

impl EdcClient {
    /// Builds a client.
    ///
    /// `admin` is the fallback identity for token refresh when the state store does not hold
    /// one yet.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::HttpClient` if the underlying HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        store: StateStore,
        sink: Arc<dyn ResultSink>,
        admin: AdminIdentity,
    ) -> HarnessResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(HarnessError::HttpClient)?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            store,
            sink,
            admin,
            refreshing: AtomicBool::new(false),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Returns `true` while a token refresh is in flight.
    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Performs `request`, refreshing credentials once on a 401.
    pub async fn call(&self, request: ApiRequest) -> ApiResponse {
        let mut response = self.send(&request).await;

        if response.status == StatusCode::UNAUTHORIZED.as_u16() && !request.no_auth {
            match RefreshGuard::acquire(&self.refreshing) {
                Some(_guard) => {
                    if self.refresh_tokens().await {
                        tracing::debug!("retrying {} with refreshed token", request.endpoint());
                        response = self.send(&request).await;
                    }
                }
                None => {
                    tracing::debug!(
                        "token refresh already in flight; not refreshing for {}",
                        request.endpoint()
                    );
                }
            }
        }

        if !response.ok && !request.quiet {
            self.report(&request, &response);
        }

        response
    }

    /// Logs in with the stored admin identity and persists the new tokens.
    async fn refresh_tokens(&self) -> bool {
        let state = self.store.load();
        let username = state
            .admin_username
            .unwrap_or_else(|| self.admin.username.to_string());
        let password = state
            .admin_password
            .unwrap_or_else(|| self.admin.password.to_string());

        tracing::info!("access token rejected; logging in again as {}", username);

        let login = ApiRequest::post(LOGIN_PATH)
            .json(json!({ "username": username, "password": password }))
            .no_auth()
            .quiet();
        let response = self.send(&login).await;

        let Some(tokens) = response.parse::<LoginResponse>() else {
            tracing::warn!(
                "token refresh failed ({}): {}",
                response.status,
                response.error_message()
            );
            return false;
        };

        let patch = TestState {
            access_token: Some(tokens.access_token),
            refresh_token: tokens.refresh_token,
            ..Default::default()
        };
        match self.store.update(patch) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("could not persist refreshed tokens: {}", e);
                false
            }
        }
    }

    async fn send(&self, request: &ApiRequest) -> ApiResponse {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.http.request(request.method.clone(), &url);

        if request.no_auth {
            builder = builder.header(AUTHORIZATION, HeaderValue::from_static(""));
        } else if let Some(token) = self.store.load().access_token {
            builder = builder.bearer_auth(token);
        }

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return ApiResponse::transport_failure(format!(
                    "request timed out after {}s",
                    self.timeout.as_secs_f32()
                ))
            }
            Err(e) => return ApiResponse::transport_failure(e.to_string()),
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return ApiResponse::transport_failure(e.to_string()),
        };
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        let ok = status.is_success();
        ApiResponse {
            ok,
            status: status.as_u16(),
            data: if ok { normalize::payload(body) } else { body },
        }
    }

    fn report(&self, request: &ApiRequest, response: &ApiResponse) {
        self.sink.record_failure(Failure {
            endpoint: request.endpoint(),
            status: (response.status != 0).then_some(response.status),
            error: response.error_message(),
            request_body: request.body.as_ref().map(redact),
            response_body: Some(response.data.clone()),
        });
    }
}

/// Masks credential values before a body is written to the diagnostics log.
fn redact(body: &Value) -> Value {
    match body {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let masked = if k.to_ascii_lowercase().contains("password") {
                        Value::String("***".into())
                    } else {
                        redact(v)
                    };
                    (k.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_guard_is_single_flight() {
        let flag = AtomicBool::new(false);

        let first = RefreshGuard::acquire(&flag);
        assert!(first.is_some());
        assert!(RefreshGuard::acquire(&flag).is_none());

        drop(first);
        assert!(!flag.load(Ordering::Acquire));
        assert!(RefreshGuard::acquire(&flag).is_some());
    }

    #[test]
    fn test_refresh_guard_released_on_unwind() {
        let flag = AtomicBool::new(false);
        let result = std::panic::catch_unwind(|| {
            let _guard = RefreshGuard::acquire(&flag).unwrap();
            panic!("login blew up");
        });
        assert!(result.is_err());
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn test_redact_masks_passwords() {
        let body = json!({
            "username": "admin",
            "adminPassword": "secret",
            "members": [{"password": "x", "email": "a@b.c"}]
        });
        let masked = redact(&body);
        assert_eq!(masked["adminPassword"], json!("***"));
        assert_eq!(masked["members"][0]["password"], json!("***"));
        assert_eq!(masked["members"][0]["email"], json!("a@b.c"));
        assert_eq!(masked["username"], json!("admin"));
    }

    #[test]
    fn test_request_builder() {
        let request = ApiRequest::get("/subjects")
            .query("studyId", 4)
            .quiet();
        assert_eq!(request.endpoint(), "GET /subjects");
        assert!(request.quiet && !request.no_auth);
        assert_eq!(request.query, vec![("studyId".to_string(), "4".to_string())]);
    }
}
