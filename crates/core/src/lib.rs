//! # EDC Harness Core
//!
//! End-to-end checks for an EDC backend's template/snapshot architecture. Study and form
//! templates are the source of truth; every scheduled patient visit materializes its own
//! snapshot copy of the assigned forms. This crate drives the backend through an ordered,
//! resumable sequence of steps and verifies (and, when needed, repairs) the snapshot graph.
//!
//! - [`state`]: persisted cross-run identifiers
//! - [`client`]: authenticated HTTP access with single-flight token refresh
//! - [`orchestrator`] and [`steps`]: ordered, re-runnable steps
//! - [`verifier`]: snapshot consistency, content validation and data round-trips
//! - [`diagnostics`]: pass/warn/fail signalling and the JSONL failure log
//!
//! **No process concerns**: environment parsing, logging setup and exit codes belong to the
//! binaries (`edc-run`, `edc-cli`).

pub mod client;
pub mod config;
pub mod constants;
pub mod diagnostics;
pub mod error;
pub mod fixtures;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod state;
pub mod steps;
pub mod types;
pub mod verifier;

pub use client::{ApiRequest, ApiResponse, EdcClient};
pub use config::{AdminIdentity, HarnessConfig, RefreshDataPolicy};
pub use diagnostics::{Failure, JsonlSink, ResultSink};
pub use error::{HarnessError, HarnessResult};
pub use orchestrator::{Orchestrator, SuiteReport};
pub use state::{StateStore, TestState};
pub use steps::{StepError, StepId};
pub use types::{EntityId, NonEmptyText};
pub use verifier::SnapshotVerifier;

use std::sync::Arc;

/// Everything a step needs, constructed once at startup and passed by reference.
pub struct Harness {
    cfg: Arc<HarnessConfig>,
    store: StateStore,
    sink: Arc<JsonlSink>,
    client: EdcClient,
}

impl Harness {
    /// Builds the harness context from a resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::HttpClient` if the HTTP client cannot be constructed.
    pub fn new(cfg: Arc<HarnessConfig>) -> HarnessResult<Self> {
        let store = StateStore::new(cfg.state_file());
        let sink = Arc::new(JsonlSink::new(cfg.diagnostics_log()));
        let client = EdcClient::new(
            cfg.base_url(),
            cfg.request_timeout(),
            store.clone(),
            sink.clone(),
            cfg.admin().clone(),
        )?;

        Ok(Self {
            cfg,
            store,
            sink,
            client,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.cfg
    }

    pub fn client(&self) -> &EdcClient {
        &self.client
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn sink(&self) -> &JsonlSink {
        &self.sink
    }

    /// Current persisted state.
    pub fn state(&self) -> TestState {
        self.store.load()
    }

    /// Merges `patch` into the persisted state and returns the result.
    ///
    /// # Errors
    ///
    /// Propagates state file write failures.
    pub fn update_state(&self, patch: TestState) -> HarnessResult<TestState> {
        self.store.update(patch)
    }

    pub fn verifier(&self) -> SnapshotVerifier<'_> {
        SnapshotVerifier::new(self)
    }
}
