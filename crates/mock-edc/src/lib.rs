//! # Mock EDC
//!
//! In-memory stand-in for the EDC backend the harness drives. It implements the REST surface
//! the harness uses, materializes snapshots the way the real backend does, and exposes control
//! hooks on [`Store`] so tests can expire tokens, force 401s, delete or corrupt snapshots and
//! make the refresh endpoint fail.
//!
//! Tests start one per test on an ephemeral port:
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! let edc = mock_edc::MockEdc::spawn().await?;
//! println!("backend at {}", edc.base_url());
//! # Ok(())
//! # }
//! ```

mod handlers;
pub mod store;

pub use store::{EntityCounts, Store};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
}

/// Builds the full router. Every backend route lives under `/api`.
pub fn router(store: Arc<Store>) -> Router {
    let state = AppState { store };

    let api = Router::new()
        .route("/auth/login", post(handlers::login))
        .route("/organizations/register", post(handlers::register))
        .route("/users", get(handlers::list_users).post(handlers::create_user))
        .route("/forms", get(handlers::list_forms).post(handlers::create_form))
        .route("/forms/:id", get(handlers::get_form).put(handlers::update_form))
        .route("/forms/:id/fork", post(handlers::fork_form))
        .route(
            "/forms/workflow-config/:id",
            get(handlers::get_workflow_config).put(handlers::put_workflow_config),
        )
        .route("/validation-rules", post(handlers::create_rule))
        .route("/validation-rules/form/:id", get(handlers::form_rules))
        .route("/studies", get(handlers::list_studies).post(handlers::create_study))
        .route("/studies/:id/sites", post(handlers::create_site))
        .route(
            "/studies/:id/events",
            get(handlers::list_definitions).post(handlers::create_definition),
        )
        .route("/subjects", get(handlers::list_subjects).post(handlers::create_subject))
        .route("/events/schedule", post(handlers::schedule_event))
        .route("/events/unscheduled", post(handlers::unscheduled_event))
        .route("/events/subject/:id", get(handlers::subject_events))
        .route("/events/instance/:id/visit-forms", get(handlers::visit_forms))
        .route("/events/instance/:id/form-snapshots", get(handlers::form_snapshots))
        .route(
            "/events/patient-form/:id/data",
            get(handlers::snapshot_data).put(handlers::save_snapshot_data),
        )
        .route("/events/verify/subject/:id", get(handlers::verify_subject))
        .route(
            "/events/verify/subject/:id/refresh-snapshots",
            post(handlers::refresh_snapshots),
        )
        .route("/events/verify/subject/:id/repair", post(handlers::repair_snapshots))
        .route("/queries", get(handlers::list_queries).post(handlers::create_query));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(state.clone(), handlers::gate))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// A running mock backend. The server task is aborted on drop.
pub struct MockEdc {
    addr: SocketAddr,
    store: Arc<Store>,
    task: JoinHandle<()>,
}

impl MockEdc {
    /// Binds `127.0.0.1:0` and serves the mock in a background task.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn spawn() -> anyhow::Result<Self> {
        Self::spawn_on("127.0.0.1:0").await
    }

    pub async fn spawn_on(addr: &str) -> anyhow::Result<Self> {
        let store = Arc::new(Store::default());
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let app = router(store.clone());

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("mock EDC server stopped: {}", e);
            }
        });
        tracing::debug!("mock EDC listening on {}", addr);

        Ok(Self { addr, store, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL including the `/api` prefix, ready for the harness configuration.
    pub fn base_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

impl Drop for MockEdc {
    fn drop(&mut self) {
        self.task.abort();
    }
}
