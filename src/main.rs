use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edc_core::{Harness, HarnessConfig, Orchestrator};

/// Runs the full harness suite against the configured EDC backend.
///
/// Configuration comes from the environment (optionally a `.env` file). Every step runs in
/// declared order; the process exits `0` only if all of them passed.
///
/// # Environment Variables
/// - `EDC_API_URL`: backend base URL (default: "http://localhost:3001/api")
/// - `EDC_STATE_FILE`: persisted state (default: "test-state.json")
/// - `EDC_DIAGNOSTICS_LOG`: failure log (default: "logs/failures.jsonl")
/// - `EDC_REQUEST_TIMEOUT_SECS`: per-call timeout (default: 30)
/// - `EDC_ORG_NAME`, `EDC_ADMIN_USERNAME`, `EDC_ADMIN_EMAIL`, `EDC_ADMIN_PASSWORD`
/// - `EDC_REFRESH_DATA_POLICY`: `observe`, `preserved` or `discarded`
/// - `EDC_STOP_ON_FAILURE`: stop at the first failed step
///
/// # Errors
/// Returns an error if logging cannot be initialised or the configuration is invalid.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("edc_run=info".parse()?)
                .add_directive("edc_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Arc::new(HarnessConfig::from_lookup(|key| std::env::var(key).ok())?);
    tracing::info!("-- Running EDC harness against {}", cfg.base_url());

    let harness = Harness::new(cfg)?;
    let report = Orchestrator::new(&harness).run_all().await;

    for step in &report.steps {
        println!(
            "{:<28} {} ({} ms)",
            step.step.name(),
            step.status,
            step.elapsed.as_millis()
        );
    }
    let summary = harness.sink().summary();
    println!(
        "{} passed, {} failed, {} warnings; failures logged to {}",
        report.passed(),
        report.failed(),
        summary.warnings,
        harness.config().diagnostics_log().display()
    );

    std::process::exit(report.exit_code());
}
