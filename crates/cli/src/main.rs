use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use edc_core::{EntityId, Harness, HarnessConfig, Orchestrator, StepId, SuiteReport};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "edc-harness")]
#[command(about = "EDC snapshot consistency harness")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List every step in run order
    Steps,
    /// Run the whole suite
    Run {
        /// Stop at the first failed step
        #[arg(long)]
        stop_on_failure: bool,
    },
    /// Run a single step by name
    Step {
        /// Step name, e.g. "verify-snapshots"
        name: String,
    },
    /// Verify the snapshot graph of a subject
    Verify {
        /// Subject id (defaults to the one in the state file)
        #[arg(long)]
        subject: Option<String>,
        /// Refresh and repair before re-verifying
        #[arg(long)]
        repair: bool,
    },
    /// Print the persisted state
    State,
    /// Delete the persisted state
    Reset,
}

fn harness(stop_on_failure: bool) -> anyhow::Result<Harness> {
    let cfg = HarnessConfig::from_lookup(|key| std::env::var(key).ok())?;
    let cfg = if stop_on_failure {
        cfg.with_stop_on_failure(true)
    } else {
        cfg
    };
    Ok(Harness::new(Arc::new(cfg))?)
}

fn print_report(report: &SuiteReport) {
    for step in &report.steps {
        println!("{:<28} {}", step.step.name(), step.status);
    }
    println!("{} passed, {} failed", report.passed(), report.failed());
}

/// Subject ids are numeric for most backends; anything else is passed through as text.
fn parse_subject(raw: &str) -> EntityId {
    raw.trim()
        .parse::<i64>()
        .map(EntityId::Num)
        .unwrap_or_else(|_| EntityId::from(raw.trim()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("edc_cli=info".parse()?)
                .add_directive("edc_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Steps) => {
            for step in StepId::ALL {
                println!("{:<28} {}", step.name(), step.description());
            }
        }
        Some(Commands::Run { stop_on_failure }) => {
            let harness = harness(stop_on_failure)?;
            let report = Orchestrator::new(&harness).run_all().await;
            print_report(&report);
            std::process::exit(report.exit_code());
        }
        Some(Commands::Step { name }) => {
            let step: StepId = name.parse()?;
            let harness = harness(false)?;
            let report = Orchestrator::new(&harness).run_one(step).await;
            println!("{:<28} {}", report.step.name(), report.status);
            let passed = report.status == edc_core::orchestrator::StepStatus::Passed;
            std::process::exit(if passed { 0 } else { 1 });
        }
        Some(Commands::Verify { subject, repair }) => {
            let harness = harness(false)?;
            let subject_id = match (subject, harness.state().subject_id) {
                (Some(raw), _) => parse_subject(&raw),
                (None, Some(id)) => id,
                (None, None) => {
                    bail!("no subject in the state file; pass --subject or run 'enroll-subject'")
                }
            };

            let verifier = harness.verifier();
            let run = if repair {
                verifier.refresh_and_repair(&subject_id).await
            } else {
                verifier.verify(&subject_id).await
            };

            if let Some(report) = &run.final_report {
                println!("{}", report.summary());
                for event in report.events.iter().filter(|e| !e.matches()) {
                    println!(
                        "  event {}: missing forms {:?}, extra snapshots {:?}",
                        event.patient_event_id, event.missing_form_ids, event.extra_snapshot_ids
                    );
                }
            }
            println!("subject {}: {}", subject_id, run.outcome);
            std::process::exit(if run.is_valid() { 0 } else { 1 });
        }
        Some(Commands::State) => {
            let harness = harness(false)?;
            let state = harness.state();
            let json = serde_json::to_string_pretty(&state).context("serializing state")?;
            println!("{json}");
        }
        Some(Commands::Reset) => {
            let harness = harness(false)?;
            harness.store().reset()?;
            println!("State file {} removed.", harness.store().path().display());
        }
        None => {
            println!("Use --help to see available commands.");
        }
    }

    Ok(())
}
