//! Ordered execution of steps.
//!
//! The orchestrator runs steps one at a time on the current task, never in parallel. Each
//! step reads and writes the shared state file, so ordering is what makes later steps see the
//! identifiers earlier ones produced.

use crate::diagnostics::{Failure, ResultSink};
use crate::steps::{StepError, StepId};
use crate::Harness;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Passed,
    Failed(String),
    /// Not attempted because an earlier step failed under stop-on-failure.
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Passed => write!(f, "PASS"),
            StepStatus::Failed(reason) => write!(f, "FAIL ({reason})"),
            StepStatus::Skipped => write!(f, "SKIP"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: StepId,
    pub status: StepStatus,
    pub elapsed: Duration,
}

/// Outcome of a run of one or more steps.
#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    pub steps: Vec<StepReport>,
}

impl SuiteReport {
    pub fn all_passed(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.status == StepStatus::Passed)
    }

    pub fn passed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Passed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed(_)))
            .count()
    }

    pub fn status_of(&self, step: StepId) -> Option<&StepStatus> {
        self.steps.iter().find(|s| s.step == step).map(|s| &s.status)
    }

    /// Process exit code: `0` when every step passed, `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.all_passed() {
            0
        } else {
            1
        }
    }
}

pub struct Orchestrator<'a> {
    harness: &'a Harness,
}

impl<'a> Orchestrator<'a> {
    pub fn new(harness: &'a Harness) -> Self {
        Self { harness }
    }

    /// Runs a single step and reports its outcome.
    ///
    /// A missing prerequisite is not a backend defect: it is logged at info level naming the
    /// step that produces the field, and no diagnostics entry is written for it.
    pub async fn run_one(&self, step: StepId) -> StepReport {
        let sink = self.harness.sink();
        sink.set_step(step.name());
        tracing::info!("== {} : {}", step, step.description());

        let started = Instant::now();
        let result = step.run(self.harness).await;
        let elapsed = started.elapsed();

        let status = match result {
            Ok(()) => {
                sink.record_pass(&format!("{step} ({} ms)", elapsed.as_millis()));
                StepStatus::Passed
            }
            Err(StepError::MissingPrerequisite { field, producer }) => {
                tracing::info!(
                    "{} needs '{}' which is not in the state file; run '{}' first",
                    step,
                    field,
                    producer
                );
                StepStatus::Failed(format!("missing prerequisite '{field}'"))
            }
            Err(e) => {
                sink.record_failure(Failure::new(format!("step {step}"), e.to_string()));
                StepStatus::Failed(e.to_string())
            }
        };

        StepReport {
            step,
            status,
            elapsed,
        }
    }

    /// Runs every step in declared order.
    pub async fn run_all(&self) -> SuiteReport {
        self.run_steps(&StepId::ALL).await
    }

    /// Runs `steps` in the given order. Under stop-on-failure the steps after the first
    /// failure are reported as skipped.
    pub async fn run_steps(&self, steps: &[StepId]) -> SuiteReport {
        let stop_on_failure = self.harness.config().stop_on_failure();
        let mut report = SuiteReport::default();
        let mut stopped = false;

        for &step in steps {
            if stopped {
                report.steps.push(StepReport {
                    step,
                    status: StepStatus::Skipped,
                    elapsed: Duration::ZERO,
                });
                continue;
            }

            let step_report = self.run_one(step).await;
            if stop_on_failure && step_report.status != StepStatus::Passed {
                tracing::warn!("stopping after failed step {}", step);
                stopped = true;
            }
            report.steps.push(step_report);
        }

        let summary = self.harness.sink().summary();
        tracing::info!(
            "{} of {} steps passed ({} warnings, {} failures recorded)",
            report.passed(),
            report.steps.len(),
            summary.warnings,
            summary.failures
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(statuses: &[StepStatus]) -> SuiteReport {
        SuiteReport {
            steps: statuses
                .iter()
                .zip(StepId::ALL)
                .map(|(status, step)| StepReport {
                    step,
                    status: status.clone(),
                    elapsed: Duration::ZERO,
                })
                .collect(),
        }
    }

    #[test]
    fn test_exit_code_reflects_every_step() {
        assert_eq!(report(&[StepStatus::Passed, StepStatus::Passed]).exit_code(), 0);
        assert_eq!(
            report(&[StepStatus::Passed, StepStatus::Failed("x".into())]).exit_code(),
            1
        );
        assert_eq!(report(&[StepStatus::Passed, StepStatus::Skipped]).exit_code(), 1);
        assert_eq!(SuiteReport::default().exit_code(), 1);
    }

    #[test]
    fn test_status_lookup() {
        let suite = report(&[StepStatus::Passed, StepStatus::Failed("boom".into())]);
        assert_eq!(suite.status_of(StepId::RegisterOrganization), Some(&StepStatus::Passed));
        assert_eq!(suite.failed(), 1);
        assert_eq!(suite.status_of(StepId::RaiseQuery), None);
    }
}
