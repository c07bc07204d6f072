//! Result and diagnostics sink.
//!
//! Console signalling uses three levels: pass (`info`), warn (`warn`) and fail (`error`).
//! Every failure is additionally appended to a line-delimited JSON log so it survives the loss
//! of console scrollback. Each line is a self-contained object:
//!
//! ```text
//! {"timestamp":"2026-02-17T09:30:00Z","script":"edc-harness","step":"save-form-data",
//!  "endpoint":"PUT /events/patient-form/12/data","status":400,"error":"...",
//!  "requestBody":{...},"responseBody":{...}}
//! ```

use crate::constants::DIAGNOSTICS_SCRIPT;
use crate::{HarnessError, HarnessResult};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A single failure observed by the harness.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Failure {
    /// `METHOD /path` for API failures, or the verification phase for integrity failures.
    pub endpoint: String,
    /// HTTP status, `None` when the failure did not come from a response.
    pub status: Option<u16>,
    pub error: String,
    pub request_body: Option<serde_json::Value>,
    pub response_body: Option<serde_json::Value>,
}

impl Failure {
    pub fn new(endpoint: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            error: error.into(),
            ..Default::default()
        }
    }
}

/// One line of the diagnostics log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsEntry {
    pub timestamp: String,
    pub script: String,
    pub step: String,
    pub endpoint: String,
    pub status: Option<u16>,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<serde_json::Value>,
}

/// Counters for the signals recorded so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkSummary {
    pub passes: usize,
    pub warnings: usize,
    pub failures: usize,
}

/// Contract between the harness core and whatever reports its outcomes.
pub trait ResultSink: Send + Sync {
    fn record_failure(&self, failure: Failure);
    fn record_pass(&self, message: &str);
    fn record_warning(&self, message: &str);
}

/// Sink that signals on the console through `tracing` and appends failures to a JSONL file.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    current_step: Mutex<String>,
    passes: AtomicUsize,
    warnings: AtomicUsize,
    failures: AtomicUsize,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current_step: Mutex::new(String::from("setup")),
            passes: AtomicUsize::new(0),
            warnings: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sets the step name stamped onto subsequent entries.
    pub fn set_step(&self, step: &str) {
        if let Ok(mut current) = self.current_step.lock() {
            current.clear();
            current.push_str(step);
        }
    }

    pub fn current_step(&self) -> String {
        self.current_step
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> SinkSummary {
        SinkSummary {
            passes: self.passes.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Appends one entry to the log, creating the file and its parent directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the line cannot be written.
    pub fn append(&self, entry: &DiagnosticsEntry) -> HarnessResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(HarnessError::DiagnosticsDirCreation)?;
        }

        let line = serde_json::to_string(entry).map_err(HarnessError::DiagnosticsSerialization)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(HarnessError::DiagnosticsWrite)?;
        writeln!(file, "{line}").map_err(HarnessError::DiagnosticsWrite)
    }

    /// Reads every entry back from the log. Unparseable lines are skipped.
    pub fn read_entries(path: &Path) -> Vec<DiagnosticsEntry> {
        fs::read_to_string(path)
            .map(|contents| {
                contents
                    .lines()
                    .filter_map(|line| serde_json::from_str(line).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl ResultSink for JsonlSink {
    fn record_failure(&self, failure: Failure) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let step = self.current_step();

        match failure.status {
            Some(status) => tracing::error!(
                "FAIL [{}] {} -> {}: {}",
                step,
                failure.endpoint,
                status,
                failure.error
            ),
            None => tracing::error!("FAIL [{}] {}: {}", step, failure.endpoint, failure.error),
        }

        let entry = DiagnosticsEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            script: DIAGNOSTICS_SCRIPT.to_string(),
            step,
            endpoint: failure.endpoint,
            status: failure.status,
            error: failure.error,
            request_body: failure.request_body,
            response_body: failure.response_body,
        };

        if let Err(e) = self.append(&entry) {
            tracing::error!("could not write diagnostics log {}: {}", self.path.display(), e);
        }
    }

    fn record_pass(&self, message: &str) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        tracing::info!("PASS [{}] {}", self.current_step(), message);
    }

    fn record_warning(&self, message: &str) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("WARN [{}] {}", self.current_step(), message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_failure_creates_directory_and_appends_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("logs").join("failures.jsonl");
        let sink = JsonlSink::new(&path);
        sink.set_step("save-form-data");

        sink.record_failure(Failure {
            endpoint: "PUT /events/patient-form/4/data".into(),
            status: Some(400),
            error: "assessment_date is required".into(),
            request_body: Some(json!({"data": {"pain_level": "4"}})),
            response_body: Some(json!({"message": "assessment_date is required"})),
        });
        sink.record_failure(Failure::new("content", "field type 'ST' is a storage code"));

        let entries = JsonlSink::read_entries(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].step, "save-form-data");
        assert_eq!(entries[0].status, Some(400));
        assert_eq!(entries[0].script, DIAGNOSTICS_SCRIPT);
        assert!(entries[1].request_body.is_none());
        assert!(chrono::DateTime::parse_from_rfc3339(&entries[0].timestamp).is_ok());

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("requestBody\":null"));
    }

    #[test]
    fn test_summary_counts_signals() {
        let temp = TempDir::new().unwrap();
        let sink = JsonlSink::new(temp.path().join("f.jsonl"));
        sink.record_pass("ok");
        sink.record_pass("ok again");
        sink.record_warning("hmm");

        assert_eq!(
            sink.summary(),
            SinkSummary {
                passes: 2,
                warnings: 1,
                failures: 0
            }
        );
        assert!(!sink.path().exists());
    }
}
