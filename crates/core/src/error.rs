#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(reqwest::Error),
    #[error("failed to write state file (path: {path}): {source}", path = path.display())]
    StateWrite {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize state: {0}")]
    StateSerialization(serde_json::Error),
    #[error("failed to create diagnostics directory: {0}")]
    DiagnosticsDirCreation(std::io::Error),
    #[error("failed to write diagnostics log: {0}")]
    DiagnosticsWrite(std::io::Error),
    #[error("failed to serialize diagnostics entry: {0}")]
    DiagnosticsSerialization(serde_json::Error),
    #[error("unknown step: {0}")]
    UnknownStep(String),
}

pub type HarnessResult<T> = std::result::Result<T, HarnessError>;
