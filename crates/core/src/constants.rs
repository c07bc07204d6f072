//! Constants used throughout the harness core crate.
//!
//! Default paths, endpoint fragments and validation vocabularies live here so the client,
//! steps and verifier agree on them.

/// Default base URL of the EDC backend API.
pub const DEFAULT_API_URL: &str = "http://localhost:3001/api";

/// Default location of the persisted test state.
pub const DEFAULT_STATE_FILE: &str = "test-state.json";

/// Default location of the line-delimited failure log.
pub const DEFAULT_DIAGNOSTICS_LOG: &str = "logs/failures.jsonl";

/// Default per-request timeout, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_ORG_NAME: &str = "Harness Research Org";
pub const DEFAULT_ADMIN_USERNAME: &str = "harness.admin";
pub const DEFAULT_ADMIN_EMAIL: &str = "harness.admin@example.org";
pub const DEFAULT_ADMIN_PASSWORD: &str = "Harness#2026";

/// Script name written into every diagnostics entry.
pub const DIAGNOSTICS_SCRIPT: &str = "edc-harness";

/// Login endpoint used both by the login step and by token refresh.
pub const LOGIN_PATH: &str = "/auth/login";

/// Field types a materialized snapshot may carry.
pub const CANONICAL_FIELD_TYPES: &[&str] = &[
    "text",
    "textarea",
    "number",
    "decimal",
    "date",
    "datetime",
    "time",
    "select",
    "radio",
    "checkbox",
    "yesno",
    "email",
    "phone",
    "file",
    "signature",
    "table",
    "calculation",
    "section",
    "label",
];

/// Storage-layer item type codes. Seeing one of these in a snapshot means the
/// template-to-snapshot materializer did not translate the field type.
pub const RAW_STORAGE_TYPE_CODES: &[&str] = &[
    "ST", "INT", "REAL", "DATE", "PDATE", "FILE", "BL", "BN", "TEL", "NUM",
];

/// Delimiter the backend uses to pack extended field metadata into a single string.
pub const RAW_METADATA_DELIMITER: &str = "||";

/// A field name longer than this that also contains a space is treated as a display label.
pub const MAX_LABEL_LIKE_NAME_LEN: usize = 20;
