//! Harness runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into the harness
//! context. Nothing below the binaries reads process environment variables; they hand a
//! lookup function to [`HarnessConfig::from_lookup`] instead, which keeps tests free of
//! process-wide state.

use crate::constants::{
    DEFAULT_ADMIN_EMAIL, DEFAULT_ADMIN_PASSWORD, DEFAULT_ADMIN_USERNAME, DEFAULT_API_URL,
    DEFAULT_DIAGNOSTICS_LOG, DEFAULT_ORG_NAME, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_STATE_FILE,
};
use crate::types::NonEmptyText;
use crate::{HarnessError, HarnessResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Identity used to register the organization and to log in again when a token expires.
#[derive(Clone, Debug)]
pub struct AdminIdentity {
    pub organization_name: NonEmptyText,
    pub username: NonEmptyText,
    pub email: NonEmptyText,
    pub password: NonEmptyText,
}

/// What the harness expects to happen to entered data when snapshots are refreshed.
///
/// Whether the backend's destructive refresh is intended is undecided, so the harness
/// asserts whichever behaviour is configured and merely reports under `Observe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RefreshDataPolicy {
    /// Loss of entered data across refresh is a failure.
    Preserved,
    /// Survival of entered data across refresh is a failure.
    Discarded,
    /// Either outcome is reported as a warning.
    #[default]
    Observe,
}

impl FromStr for RefreshDataPolicy {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preserved" => Ok(Self::Preserved),
            "discarded" => Ok(Self::Discarded),
            "observe" | "" => Ok(Self::Observe),
            other => Err(HarnessError::InvalidConfig(format!(
                "unknown refresh data policy '{other}' (expected preserved, discarded or observe)"
            ))),
        }
    }
}

/// Harness configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    base_url: String,
    state_file: PathBuf,
    diagnostics_log: PathBuf,
    request_timeout: Duration,
    admin: AdminIdentity,
    refresh_data_policy: RefreshDataPolicy,
    stop_on_failure: bool,
}

impl HarnessConfig {
    /// Create a new `HarnessConfig` with default identity and policies.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::InvalidConfig` if `base_url` is not an http(s) URL.
    pub fn new(
        base_url: impl Into<String>,
        state_file: PathBuf,
        diagnostics_log: PathBuf,
    ) -> HarnessResult<Self> {
        let base_url = normalise_base_url(base_url.into())?;

        Ok(Self {
            base_url,
            state_file,
            diagnostics_log,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            admin: default_admin()?,
            refresh_data_policy: RefreshDataPolicy::default(),
            stop_on_failure: false,
        })
    }

    /// Resolve the configuration from a key lookup, typically `std::env::var(..).ok()`.
    ///
    /// Unset or blank values fall back to the defaults in [`crate::constants`].
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::InvalidConfig` if any supplied value fails to parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> HarnessResult<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut cfg = Self::new(
            get("EDC_API_URL").unwrap_or_else(|| DEFAULT_API_URL.into()),
            PathBuf::from(get("EDC_STATE_FILE").unwrap_or_else(|| DEFAULT_STATE_FILE.into())),
            PathBuf::from(
                get("EDC_DIAGNOSTICS_LOG").unwrap_or_else(|| DEFAULT_DIAGNOSTICS_LOG.into()),
            ),
        )?;

        if let Some(secs) = get("EDC_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                HarnessError::InvalidConfig(format!("EDC_REQUEST_TIMEOUT_SECS is not a number: {secs}"))
            })?;
            cfg = cfg.with_request_timeout(Duration::from_secs(secs))?;
        }

        cfg.admin = AdminIdentity {
            organization_name: text_or(get("EDC_ORG_NAME"), DEFAULT_ORG_NAME)?,
            username: text_or(get("EDC_ADMIN_USERNAME"), DEFAULT_ADMIN_USERNAME)?,
            email: text_or(get("EDC_ADMIN_EMAIL"), DEFAULT_ADMIN_EMAIL)?,
            password: text_or(get("EDC_ADMIN_PASSWORD"), DEFAULT_ADMIN_PASSWORD)?,
        };

        if let Some(policy) = get("EDC_REFRESH_DATA_POLICY") {
            cfg.refresh_data_policy = policy.parse()?;
        }

        if let Some(flag) = get("EDC_STOP_ON_FAILURE") {
            cfg.stop_on_failure = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        Ok(cfg)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> HarnessResult<Self> {
        if timeout.is_zero() {
            return Err(HarnessError::InvalidConfig(
                "request timeout must be greater than zero".into(),
            ));
        }
        self.request_timeout = timeout;
        Ok(self)
    }

    pub fn with_admin(mut self, admin: AdminIdentity) -> Self {
        self.admin = admin;
        self
    }

    pub fn with_refresh_data_policy(mut self, policy: RefreshDataPolicy) -> Self {
        self.refresh_data_policy = policy;
        self
    }

    pub fn with_stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn diagnostics_log(&self) -> &Path {
        &self.diagnostics_log
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn admin(&self) -> &AdminIdentity {
        &self.admin
    }

    pub fn refresh_data_policy(&self) -> RefreshDataPolicy {
        self.refresh_data_policy
    }

    pub fn stop_on_failure(&self) -> bool {
        self.stop_on_failure
    }
}

fn normalise_base_url(url: String) -> HarnessResult<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(HarnessError::InvalidConfig("base URL cannot be empty".into()));
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(HarnessError::InvalidConfig(format!(
            "base URL must start with http:// or https://: {trimmed}"
        )));
    }
    Ok(trimmed.to_string())
}

fn text_or(value: Option<String>, default: &str) -> HarnessResult<NonEmptyText> {
    NonEmptyText::new(value.as_deref().unwrap_or(default))
        .map_err(|e| HarnessError::InvalidConfig(e.to_string()))
}

fn default_admin() -> HarnessResult<AdminIdentity> {
    Ok(AdminIdentity {
        organization_name: text_or(None, DEFAULT_ORG_NAME)?,
        username: text_or(None, DEFAULT_ADMIN_USERNAME)?,
        email: text_or(None, DEFAULT_ADMIN_EMAIL)?,
        password: text_or(None, DEFAULT_ADMIN_PASSWORD)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_apply_when_unset() {
        let cfg = HarnessConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.base_url(), DEFAULT_API_URL);
        assert_eq!(cfg.state_file(), Path::new(DEFAULT_STATE_FILE));
        assert_eq!(cfg.admin().username.as_str(), DEFAULT_ADMIN_USERNAME);
        assert_eq!(cfg.refresh_data_policy(), RefreshDataPolicy::Observe);
        assert!(!cfg.stop_on_failure());
    }

    #[test]
    fn test_overrides_are_parsed() {
        let cfg = HarnessConfig::from_lookup(lookup(&[
            ("EDC_API_URL", "https://edc.example.org/api/"),
            ("EDC_REQUEST_TIMEOUT_SECS", "5"),
            ("EDC_REFRESH_DATA_POLICY", "Discarded"),
            ("EDC_STOP_ON_FAILURE", "true"),
            ("EDC_ADMIN_USERNAME", "  site.admin "),
        ]))
        .unwrap();

        assert_eq!(cfg.base_url(), "https://edc.example.org/api");
        assert_eq!(cfg.request_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.refresh_data_policy(), RefreshDataPolicy::Discarded);
        assert!(cfg.stop_on_failure());
        assert_eq!(cfg.admin().username.as_str(), "site.admin");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(HarnessConfig::from_lookup(lookup(&[("EDC_API_URL", "ftp://x")])).is_err());
        assert!(
            HarnessConfig::from_lookup(lookup(&[("EDC_REQUEST_TIMEOUT_SECS", "soon")])).is_err()
        );
        assert!(
            HarnessConfig::from_lookup(lookup(&[("EDC_REQUEST_TIMEOUT_SECS", "0")])).is_err()
        );
        assert!(
            HarnessConfig::from_lookup(lookup(&[("EDC_REFRESH_DATA_POLICY", "maybe")])).is_err()
        );
    }
}
