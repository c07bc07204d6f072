//! Persistent test state.
//!
//! Identifiers accumulated by the steps (organization, forms, study, subject, scheduled events,
//! snapshots, ...) are kept in a single JSON document so that a later process invocation can
//! pick up where the previous one stopped.
//!
//! ## Guarantees
//!
//! - A missing or unparseable file loads as an empty state. Tests must stay restartable, so
//!   corruption is logged and swallowed rather than escalated.
//! - Every mutation is written immediately with a full pretty-printed overwrite, via a sibling
//!   temporary file and a rename so a crash never leaves a half-written document.
//! - Merges are shallow and additive: a patch only replaces the fields it sets. Keys in the file
//!   that this version of the harness does not know about are carried through untouched.

use crate::types::EntityId;
use crate::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Identifiers and credentials accumulated across harness runs.
///
/// The same type doubles as a merge patch: `None` fields in a patch leave the current value
/// alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_user_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_ids: Option<Vec<EntityId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_ids: Option<Vec<EntityId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_form_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_form_ids: Option<Vec<EntityId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub study_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_ids: Option<Vec<EntityId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_definition_ids: Option<Vec<EntityId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_event_ids: Option<Vec<EntityId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unscheduled_event_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ids: Option<Vec<EntityId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_ids: Option<Vec<EntityId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_ids: Option<Vec<EntityId>>,

    /// Keys written by other tooling; preserved on every save.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TestState {
    /// Shallow-merges `patch` over `self`. Fields the patch leaves unset are kept.
    pub fn merge(&mut self, patch: TestState) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.organization_id, patch.organization_id);
        take(&mut self.admin_user_id, patch.admin_user_id);
        take(&mut self.admin_username, patch.admin_username);
        take(&mut self.admin_email, patch.admin_email);
        take(&mut self.admin_password, patch.admin_password);
        take(&mut self.access_token, patch.access_token);
        take(&mut self.refresh_token, patch.refresh_token);
        take(&mut self.member_ids, patch.member_ids);
        take(&mut self.form_ids, patch.form_ids);
        take(&mut self.forked_form_id, patch.forked_form_id);
        take(&mut self.workflow_form_ids, patch.workflow_form_ids);
        take(&mut self.study_id, patch.study_id);
        take(&mut self.site_ids, patch.site_ids);
        take(&mut self.event_definition_ids, patch.event_definition_ids);
        take(&mut self.subject_id, patch.subject_id);
        take(&mut self.scheduled_event_ids, patch.scheduled_event_ids);
        take(&mut self.unscheduled_event_id, patch.unscheduled_event_id);
        take(&mut self.snapshot_ids, patch.snapshot_ids);
        take(&mut self.rule_ids, patch.rule_ids);
        take(&mut self.query_ids, patch.query_ids);
        self.extra.extend(patch.extra);
    }

    /// Returns `true` when no field is set.
    pub fn is_empty(&self) -> bool {
        self == &TestState::default()
    }
}

/// File-backed store for [`TestState`].
#[derive(Clone, Debug)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted state.
    ///
    /// Returns an empty state when the file does not exist, cannot be read, or is not valid
    /// JSON for [`TestState`].
    pub fn load(&self) -> TestState {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return TestState::default(),
            Err(e) => {
                tracing::warn!(
                    "state file {} unreadable, starting empty: {}",
                    self.path.display(),
                    e
                );
                return TestState::default();
            }
        };

        if contents.trim().is_empty() {
            return TestState::default();
        }

        match serde_json::from_str::<TestState>(&contents) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    "state file {} is corrupt, starting empty: {}",
                    self.path.display(),
                    e
                );
                TestState::default()
            }
        }
    }

    /// Overwrites the state file with `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the parent directory cannot be created,
    /// - the temporary file cannot be written or renamed over the state file.
    pub fn save(&self, state: &TestState) -> HarnessResult<()> {
        let json = serde_json::to_string_pretty(state).map_err(HarnessError::StateSerialization)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| self.write_error(source))?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, format!("{json}\n")).map_err(|source| self.write_error(source))?;
        fs::rename(&tmp, &self.path).map_err(|source| self.write_error(source))
    }

    /// Loads the current state, merges `patch` over it, saves and returns the result.
    ///
    /// # Errors
    ///
    /// Propagates any failure from [`StateStore::save`].
    pub fn update(&self, patch: TestState) -> HarnessResult<TestState> {
        let mut state = self.load();
        state.merge(patch);
        self.save(&state)?;
        Ok(state)
    }

    /// Removes the state file. A file that is already absent is not an error.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::StateWrite` if the file exists but cannot be removed.
    pub fn reset(&self) -> HarnessResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.write_error(source)),
        }
    }

    fn write_error(&self, source: std::io::Error) -> HarnessError {
        HarnessError::StateWrite {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path().join("state.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_load_corrupt_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();

        let store = StateStore::new(&path);
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_update_merges_without_clearing() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path().join("nested").join("state.json"));

        store
            .update(TestState {
                organization_id: Some(EntityId::Num(7)),
                form_ids: Some(vec![1.into(), 2.into()]),
                ..Default::default()
            })
            .unwrap();

        let merged = store
            .update(TestState {
                study_id: Some(EntityId::Num(3)),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(merged.organization_id, Some(EntityId::Num(7)));
        assert_eq!(merged.form_ids, Some(vec![1.into(), 2.into()]));
        assert_eq!(merged.study_id, Some(EntityId::Num(3)));
        assert_eq!(store.load(), merged);
    }

    #[test]
    fn test_unknown_keys_survive_save() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        fs::write(&path, r#"{"studyId": 5, "consoleSessionId": "abc"}"#).unwrap();

        let store = StateStore::new(&path);
        store
            .update(TestState {
                subject_id: Some(EntityId::Num(9)),
                ..Default::default()
            })
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["consoleSessionId"], json!("abc"));
        assert_eq!(raw["studyId"], json!(5));
        assert_eq!(raw["subjectId"], json!(9));
    }

    #[test]
    fn test_reset_removes_file() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path().join("state.json"));
        store.save(&TestState::default()).unwrap();
        assert!(store.path().exists());

        store.reset().unwrap();
        assert!(!store.path().exists());
        store.reset().unwrap();
    }
}
