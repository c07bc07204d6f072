//! In-memory EDC data model.
//!
//! Templates (forms assigned to event definitions) and their per-visit snapshots live here.
//! Scheduling a visit materializes one snapshot per assignment; refresh deletes and recreates
//! a subject's snapshots; repair only fills gaps. The control methods at the bottom let tests
//! break the backend on purpose.

use axum::http::StatusCode;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// Error returned to the HTTP layer.
#[derive(Debug, Clone, PartialEq)]
pub struct MockError {
    pub status: StatusCode,
    pub message: String,
}

impl MockError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(what: &str, id: i64) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{what} {id} not found"))
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

pub type MockResult<T> = Result<T, MockError>;

fn text(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required_text(body: &Value, key: &str) -> MockResult<String> {
    text(body, key).ok_or_else(|| MockError::bad_request(format!("'{key}' is required")))
}

fn id_of(body: &Value, key: &str) -> MockResult<i64> {
    match body.get(key) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| MockError::bad_request(format!("'{key}' must be an id")))
}

fn flag(body: &Value, key: &str) -> bool {
    body.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Form data is stored the way a relational backend would: as text.
fn as_stored_text(value: &Value) -> Value {
    match value {
        Value::String(_) | Value::Null => value.clone(),
        Value::Number(n) => Value::String(n.to_string()),
        Value::Bool(b) => Value::String(b.to_string()),
        other => Value::String(other.to_string()),
    }
}

#[derive(Debug, Clone)]
struct User {
    id: i64,
    organization_id: i64,
    username: String,
    email: String,
    password: String,
    role: String,
}

impl User {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "username": self.username,
            "email": self.email,
            "role": self.role,
            "organizationId": self.organization_id,
        })
    }
}

#[derive(Debug, Clone)]
struct Form {
    id: i64,
    name: String,
    description: String,
    category: String,
    fields: Value,
    workflow: Value,
}

impl Form {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "category": self.category,
            "fields": self.fields,
        })
    }
}

#[derive(Debug, Clone)]
struct Site {
    id: i64,
    name: String,
    site_number: String,
}

#[derive(Debug, Clone)]
struct Study {
    id: i64,
    name: String,
    protocol_number: String,
    sites: Vec<Site>,
}

impl Study {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "protocol_number": self.protocol_number,
            "sites": self.sites.iter().map(|s| json!({
                "id": s.id,
                "name": s.name,
                "siteNumber": s.site_number,
            })).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Clone)]
struct Assignment {
    form_id: i64,
    order: i64,
    required: bool,
    double_entry: bool,
    electronic_signature: bool,
    hidden: bool,
}

#[derive(Debug, Clone)]
struct EventDefinition {
    id: i64,
    study_id: i64,
    name: String,
    order: i64,
    assignments: Vec<Assignment>,
}

#[derive(Debug, Clone)]
struct Subject {
    id: i64,
    study_id: i64,
    site_id: i64,
    label: String,
    enrollment_date: String,
}

#[derive(Debug, Clone)]
struct PatientEvent {
    id: i64,
    subject_id: i64,
    definition_id: i64,
    start_date: String,
    unscheduled: bool,
}

#[derive(Debug, Clone)]
struct Snapshot {
    id: i64,
    event_id: i64,
    form_id: i64,
    form_name: String,
    fields: Value,
    data: Map<String, Value>,
    locked: bool,
}

impl Snapshot {
    /// Snake-case keys and a structure packed into a string, as the real backend emits.
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "patient_event_id": self.event_id,
            "form_id": self.form_id,
            "form_name": self.form_name,
            "form_structure": json!({ "fields": self.fields }).to_string(),
            "form_data": self.data,
            "is_locked": self.locked,
        })
    }
}

#[derive(Debug, Default)]
struct Controls {
    forced_unauthorized: HashSet<String>,
    fail_refresh: bool,
    fail_repair: bool,
    refresh_leaves_duplicate: bool,
    preserve_data_on_refresh: bool,
    request_counts: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    tokens: HashSet<String>,
    organizations: Vec<(i64, String)>,
    users: Vec<User>,
    forms: Vec<Form>,
    rules: Vec<Value>,
    studies: Vec<Study>,
    definitions: Vec<EventDefinition>,
    subjects: Vec<Subject>,
    events: Vec<PatientEvent>,
    snapshots: Vec<Snapshot>,
    queries: Vec<Value>,
    controls: Controls,
}

/// Entity totals, for asserting that re-runs create nothing new.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityCounts {
    pub organizations: usize,
    pub users: usize,
    pub forms: usize,
    pub rules: usize,
    pub studies: usize,
    pub event_definitions: usize,
    pub subjects: usize,
    pub events: usize,
    pub snapshots: usize,
    pub queries: usize,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn issue_token(&mut self) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.tokens.insert(token.clone());
        token
    }

    fn form(&self, id: i64) -> MockResult<&Form> {
        self.forms
            .iter()
            .find(|f| f.id == id)
            .ok_or_else(|| MockError::not_found("form", id))
    }

    fn event(&self, id: i64) -> MockResult<&PatientEvent> {
        self.events
            .iter()
            .find(|e| e.id == id)
            .ok_or_else(|| MockError::not_found("event", id))
    }

    fn definition(&self, id: i64) -> MockResult<&EventDefinition> {
        self.definitions
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| MockError::not_found("event definition", id))
    }

    fn materialize(&mut self, event_id: i64, assignment: &Assignment, data: Map<String, Value>) {
        let Some(form) = self.forms.iter().find(|f| f.id == assignment.form_id) else {
            return;
        };
        let (form_name, fields) = (form.name.clone(), form.fields.clone());
        let id = self.next_id();
        self.snapshots.push(Snapshot {
            id,
            event_id,
            form_id: assignment.form_id,
            form_name,
            fields,
            data,
            locked: false,
        });
    }

    fn materialize_all(&mut self, event_id: i64, definition_id: i64) -> MockResult<()> {
        let assignments = self.definition(definition_id)?.assignments.clone();
        for assignment in &assignments {
            self.materialize(event_id, assignment, Map::new());
        }
        Ok(())
    }

    fn subject_event_ids(&self, subject_id: i64) -> Vec<i64> {
        self.events
            .iter()
            .filter(|e| e.subject_id == subject_id)
            .map(|e| e.id)
            .collect()
    }
}

/// Shared in-memory backend state.
#[derive(Debug, Default)]
pub struct Store {
    inner: Mutex<Inner>,
}

impl Store {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- authentication --------------------------------------------------------------------

    pub fn register(&self, body: &Value) -> MockResult<Value> {
        let organization = body.get("organization").unwrap_or(&Value::Null);
        let admin = body.get("admin").unwrap_or(&Value::Null);
        let name = required_text(organization, "name")?;
        let username = required_text(admin, "username")?;
        let email = required_text(admin, "email")?;
        let password = required_text(admin, "password")?;

        let mut inner = self.lock();
        if inner.users.iter().any(|u| u.username == username) {
            return Err(MockError::conflict(format!("username {username} is taken")));
        }
        let organization_id = inner.next_id();
        inner.organizations.push((organization_id, name.clone()));
        let user = User {
            id: inner.next_id(),
            organization_id,
            username,
            email,
            password,
            role: "admin".into(),
        };
        let user_json = user.to_json();
        inner.users.push(user);

        Ok(json!({
            "organization": { "id": organization_id, "name": name },
            "user": user_json,
        }))
    }

    pub fn login(&self, body: &Value) -> MockResult<Value> {
        let username = required_text(body, "username")?;
        let password = required_text(body, "password")?;

        let mut inner = self.lock();
        let user = inner
            .users
            .iter()
            .find(|u| u.username == username && u.password == password)
            .cloned()
            .ok_or_else(|| MockError::new(StatusCode::UNAUTHORIZED, "invalid credentials"))?;
        let access_token = inner.issue_token();
        let refresh_token = uuid::Uuid::new_v4().to_string();

        Ok(json!({
            "accessToken": access_token,
            "refreshToken": refresh_token,
            "user": user.to_json(),
        }))
    }

    pub fn is_token_valid(&self, token: &str) -> bool {
        self.lock().tokens.contains(token)
    }

    // -- users -----------------------------------------------------------------------------

    pub fn search_users(&self, search: Option<&str>) -> Vec<Value> {
        let inner = self.lock();
        inner
            .users
            .iter()
            .filter(|u| search.map_or(true, |s| u.username.contains(s) || u.email.contains(s)))
            .map(User::to_json)
            .collect()
    }

    pub fn create_user(&self, body: &Value) -> MockResult<Value> {
        let username = required_text(body, "username")?;
        let email = required_text(body, "email")?;
        let password = required_text(body, "password")?;
        let organization_id = id_of(body, "organizationId")?;

        let mut inner = self.lock();
        if inner.users.iter().any(|u| u.username == username) {
            return Err(MockError::conflict(format!("username {username} is taken")));
        }
        let user = User {
            id: inner.next_id(),
            organization_id,
            username,
            email,
            password,
            role: text(body, "role").unwrap_or_else(|| "member".into()),
        };
        let json = user.to_json();
        inner.users.push(user);
        Ok(json)
    }

    // -- forms -----------------------------------------------------------------------------

    pub fn list_forms(&self) -> Vec<Value> {
        self.lock().forms.iter().map(Form::to_json).collect()
    }

    pub fn create_form(&self, body: &Value) -> MockResult<Value> {
        let name = required_text(body, "name")?;
        let fields = match body.get("fields") {
            Some(Value::Array(fields)) => Value::Array(fields.clone()),
            _ => return Err(MockError::bad_request("'fields' must be an array")),
        };

        let mut inner = self.lock();
        if inner.forms.iter().any(|f| f.name == name) {
            return Err(MockError::conflict(format!("form '{name}' already exists")));
        }
        let form = Form {
            id: inner.next_id(),
            name,
            description: text(body, "description").unwrap_or_default(),
            category: text(body, "category").unwrap_or_default(),
            fields,
            workflow: json!({}),
        };
        let json = form.to_json();
        inner.forms.push(form);
        Ok(json)
    }

    pub fn get_form(&self, id: i64) -> MockResult<Value> {
        self.lock().form(id).map(Form::to_json)
    }

    /// Updates a template. Existing snapshots keep their frozen structure.
    pub fn update_form(&self, id: i64, body: &Value) -> MockResult<Value> {
        let mut inner = self.lock();
        let form = inner
            .forms
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| MockError::not_found("form", id))?;
        if let Some(name) = text(body, "name") {
            form.name = name;
        }
        if let Some(description) = text(body, "description") {
            form.description = description;
        }
        if let Some(Value::Array(fields)) = body.get("fields") {
            form.fields = Value::Array(fields.clone());
        }
        Ok(form.to_json())
    }

    pub fn fork_form(&self, id: i64, body: &Value) -> MockResult<Value> {
        let mut inner = self.lock();
        let source = inner.form(id)?.clone();
        let name = text(body, "name").unwrap_or_else(|| format!("{} (Fork)", source.name));
        let form = Form {
            id: inner.next_id(),
            name,
            ..source
        };
        let json = json!({ "newFormId": form.id, "sourceFormId": id, "form": form.to_json() });
        inner.forms.push(form);
        Ok(json)
    }

    pub fn workflow_config(&self, id: i64) -> MockResult<Value> {
        let inner = self.lock();
        let form = inner.form(id)?;
        Ok(json!({ "formId": id, "config": form.workflow }))
    }

    pub fn set_workflow_config(&self, id: i64, body: &Value) -> MockResult<Value> {
        let mut inner = self.lock();
        let form = inner
            .forms
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| MockError::not_found("form", id))?;
        form.workflow = body.clone();
        Ok(json!({ "formId": id, "config": form.workflow }))
    }

    // -- validation rules ------------------------------------------------------------------

    pub fn rules_for_form(&self, form_id: i64) -> Vec<Value> {
        self.lock()
            .rules
            .iter()
            .filter(|r| r.get("formId").and_then(Value::as_i64) == Some(form_id))
            .cloned()
            .collect()
    }

    pub fn create_rule(&self, body: &Value) -> MockResult<Value> {
        let form_id = id_of(body, "formId")?;
        required_text(body, "fieldName")?;
        required_text(body, "name")?;

        let mut inner = self.lock();
        inner.form(form_id)?;
        let mut rule = body.clone();
        let id = inner.next_id();
        if let Value::Object(map) = &mut rule {
            map.insert("id".into(), json!(id));
            map.insert("formId".into(), json!(form_id));
        }
        inner.rules.push(rule.clone());
        Ok(json!({ "ruleId": id, "rule": rule }))
    }

    // -- studies ---------------------------------------------------------------------------

    pub fn list_studies(&self) -> Vec<Value> {
        self.lock().studies.iter().map(Study::to_json).collect()
    }

    pub fn create_study(&self, body: &Value) -> MockResult<Value> {
        let name = required_text(body, "name")?;
        let protocol_number = required_text(body, "protocolNumber")?;

        let mut inner = self.lock();
        if inner
            .studies
            .iter()
            .any(|s| s.protocol_number == protocol_number)
        {
            return Err(MockError::conflict(format!(
                "protocol {protocol_number} already exists"
            )));
        }
        let study = Study {
            id: inner.next_id(),
            name,
            protocol_number,
            sites: Vec::new(),
        };
        let json = study.to_json();
        inner.studies.push(study);
        Ok(json)
    }

    pub fn create_site(&self, study_id: i64, body: &Value) -> MockResult<Value> {
        let name = required_text(body, "name")?;
        let site_number = required_text(body, "siteNumber")?;

        let mut inner = self.lock();
        let id = inner.next_id();
        let study = inner
            .studies
            .iter_mut()
            .find(|s| s.id == study_id)
            .ok_or_else(|| MockError::not_found("study", study_id))?;
        study.sites.push(Site {
            id,
            name: name.clone(),
            site_number: site_number.clone(),
        });
        Ok(json!({ "siteId": id, "name": name, "siteNumber": site_number }))
    }

    pub fn list_definitions(&self, study_id: i64) -> Vec<Value> {
        self.lock()
            .definitions
            .iter()
            .filter(|d| d.study_id == study_id)
            .map(|d| {
                json!({
                    "id": d.id,
                    "studyId": d.study_id,
                    "name": d.name,
                    "order": d.order,
                    "formCount": d.assignments.len(),
                })
            })
            .collect()
    }

    pub fn create_definition(&self, study_id: i64, body: &Value) -> MockResult<Value> {
        let name = required_text(body, "name")?;
        let forms = body
            .get("forms")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut inner = self.lock();
        if !inner.studies.iter().any(|s| s.id == study_id) {
            return Err(MockError::not_found("study", study_id));
        }
        let mut assignments = Vec::with_capacity(forms.len());
        for (index, form) in forms.iter().enumerate() {
            let form_id = id_of(form, "formId")?;
            inner.form(form_id)?;
            assignments.push(Assignment {
                form_id,
                order: form
                    .get("order")
                    .and_then(Value::as_i64)
                    .unwrap_or(index as i64 + 1),
                required: flag(form, "required"),
                double_entry: flag(form, "doubleEntry"),
                electronic_signature: flag(form, "electronicSignature"),
                hidden: flag(form, "hidden"),
            });
        }
        let definition = EventDefinition {
            id: inner.next_id(),
            study_id,
            name,
            order: body.get("order").and_then(Value::as_i64).unwrap_or(0),
            assignments,
        };
        let json = json!({
            "eventDefinitionId": definition.id,
            "name": definition.name,
            "formCount": definition.assignments.len(),
        });
        inner.definitions.push(definition);
        Ok(json)
    }

    // -- subjects and events ---------------------------------------------------------------

    pub fn list_subjects(&self, study_id: Option<i64>, label: Option<&str>) -> Vec<Value> {
        self.lock()
            .subjects
            .iter()
            .filter(|s| study_id.map_or(true, |id| s.study_id == id))
            .filter(|s| label.map_or(true, |l| s.label == l))
            .map(|s| {
                json!({
                    "id": s.id,
                    "studyId": s.study_id,
                    "siteId": s.site_id,
                    "studySubjectLabel": s.label,
                    "enrollmentDate": s.enrollment_date,
                })
            })
            .collect()
    }

    pub fn create_subject(&self, body: &Value) -> MockResult<Value> {
        let study_id = id_of(body, "studyId")?;
        let site_id = id_of(body, "siteId")?;
        let label = required_text(body, "label")?;

        let mut inner = self.lock();
        if inner
            .subjects
            .iter()
            .any(|s| s.study_id == study_id && s.label == label)
        {
            return Err(MockError::conflict(format!("subject {label} already enrolled")));
        }
        let subject = Subject {
            id: inner.next_id(),
            study_id,
            site_id,
            label,
            enrollment_date: text(body, "enrollmentDate").unwrap_or_default(),
        };
        let json = json!({ "subjectId": subject.id, "label": subject.label });
        inner.subjects.push(subject);
        Ok(json)
    }

    /// Creates a visit instance and materializes one snapshot per assigned form.
    pub fn schedule(&self, body: &Value, unscheduled: bool) -> MockResult<Value> {
        let subject_id = id_of(body, "subjectId")?;
        let definition_id = id_of(body, "eventDefinitionId")?;

        let mut inner = self.lock();
        if !inner.subjects.iter().any(|s| s.id == subject_id) {
            return Err(MockError::not_found("subject", subject_id));
        }
        inner.definition(definition_id)?;
        if !unscheduled
            && inner.events.iter().any(|e| {
                e.subject_id == subject_id && e.definition_id == definition_id && !e.unscheduled
            })
        {
            return Err(MockError::conflict("event already scheduled for subject"));
        }

        let event = PatientEvent {
            id: inner.next_id(),
            subject_id,
            definition_id,
            start_date: text(body, "startDate").unwrap_or_default(),
            unscheduled,
        };
        let event_id = event.id;
        inner.events.push(event);
        inner.materialize_all(event_id, definition_id)?;

        let snapshots = inner
            .snapshots
            .iter()
            .filter(|s| s.event_id == event_id)
            .count();
        Ok(json!({ "patientEventId": event_id, "snapshotsCreated": snapshots }))
    }

    pub fn subject_events(&self, subject_id: i64) -> Vec<Value> {
        let inner = self.lock();
        inner
            .events
            .iter()
            .filter(|e| e.subject_id == subject_id)
            .map(|e| {
                let name = inner
                    .definition(e.definition_id)
                    .map(|d| d.name.clone())
                    .unwrap_or_default();
                json!({
                    "id": e.id,
                    "event_definition_id": e.definition_id,
                    "event_name": name,
                    "start_date": e.start_date,
                    "is_unscheduled": e.unscheduled,
                })
            })
            .collect()
    }

    pub fn visit_forms(&self, event_id: i64) -> MockResult<Vec<Value>> {
        let inner = self.lock();
        let event = inner.event(event_id)?;
        let definition = inner.definition(event.definition_id)?;
        Ok(definition
            .assignments
            .iter()
            .map(|a| {
                let name = inner.form(a.form_id).map(|f| f.name.clone()).unwrap_or_default();
                json!({
                    "crfId": a.form_id,
                    "name": name,
                    "order": a.order,
                    "required": a.required,
                    "double_entry": a.double_entry,
                    "electronic_signature": a.electronic_signature,
                    "hidden": a.hidden,
                })
            })
            .collect())
    }

    pub fn event_snapshots(&self, event_id: i64) -> MockResult<Vec<Value>> {
        let inner = self.lock();
        inner.event(event_id)?;
        Ok(inner
            .snapshots
            .iter()
            .filter(|s| s.event_id == event_id)
            .map(Snapshot::to_json)
            .collect())
    }

    pub fn snapshot_data(&self, snapshot_id: i64) -> MockResult<Value> {
        let inner = self.lock();
        inner
            .snapshots
            .iter()
            .find(|s| s.id == snapshot_id)
            .map(|s| Value::Object(s.data.clone()))
            .ok_or_else(|| MockError::not_found("snapshot", snapshot_id))
    }

    /// Replaces a snapshot's data after checking the frozen structure's required fields.
    pub fn save_snapshot_data(&self, snapshot_id: i64, body: &Value) -> MockResult<Value> {
        let data = match body.get("data").unwrap_or(body) {
            Value::Object(map) => map.clone(),
            _ => return Err(MockError::bad_request("'data' must be an object")),
        };

        let mut inner = self.lock();
        let snapshot = inner
            .snapshots
            .iter_mut()
            .find(|s| s.id == snapshot_id)
            .ok_or_else(|| MockError::not_found("snapshot", snapshot_id))?;
        if snapshot.locked {
            return Err(MockError::new(StatusCode::LOCKED, "snapshot is locked"));
        }

        let missing: Vec<&str> = snapshot
            .fields
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter(|f| flag(f, "required"))
            .filter_map(|f| f.get("name").and_then(Value::as_str))
            .filter(|name| {
                data.get(*name)
                    .map_or(true, |v| v.is_null() || v.as_str() == Some(""))
            })
            .collect();
        if !missing.is_empty() {
            return Err(MockError::bad_request(format!(
                "required field missing: {}",
                missing.join(", ")
            )));
        }

        snapshot.data = data
            .iter()
            .map(|(k, v)| (k.clone(), as_stored_text(v)))
            .collect();
        Ok(json!({ "id": snapshot.id, "saved": snapshot.data.len() }))
    }

    // -- verification and repair -----------------------------------------------------------

    /// Compares assignments with snapshots for every visit of a subject.
    pub fn verify(&self, subject_id: i64) -> Value {
        let inner = self.lock();
        let mut events = Vec::new();
        let (mut forms_checked, mut missing_total, mut extra_total) = (0, 0, 0);

        for event in inner.events.iter().filter(|e| e.subject_id == subject_id) {
            let assigned: Vec<i64> = inner
                .definition(event.definition_id)
                .map(|d| d.assignments.iter().map(|a| a.form_id).collect())
                .unwrap_or_default();
            let mut remaining = assigned.clone();
            let mut extra = Vec::new();
            let mut actual = 0;
            for snapshot in inner.snapshots.iter().filter(|s| s.event_id == event.id) {
                actual += 1;
                match remaining.iter().position(|f| *f == snapshot.form_id) {
                    Some(i) => {
                        remaining.remove(i);
                    }
                    None => extra.push(snapshot.id),
                }
            }
            forms_checked += assigned.len();
            missing_total += remaining.len();
            extra_total += extra.len();
            events.push(json!({
                "patientEventId": event.id,
                "eventDefinitionId": event.definition_id,
                "expectedForms": assigned.len(),
                "actualForms": actual,
                "missing": remaining,
                "extra": extra,
            }));
        }

        json!({
            "totalEventsChecked": events.len(),
            "totalFormsChecked": forms_checked,
            "missingCount": missing_total,
            "extraCount": extra_total,
            "events": events,
        })
    }

    /// Deletes and recreates every snapshot of a subject from current template state.
    pub fn refresh(&self, subject_id: i64) -> MockResult<Value> {
        let mut inner = self.lock();
        if inner.controls.fail_refresh {
            return Err(MockError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "snapshot refresh failed",
            ));
        }
        let preserve = inner.controls.preserve_data_on_refresh;
        let event_ids = inner.subject_event_ids(subject_id);

        let mut refreshed = 0;
        for event_id in event_ids {
            let definition_id = inner.event(event_id)?.definition_id;
            let mut saved: HashMap<i64, Map<String, Value>> = HashMap::new();
            inner.snapshots.retain(|s| {
                if s.event_id == event_id {
                    saved.entry(s.form_id).or_insert_with(|| s.data.clone());
                    false
                } else {
                    true
                }
            });
            let assignments = inner.definition(definition_id)?.assignments.clone();
            for assignment in &assignments {
                let data = if preserve {
                    saved.remove(&assignment.form_id).unwrap_or_default()
                } else {
                    Map::new()
                };
                inner.materialize(event_id, assignment, data);
                refreshed += 1;
            }
            if inner.controls.refresh_leaves_duplicate {
                if let Some(first) = assignments.first() {
                    inner.materialize(event_id, first, Map::new());
                }
            }
        }
        Ok(json!({ "refreshed": refreshed }))
    }

    /// Creates only the snapshots that are missing.
    pub fn repair(&self, subject_id: i64) -> MockResult<Value> {
        let mut inner = self.lock();
        if inner.controls.fail_repair {
            return Err(MockError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "snapshot repair failed",
            ));
        }
        let mut created = 0;
        let event_ids = inner.subject_event_ids(subject_id);
        for event_id in event_ids {
            let definition_id = inner.event(event_id)?.definition_id;
            let assignments = inner.definition(definition_id)?.assignments.clone();
            for assignment in &assignments {
                let exists = inner
                    .snapshots
                    .iter()
                    .any(|s| s.event_id == event_id && s.form_id == assignment.form_id);
                if !exists {
                    inner.materialize(event_id, assignment, Map::new());
                    created += 1;
                }
            }
        }
        Ok(json!({ "created": created }))
    }

    // -- queries ---------------------------------------------------------------------------

    pub fn list_queries(&self, subject_id: Option<i64>) -> Vec<Value> {
        self.lock()
            .queries
            .iter()
            .filter(|q| {
                subject_id.map_or(true, |id| q.get("subjectId").and_then(Value::as_i64) == Some(id))
            })
            .cloned()
            .collect()
    }

    pub fn create_query(&self, body: &Value) -> MockResult<Value> {
        let subject_id = id_of(body, "subjectId")?;
        required_text(body, "description")?;

        let mut inner = self.lock();
        let id = inner.next_id();
        let mut query = body.clone();
        if let Value::Object(map) = &mut query {
            map.insert("id".into(), json!(id));
            map.insert("subjectId".into(), json!(subject_id));
            map.insert("status".into(), json!("open"));
        }
        inner.queries.push(query.clone());
        Ok(query)
    }

    // -- test controls ---------------------------------------------------------------------

    /// Invalidates every issued access token.
    pub fn expire_tokens(&self) {
        self.lock().tokens.clear();
    }

    /// Makes every authenticated request to `path` answer 401.
    pub fn force_unauthorized(&self, path: &str) {
        self.lock()
            .controls
            .forced_unauthorized
            .insert(path.to_string());
    }

    pub fn clear_forced_unauthorized(&self) {
        self.lock().controls.forced_unauthorized.clear();
    }

    pub fn is_forced_unauthorized(&self, path: &str) -> bool {
        self.lock().controls.forced_unauthorized.contains(path)
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.lock().controls.fail_refresh = fail;
    }

    pub fn fail_repair(&self, fail: bool) {
        self.lock().controls.fail_repair = fail;
    }

    /// Makes refresh create one surplus snapshot per visit, duplicating its first form.
    pub fn refresh_leaves_duplicate(&self, duplicate: bool) {
        self.lock().controls.refresh_leaves_duplicate = duplicate;
    }

    pub fn preserve_data_on_refresh(&self, preserve: bool) {
        self.lock().controls.preserve_data_on_refresh = preserve;
    }

    /// Attaches a snapshot of `form_id` to a visit whose definition does not assign it.
    pub fn add_orphan_snapshot(&self, event_id: i64, form_id: i64) -> Option<i64> {
        let mut inner = self.lock();
        inner.event(event_id).ok()?;
        let (form_name, fields) = inner
            .form(form_id)
            .map(|f| (f.name.clone(), f.fields.clone()))
            .ok()?;
        let id = inner.next_id();
        inner.snapshots.push(Snapshot {
            id,
            event_id,
            form_id,
            form_name,
            fields,
            data: Map::new(),
            locked: false,
        });
        Some(id)
    }

    /// Removes a snapshot behind the API's back. Returns `false` if it did not exist.
    pub fn delete_snapshot(&self, snapshot_id: i64) -> bool {
        let mut inner = self.lock();
        let before = inner.snapshots.len();
        inner.snapshots.retain(|s| s.id != snapshot_id);
        inner.snapshots.len() != before
    }

    /// Overwrites `key` on the structure field named `field` of a snapshot.
    pub fn corrupt_snapshot_field(
        &self,
        snapshot_id: i64,
        field: &str,
        key: &str,
        value: Value,
    ) -> bool {
        let mut inner = self.lock();
        let target = inner
            .snapshots
            .iter_mut()
            .find(|s| s.id == snapshot_id)
            .and_then(|s| s.fields.as_array_mut())
            .and_then(|fields| {
                fields
                    .iter_mut()
                    .find(|f| f.get("name").and_then(Value::as_str) == Some(field))
            });
        match target {
            Some(Value::Object(map)) => {
                map.insert(key.to_string(), value);
                true
            }
            _ => false,
        }
    }

    pub fn lock_snapshot(&self, snapshot_id: i64) -> bool {
        let mut inner = self.lock();
        match inner.snapshots.iter_mut().find(|s| s.id == snapshot_id) {
            Some(snapshot) => {
                snapshot.locked = true;
                true
            }
            None => false,
        }
    }

    pub fn record_request(&self, path: &str) {
        *self
            .lock()
            .controls
            .request_counts
            .entry(path.to_string())
            .or_default() += 1;
    }

    /// Number of requests seen for `path` (without the `/api` prefix).
    pub fn request_count(&self, path: &str) -> usize {
        self.lock()
            .controls
            .request_counts
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub fn login_count(&self) -> usize {
        self.request_count("/auth/login")
    }

    pub fn counts(&self) -> EntityCounts {
        let inner = self.lock();
        EntityCounts {
            organizations: inner.organizations.len(),
            users: inner.users.len(),
            forms: inner.forms.len(),
            rules: inner.rules.len(),
            studies: inner.studies.len(),
            event_definitions: inner.definitions.len(),
            subjects: inner.subjects.len(),
            events: inner.events.len(),
            snapshots: inner.snapshots.len(),
            queries: inner.queries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (Store, i64, i64) {
        let store = Store::default();
        store
            .register(&json!({
                "organization": {"name": "Org"},
                "admin": {"username": "admin", "email": "a@b.c", "password": "pw"}
            }))
            .unwrap();
        let form_a = store
            .create_form(&json!({"name": "A", "fields": [
                {"name": "visit_date", "type": "date", "required": true}
            ]}))
            .unwrap()["id"]
            .as_i64()
            .unwrap();
        let form_b = store
            .create_form(&json!({"name": "B", "fields": []}))
            .unwrap()["id"]
            .as_i64()
            .unwrap();
        let study = store
            .create_study(&json!({"name": "S", "protocolNumber": "P-1"}))
            .unwrap()["id"]
            .as_i64()
            .unwrap();
        let site = store
            .create_site(study, &json!({"name": "Site", "siteNumber": "01"}))
            .unwrap()["siteId"]
            .as_i64()
            .unwrap();
        let definition = store
            .create_definition(
                study,
                &json!({"name": "Visit", "forms": [{"formId": form_a}, {"formId": form_b}]}),
            )
            .unwrap()["eventDefinitionId"]
            .as_i64()
            .unwrap();
        let subject = store
            .create_subject(&json!({"studyId": study, "siteId": site, "label": "S-1"}))
            .unwrap()["subjectId"]
            .as_i64()
            .unwrap();
        (store, subject, definition)
    }

    #[test]
    fn test_schedule_materializes_each_assignment() {
        let (store, subject, definition) = seeded();
        let created = store
            .schedule(&json!({"subjectId": subject, "eventDefinitionId": definition}), false)
            .unwrap();
        assert_eq!(created["snapshotsCreated"], json!(2));

        let report = store.verify(subject);
        assert_eq!(report["totalFormsChecked"], json!(2));
        assert_eq!(report["missingCount"], json!(0));

        let duplicate =
            store.schedule(&json!({"subjectId": subject, "eventDefinitionId": definition}), false);
        assert_eq!(duplicate.unwrap_err().status, StatusCode::CONFLICT);
    }

    #[test]
    fn test_repair_fills_only_gaps_and_refresh_discards_data() {
        let (store, subject, definition) = seeded();
        let event = store
            .schedule(&json!({"subjectId": subject, "eventDefinitionId": definition}), false)
            .unwrap()["patientEventId"]
            .as_i64()
            .unwrap();
        let snapshots = store.event_snapshots(event).unwrap();
        let first = snapshots[0]["id"].as_i64().unwrap();
        store
            .save_snapshot_data(first, &json!({"data": {"visit_date": "2026-01-01"}}))
            .unwrap();

        let second = snapshots[1]["id"].as_i64().unwrap();
        assert!(store.delete_snapshot(second));
        assert_eq!(store.verify(subject)["missingCount"], json!(1));
        assert_eq!(store.repair(subject).unwrap()["created"], json!(1));
        assert_eq!(store.verify(subject)["missingCount"], json!(0));
        assert_eq!(store.snapshot_data(first).unwrap()["visit_date"], json!("2026-01-01"));

        store.refresh(subject).unwrap();
        let refreshed = store.event_snapshots(event).unwrap();
        assert_eq!(refreshed.len(), 2);
        assert_eq!(refreshed[0]["form_data"], json!({}));
    }

    #[test]
    fn test_save_rejects_missing_required_field_and_stores_text() {
        let (store, subject, definition) = seeded();
        let event = store
            .schedule(&json!({"subjectId": subject, "eventDefinitionId": definition}), false)
            .unwrap()["patientEventId"]
            .as_i64()
            .unwrap();
        let id = store.event_snapshots(event).unwrap()[0]["id"].as_i64().unwrap();

        let err = store
            .save_snapshot_data(id, &json!({"data": {"heart_rate": 72}}))
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(store.snapshot_data(id).unwrap(), json!({}));

        store
            .save_snapshot_data(id, &json!({"data": {"visit_date": "2026-01-01", "heart_rate": 72}}))
            .unwrap();
        assert_eq!(store.snapshot_data(id).unwrap()["heart_rate"], json!("72"));
    }
}
