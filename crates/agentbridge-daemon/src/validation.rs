//! Validator registry and field checks.
//!
//! Each validator is a standalone unit returning its own `ValidationResult`.
//! The engine runs them in registration order and merges the results. The
//! patch lifecycle that also lives on the engine is in `patch.rs`.

use std::sync::Arc;

use agentbridge_core::{json_type_name, PatchRecord, ResponseArtifact, ValidationResult};
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::patch::PatchBackend;

/// Artifact type carrying a code change.
pub const PATCH_SUBMISSION: &str = "patch_submission";
/// Artifact type relayed to the chat service.
pub const PROMPT: &str = "prompt";

pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, artifact: &ResponseArtifact) -> ValidationResult;
}

/// Adapter so plain closures can be registered.
pub struct FnValidator<F> {
    name: String,
    f: F,
}

impl<F> FnValidator<F>
where
    F: Fn(&ResponseArtifact) -> ValidationResult + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Validator for FnValidator<F>
where
    F: Fn(&ResponseArtifact) -> ValidationResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, artifact: &ResponseArtifact) -> ValidationResult {
        (self.f)(artifact)
    }
}

// ---------------------------------------------------------------------------
// Field checks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Number => write!(f, "number"),
            Self::Integer => write!(f, "integer"),
            Self::Boolean => write!(f, "boolean"),
            Self::Object => write!(f, "object"),
            Self::Array => write!(f, "array"),
        }
    }
}

/// One error per missing key, naming the key.
pub fn validate_required_fields(obj: &Map<String, Value>, names: &[&str]) -> ValidationResult {
    let errors = names
        .iter()
        .filter(|name| !obj.contains_key(**name))
        .map(|name| format!("missing required field '{name}'"))
        .collect();
    ValidationResult::from_errors(errors)
}

/// A missing field and a wrong type are reported differently.
pub fn validate_field_type(obj: &Map<String, Value>, field: &str, expected: FieldType) -> ValidationResult {
    match obj.get(field) {
        None => ValidationResult::error(format!("missing field '{field}'")),
        Some(value) if expected.matches(value) => ValidationResult::ok(),
        Some(value) => ValidationResult::error(format!(
            "field '{field}' expected {expected}, got {}",
            json_type_name(value)
        )),
    }
}

fn non_empty_string(obj: &Map<String, Value>, field: &str) -> ValidationResult {
    match obj.get(field).and_then(Value::as_str) {
        Some(s) if s.trim().is_empty() => ValidationResult::error(format!("field '{field}' is empty")),
        _ => ValidationResult::ok(),
    }
}

/// Agent and patch ids name files under the bridge root, so they must be a
/// single plain path component.
pub fn is_plain_name(id: &str) -> bool {
    !id.trim().is_empty() && id != "." && id != ".." && !id.contains(['/', '\\', '\0'])
}

// ---------------------------------------------------------------------------
// Built-in validators
// ---------------------------------------------------------------------------

/// `agent_id`, `type` and `timestamp` on every artifact.
pub struct EnvelopeValidator;

impl Validator for EnvelopeValidator {
    fn name(&self) -> &str {
        "envelope"
    }

    fn validate(&self, artifact: &ResponseArtifact) -> ValidationResult {
        let obj = artifact.fields();
        let mut result = validate_required_fields(obj, &["agent_id", "type", "timestamp"]);
        for field in ["agent_id", "type"] {
            if obj.contains_key(field) {
                result = result
                    .merge(validate_field_type(obj, field, FieldType::String))
                    .merge(non_empty_string(obj, field));
            }
        }
        if let Some(id) = artifact.agent_id() {
            if !id.trim().is_empty() && !is_plain_name(id) {
                result.push_error(format!("agent_id '{id}' is not a plain name"));
            }
        }
        if obj.contains_key("priority") {
            result = result.merge(validate_field_type(obj, "priority", FieldType::Integer));
        }
        if let Some(ts) = obj.get("timestamp") {
            let parses = ts
                .as_str()
                .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
                .unwrap_or(false);
            if !parses {
                result.push_warning(format!("timestamp {ts} is not RFC 3339"));
            }
        }
        result
    }
}

/// `patch_id`, `test_id` and `content` on patch submissions.
pub struct PatchSubmissionValidator;

impl Validator for PatchSubmissionValidator {
    fn name(&self) -> &str {
        "patch_submission"
    }

    fn validate(&self, artifact: &ResponseArtifact) -> ValidationResult {
        if artifact.kind() != Some(PATCH_SUBMISSION) {
            return ValidationResult::ok();
        }
        let obj = artifact.fields();
        let mut result = validate_required_fields(obj, &["patch_id", "test_id", "content"]);
        for field in ["patch_id", "test_id", "content"] {
            if obj.contains_key(field) {
                result = result.merge(validate_field_type(obj, field, FieldType::String));
            }
        }
        if let Some(id) = artifact.get_str("patch_id") {
            if !id.trim().is_empty() && !is_plain_name(id) {
                result.push_error(format!("patch_id '{id}' is not a plain name"));
            }
        }
        result
    }
}

/// Prompts carry their text in `content`.
pub struct PromptValidator;

impl Validator for PromptValidator {
    fn name(&self) -> &str {
        "prompt"
    }

    fn validate(&self, artifact: &ResponseArtifact) -> ValidationResult {
        if artifact.kind() != Some(PROMPT) {
            return ValidationResult::ok();
        }
        validate_field_type(artifact.fields(), "content", FieldType::String)
            .merge(non_empty_string(artifact.fields(), "content"))
    }
}

/// Shape check for an agent state file: `status`, `last_update`, `context`.
pub fn validate_agent_state_value(value: &Value) -> ValidationResult {
    let Some(obj) = value.as_object() else {
        return ValidationResult::error(format!(
            "agent state must be an object, got {}",
            json_type_name(value)
        ));
    };
    let mut result = validate_required_fields(obj, &["status", "last_update", "context"]);
    if obj.contains_key("status") {
        result = result.merge(validate_field_type(obj, "status", FieldType::String));
        if let Some(status) = obj.get("status").and_then(Value::as_str) {
            if status.parse::<agentbridge_core::AgentStatus>().is_err() {
                result.push_error(format!("unknown status '{status}'"));
            }
        }
    }
    if obj.contains_key("last_update") {
        result = result.merge(validate_field_type(obj, "last_update", FieldType::String));
    }
    if obj.contains_key("context") {
        result = result.merge(validate_field_type(obj, "context", FieldType::Object));
    }
    result
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ValidationEngine {
    validators: Vec<Arc<dyn Validator>>,
    pub(crate) backend: Arc<dyn PatchBackend>,
    pub(crate) patches: DashMap<String, PatchRecord>,
}

impl ValidationEngine {
    /// An engine with no validators.
    pub fn new(backend: Arc<dyn PatchBackend>) -> Self {
        Self {
            validators: Vec::new(),
            backend,
            patches: DashMap::new(),
        }
    }

    /// Envelope, patch submission and prompt validators, in that order.
    pub fn with_defaults(backend: Arc<dyn PatchBackend>) -> Self {
        let mut engine = Self::new(backend);
        engine.register(EnvelopeValidator);
        engine.register(PatchSubmissionValidator);
        engine.register(PromptValidator);
        engine
    }

    pub fn register(&mut self, validator: impl Validator + 'static) {
        self.validators.push(Arc::new(validator));
    }

    pub fn validator_names(&self) -> Vec<&str> {
        self.validators.iter().map(|v| v.name()).collect()
    }

    pub fn validate(&self, artifact: &ResponseArtifact) -> ValidationResult {
        self.validators
            .iter()
            .fold(ValidationResult::ok(), |acc, v| acc.merge(v.validate(artifact)))
    }
}
