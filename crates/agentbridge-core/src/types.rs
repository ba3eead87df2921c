//! Core types for agentbridge

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// ResponseArtifact
// ---------------------------------------------------------------------------

/// Envelope keys; everything else in the object is payload.
pub const ENVELOPE_FIELDS: [&str; 4] = ["agent_id", "type", "priority", "timestamp"];

/// One unit of work read from a mailbox file.
///
/// The artifact keeps the whole JSON object so validators see exactly what
/// the producer wrote; typed accessors cover the envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseArtifact {
    name: String,
    fields: Map<String, Value>,
}

impl ResponseArtifact {
    pub fn new(name: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Parse file content. Anything but a JSON object is malformed by construction.
    pub fn from_slice(name: impl Into<String>, bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::validation(vec![format!("artifact is not valid JSON: {e}")]))?;
        match value {
            Value::Object(fields) => Ok(Self::new(name, fields)),
            other => Err(Error::validation(vec![format!(
                "artifact must be a JSON object, got {}",
                json_type_name(&other)
            )])),
        }
    }

    /// Source file name (the same name is used in archive/ and failed/).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.get_str("agent_id")
    }

    pub fn kind(&self) -> Option<&str> {
        self.get_str("type")
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.get_str("timestamp")
    }

    pub fn priority(&self) -> Option<i64> {
        self.fields.get("priority").and_then(Value::as_i64)
    }

    /// Every non-envelope field.
    pub fn payload(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .filter(|(k, _)| !ENVELOPE_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// ValidationResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::ok()
    }
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            errors: vec![message.into()],
            warnings: Vec::new(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: vec![message.into()],
        }
    }

    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings: Vec::new(),
        }
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.is_valid = false;
    }

    pub fn push_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Valid iff both are valid; messages keep their order.
    pub fn merge(mut self, other: ValidationResult) -> Self {
        self.is_valid = self.is_valid && other.is_valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self
    }

    /// Fold into an error. With `strict`, warnings count as errors.
    pub fn into_result(self, strict: bool) -> Result<Self> {
        if !self.is_valid {
            return Err(Error::validation(self.errors));
        }
        if strict && !self.warnings.is_empty() {
            return Err(Error::validation(self.warnings));
        }
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Patches
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStatus {
    Pending,
    Applied,
    Verified,
    RolledBack,
    Failed,
}

impl PatchStatus {
    pub fn can_transition_to(self, next: PatchStatus) -> bool {
        use PatchStatus::*;
        matches!(
            (self, next),
            (Pending, Applied)
                | (Applied, Verified)
                | (Applied, RolledBack)
                | (Pending, Failed)
                | (Applied, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Verified | Self::RolledBack | Self::Failed)
    }
}

impl std::fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Applied => write!(f, "applied"),
            Self::Verified => write!(f, "verified"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub patch_id: String,
    pub test_id: String,
    pub agent_id: String,
    pub content: String,
    pub status: PatchStatus,
}

impl PatchRecord {
    pub fn new(
        patch_id: impl Into<String>,
        test_id: impl Into<String>,
        agent_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            patch_id: patch_id.into(),
            test_id: test_id.into(),
            agent_id: agent_id.into(),
            content: content.into(),
            status: PatchStatus::Pending,
        }
    }

    pub fn transition(&mut self, next: PatchStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_transition(self.status, next));
        }
        self.status = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Agent state, heartbeats, resume requests
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Initializing,
    Idle,
    Busy,
    Resuming,
    Error,
    Shutdown,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Resuming => write!(f, "resuming"),
            Self::Error => write!(f, "error"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl FromStr for AgentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "resuming" => Ok(Self::Resuming),
            "error" => Ok(Self::Error),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(Error::validation(vec![format!("unknown agent status '{other}'")])),
        }
    }
}

/// Contents of `<agent_id>.json` in the state directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub status: AgentStatus,
    pub last_update: String,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl AgentState {
    pub fn new(status: AgentStatus) -> Self {
        Self {
            status,
            last_update: now_rfc3339(),
            context: Map::new(),
        }
    }

    pub fn set_status(&mut self, status: AgentStatus) {
        self.status = status;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_update = now_rfc3339();
    }
}

/// Written by the monitored worker; read-only for the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub agent_id: String,
    #[serde(deserialize_with = "deserialize_lenient_utc")]
    pub last_active: DateTime<Utc>,
}

/// RFC 3339, or a timestamp without offset (`2024-05-01T10:00:00.123456`)
/// taken as UTC. Workers in other languages often write the latter.
pub fn parse_lenient_utc(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ]
    .iter()
    .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
    .map(|naive| Utc.from_utc_datetime(&naive))
}

fn deserialize_lenient_utc<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_lenient_utc(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
}

impl HeartbeatRecord {
    pub fn new(agent_id: impl Into<String>, last_active: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.into(),
            last_active,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_active
    }

    /// Strictly older than the threshold. An age exactly equal to it is still fresh.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) > threshold
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub agent_id: String,
    pub timestamp: String,
    pub context: Map<String, Value>,
}

impl ResumeRequest {
    pub fn new(agent_id: impl Into<String>, context: Map<String, Value>) -> Self {
        Self {
            agent_id: agent_id.into(),
            timestamp: now_rfc3339(),
            context,
        }
    }
}

// ---------------------------------------------------------------------------
// Completion and processing modes
// ---------------------------------------------------------------------------

/// Which evidence source fired. Informational only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMethod {
    Outbox,
    Visual,
    None,
}

impl std::fmt::Display for CompletionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Outbox => write!(f, "outbox"),
            Self::Visual => write!(f, "visual"),
            Self::None => write!(f, "none"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessingMode {
    Core,
    Bridge,
    Debug,
    Production,
}

impl ProcessingMode {
    pub const ALL: [ProcessingMode; 4] = [Self::Core, Self::Bridge, Self::Debug, Self::Production];
}

impl std::fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Core => write!(f, "CORE"),
            Self::Bridge => write!(f, "BRIDGE"),
            Self::Debug => write!(f, "DEBUG"),
            Self::Production => write!(f, "PRODUCTION"),
        }
    }
}

impl FromStr for ProcessingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CORE" => Ok(Self::Core),
            "BRIDGE" => Ok(Self::Bridge),
            "DEBUG" => Ok(Self::Debug),
            "PRODUCTION" => Ok(Self::Production),
            _ => Err(Error::config(format!(
                "unknown processing mode '{s}' (expected CORE, BRIDGE, DEBUG or PRODUCTION)"
            ))),
        }
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}
