//! Error types for agentbridge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Schema or type mismatch. The artifact is malformed and never retried.
    #[error("validation failed: {}", .errors.join("; "))]
    Validation { errors: Vec<String> },

    /// Transient failure while processing; eligible for retry.
    #[error("processing failed: {0}")]
    Processing(String),

    #[error("patch {patch_id} failed verification: {reason}")]
    PatchVerification { patch_id: String, reason: String },

    #[error("no completion signal for {agent_id} within {waited_secs}s")]
    CompletionTimeout { agent_id: String, waited_secs: u64 },

    /// Retries exhausted.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(errors: Vec<String>) -> Self {
        Self::Validation { errors }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing(message.into())
    }

    pub fn patch_verification(patch_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PatchVerification {
            patch_id: patch_id.into(),
            reason: reason.into(),
        }
    }

    pub fn completion_timeout(agent_id: impl Into<String>, waited_secs: u64) -> Self {
        Self::CompletionTimeout {
            agent_id: agent_id.into(),
            waited_secs,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Stable snake_case label, used in dead-letter sidecars and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Processing(_) => "processing",
            Self::PatchVerification { .. } => "patch_verification",
            Self::CompletionTimeout { .. } => "completion_timeout",
            Self::Fatal(_) => "fatal",
            Self::Config(_) => "config",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Only transient failures go back through the retry handler.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Processing(_) | Self::Io(_))
    }
}
