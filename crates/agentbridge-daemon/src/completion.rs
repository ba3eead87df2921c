//! Hybrid completion detection for relayed prompts.
//!
//! Two independent evidence sources, OR-combined:
//! - explicit: the status source reads `complete`
//! - stability: the content fingerprint is identical for N consecutive samples
//!
//! One differing sample resets the stability streak to zero.

use std::path::PathBuf;
use std::time::Duration;

use agentbridge_core::{fingerprint_bytes, CompletionMethod, Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, info};

pub const COMPLETE: &str = "complete";

/// Where the explicit "done" flag comes from.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn status(&self) -> Result<Option<String>>;
}

/// Where stability samples come from. `None` means nothing to sample yet.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn sample(&self) -> Result<Option<Vec<u8>>>;
}

/// Reads `status` from a JSON file, or the whole file as plain text.
pub struct FileStatusSource {
    path: PathBuf,
}

impl FileStatusSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StatusSource for FileStatusSource {
    async fn status(&self) -> Result<Option<String>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let status = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(obj)) => obj.get("status").and_then(Value::as_str).map(str::to_string),
            _ => Some(text.trim().to_string()),
        };
        Ok(status)
    }
}

/// Samples the last `max_bytes` of a capture file.
pub struct FileContentSource {
    path: PathBuf,
    max_bytes: usize,
}

impl FileContentSource {
    pub fn new(path: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
        }
    }
}

#[async_trait]
impl ContentSource for FileContentSource {
    async fn sample(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path).await {
            Ok(bytes) => {
                let start = bytes.len().saturating_sub(self.max_bytes);
                Ok(Some(bytes[start..].to_vec()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Counts consecutive identical fingerprints.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    required: u32,
    last: Option<String>,
    streak: u32,
}

impl StabilityTracker {
    /// `required` identical samples in a row mean stable. Zero is treated as one.
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            last: None,
            streak: 0,
        }
    }

    /// Feed one sample fingerprint; true once the last `required` samples match.
    pub fn observe(&mut self, fingerprint: &str) -> bool {
        match &self.last {
            Some(prev) if prev == fingerprint => self.streak += 1,
            _ => {
                self.streak = 0;
                self.last = Some(fingerprint.to_string());
            }
        }
        self.is_stable()
    }

    /// Repeats of the current sample after its first occurrence.
    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn is_stable(&self) -> bool {
        self.last.is_some() && self.streak + 1 >= self.required
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.streak = 0;
    }
}

pub struct CompletionDetector {
    status: Box<dyn StatusSource>,
    content: Box<dyn ContentSource>,
    stability: StabilityTracker,
    interval: Duration,
}

impl CompletionDetector {
    pub fn new(
        status: impl StatusSource + 'static,
        content: impl ContentSource + 'static,
        stability_samples: u32,
        interval: Duration,
    ) -> Self {
        Self {
            status: Box::new(status),
            content: Box::new(content),
            stability: StabilityTracker::new(stability_samples),
            interval,
        }
    }

    /// One poll of both sources. Source errors count as "no evidence".
    pub async fn check(&mut self) -> (bool, CompletionMethod) {
        match self.status.status().await {
            Ok(Some(status)) if status.eq_ignore_ascii_case(COMPLETE) => {
                return (true, CompletionMethod::Outbox);
            }
            Ok(_) => {}
            Err(e) => debug!("Status source unreadable: {}", e),
        }

        match self.content.sample().await {
            Ok(Some(bytes)) => {
                if self.stability.observe(&fingerprint_bytes(&bytes)) {
                    return (true, CompletionMethod::Visual);
                }
            }
            Ok(None) => {}
            Err(e) => debug!("Content source unreadable: {}", e),
        }

        (false, CompletionMethod::None)
    }

    /// Poll once per interval until a source fires or `timeout` elapses.
    pub async fn wait_for_completion(&mut self, agent_id: &str, timeout: Duration) -> Result<CompletionMethod> {
        let poll = async {
            loop {
                let (done, method) = self.check().await;
                if done {
                    return method;
                }
                tokio::time::sleep(self.interval).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(method) => {
                info!(agent_id, %method, "Completion detected");
                Ok(method)
            }
            Err(_) => Err(Error::completion_timeout(agent_id, timeout.as_secs())),
        }
    }

    pub fn stability(&self) -> &StabilityTracker {
        &self.stability
    }
}
