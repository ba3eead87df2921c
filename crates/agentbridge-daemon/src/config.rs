//! Bridge daemon configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use agentbridge_core::{Error, ProcessingMode, Result};

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Directory layout of the file exchange.
    pub paths: PathsConfig,
    /// Main loop parameters.
    pub daemon: DaemonConfig,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
    /// Completion detection for relayed prompts.
    pub completion: CompletionConfig,
    /// Liveness monitoring.
    pub heartbeat: HeartbeatConfig,
}

/// Paths are resolved against `root` unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub root: PathBuf,
    pub mailbox: PathBuf,
    pub archive: PathBuf,
    pub failed: PathBuf,
    pub validated: PathBuf,
    pub outbox: PathBuf,
    pub state: PathBuf,
    pub heartbeats: PathBuf,
    pub resume: PathBuf,
    pub captures: PathBuf,
    pub patches: PathBuf,
    pub memory_file: PathBuf,
    /// Glob for artifact files inside the mailbox.
    pub mailbox_pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// CORE, BRIDGE, DEBUG or PRODUCTION. Checked when the daemon is built.
    pub mode: String,
    /// Idle sleep between mailbox scans, in milliseconds.
    pub poll_interval_ms: u64,
    /// Artifacts processed concurrently.
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// One backoff unit; attempt n sleeps `base_delay_ms * 2^(n-1)`.
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Identical consecutive samples required for "stable".
    pub stability_samples: u32,
    pub sample_interval_ms: u64,
    pub timeout_secs: u64,
    /// Only the tail of the capture is hashed.
    pub max_sample_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub check_interval_secs: u64,
    pub stale_threshold_secs: u64,
}

// ============================================================
// Defaults
// ============================================================

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            mailbox: "mailbox".into(),
            archive: "archive".into(),
            failed: "failed".into(),
            validated: "validated".into(),
            outbox: "outbox".into(),
            state: "state".into(),
            heartbeats: "heartbeats".into(),
            resume: "resume".into(),
            captures: "captures".into(),
            patches: "patches".into(),
            memory_file: "memory.json".into(),
            mailbox_pattern: "*.json".into(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self { mode: "CORE".into(), poll_interval_ms: 500, max_concurrent: 3 }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3, base_delay_ms: 1_000 }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self { stability_samples: 3, sample_interval_ms: 1_000, timeout_secs: 300, max_sample_bytes: 4_096 }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { check_interval_secs: 30, stale_threshold_secs: 300 }
    }
}

// ============================================================
// Loading
// ============================================================

impl BridgeConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {} - using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {} - using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Defaults rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.paths.root = root.into();
        config
    }

    pub fn mode(&self) -> Result<ProcessingMode> {
        self.daemon.mode.parse()
    }

    /// Reject values that would make a component meaningless.
    pub fn validate(&self) -> Result<()> {
        self.mode()?;
        if self.daemon.max_concurrent == 0 {
            return Err(Error::config("daemon.max_concurrent must be at least 1"));
        }
        if self.completion.stability_samples == 0 {
            return Err(Error::config("completion.stability_samples must be at least 1"));
        }
        if self.heartbeat.check_interval_secs == 0 {
            return Err(Error::config("heartbeat.check_interval_secs must be at least 1"));
        }
        Ok(())
    }
}

impl PathsConfig {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl CompletionConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl HeartbeatConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_threshold_secs as i64)
    }
}
