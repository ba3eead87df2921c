//! Mode-specific artifact processors.
//!
//! | Mode       | Validation          | Patch lifecycle | Relay + completion |
//! |------------|---------------------|-----------------|--------------------|
//! | CORE       | errors only         | yes             | no                 |
//! | BRIDGE     | errors only         | no              | yes                |
//! | DEBUG      | errors only, logged | no              | no                 |
//! | PRODUCTION | warnings are errors | yes             | yes (non-patch)    |

use std::sync::Arc;

use agentbridge_core::{now_rfc3339, Error, ProcessingMode, ResponseArtifact, Result, ValidationResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::completion::{CompletionDetector, FileContentSource, FileStatusSource};
use crate::config::CompletionConfig;
use crate::layout::{write_json_atomic, BridgeLayout};
use crate::validation::{ValidationEngine, PATCH_SUBMISSION};

/// Status of a freshly relayed outbox entry.
pub const OUTBOX_PENDING: &str = "pending";

#[async_trait]
pub trait ResponseProcessor: Send + Sync {
    fn mode(&self) -> ProcessingMode;

    async fn process_response(&self, artifact: &ResponseArtifact, agent_id: &str) -> Result<()>;
}

/// Everything a processor may touch.
#[derive(Clone)]
pub struct ProcessorContext {
    pub engine: Arc<ValidationEngine>,
    pub layout: BridgeLayout,
    pub completion: CompletionConfig,
    /// One outbox file per agent, so one relay per agent at a time.
    relay_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ProcessorContext {
    pub fn new(engine: Arc<ValidationEngine>, layout: BridgeLayout, completion: CompletionConfig) -> Self {
        Self {
            engine,
            layout,
            completion,
            relay_locks: Arc::new(DashMap::new()),
        }
    }

    fn relay_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        self.relay_locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
    fn validate(&self, artifact: &ResponseArtifact, strict: bool) -> Result<ValidationResult> {
        let result = self.engine.validate(artifact);
        for warning in &result.warnings {
            debug!(artifact = artifact.name(), %warning, "Validation warning");
        }
        result.into_result(strict)
    }

    /// validate -> apply -> verify. Verification failures arrive already rolled back.
    async fn run_patch_lifecycle(&self, artifact: &ResponseArtifact, agent_id: &str) -> Result<()> {
        let patch_id = artifact.get_str("patch_id").unwrap_or_default();
        let test_id = artifact.get_str("test_id").unwrap_or_default();
        let content = artifact.get_str("content").unwrap_or_default();

        let checked = self.engine.validate_patch(patch_id, content, test_id, agent_id);
        if !checked.is_valid {
            return Err(Error::validation(checked.errors));
        }
        self.engine.apply_patch(patch_id, test_id).await?;
        self.engine.verify_patch(patch_id, test_id).await
    }

    /// Write `outbox/agent-<id>.json` with status `pending` and wait until the
    /// agent marks it complete or its output settles. Relays to the same agent
    /// queue behind each other for the whole write-and-wait.
    async fn relay_and_wait(&self, artifact: &ResponseArtifact, agent_id: &str) -> Result<()> {
        let lock = self.relay_lock(agent_id);
        let _turn = lock.lock().await;

        let outbox = self.layout.outbox_file(agent_id);
        let content = artifact
            .fields()
            .get("content")
            .cloned()
            .unwrap_or_else(|| Value::Object(artifact.payload()));
        let entry = json!({
            "agent_id": agent_id,
            "type": artifact.kind().unwrap_or_default(),
            "content": content,
            "source": artifact.name(),
            "timestamp": now_rfc3339(),
            "status": OUTBOX_PENDING,
        });
        write_json_atomic(&outbox, &entry).await?;
        info!(agent_id, artifact = artifact.name(), "Relayed to outbox");

        let mut detector = CompletionDetector::new(
            FileStatusSource::new(&outbox),
            FileContentSource::new(self.layout.capture_file(agent_id), self.completion.max_sample_bytes),
            self.completion.stability_samples,
            self.completion.sample_interval(),
        );
        detector.wait_for_completion(agent_id, self.completion.timeout()).await?;
        Ok(())
    }
}

pub struct CoreProcessor {
    ctx: ProcessorContext,
}

#[async_trait]
impl ResponseProcessor for CoreProcessor {
    fn mode(&self) -> ProcessingMode {
        ProcessingMode::Core
    }

    async fn process_response(&self, artifact: &ResponseArtifact, agent_id: &str) -> Result<()> {
        self.ctx.validate(artifact, false)?;
        if artifact.kind() == Some(PATCH_SUBMISSION) {
            self.ctx.run_patch_lifecycle(artifact, agent_id).await?;
        }
        Ok(())
    }
}

pub struct BridgeProcessor {
    ctx: ProcessorContext,
}

#[async_trait]
impl ResponseProcessor for BridgeProcessor {
    fn mode(&self) -> ProcessingMode {
        ProcessingMode::Bridge
    }

    async fn process_response(&self, artifact: &ResponseArtifact, agent_id: &str) -> Result<()> {
        self.ctx.validate(artifact, false)?;
        self.ctx.relay_and_wait(artifact, agent_id).await
    }
}

/// Validates and logs. Never touches the filesystem.
pub struct DebugProcessor {
    ctx: ProcessorContext,
}

#[async_trait]
impl ResponseProcessor for DebugProcessor {
    fn mode(&self) -> ProcessingMode {
        ProcessingMode::Debug
    }

    async fn process_response(&self, artifact: &ResponseArtifact, agent_id: &str) -> Result<()> {
        let result = self.ctx.engine.validate(artifact);
        info!(
            agent_id,
            artifact = artifact.name(),
            kind = artifact.kind().unwrap_or("-"),
            valid = result.is_valid,
            errors = ?result.errors,
            warnings = ?result.warnings,
            "Debug inspection"
        );
        result.into_result(false).map(|_| ())
    }
}

pub struct ProductionProcessor {
    ctx: ProcessorContext,
}

#[async_trait]
impl ResponseProcessor for ProductionProcessor {
    fn mode(&self) -> ProcessingMode {
        ProcessingMode::Production
    }

    async fn process_response(&self, artifact: &ResponseArtifact, agent_id: &str) -> Result<()> {
        self.ctx.validate(artifact, true)?;
        if artifact.kind() == Some(PATCH_SUBMISSION) {
            self.ctx.run_patch_lifecycle(artifact, agent_id).await
        } else {
            self.ctx.relay_and_wait(artifact, agent_id).await
        }
    }
}

pub struct ProcessorFactory {
    ctx: ProcessorContext,
}

impl ProcessorFactory {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self { ctx }
    }

    pub fn create(&self, mode: ProcessingMode) -> Box<dyn ResponseProcessor> {
        let ctx = self.ctx.clone();
        match mode {
            ProcessingMode::Core => Box::new(CoreProcessor { ctx }),
            ProcessingMode::Bridge => Box::new(BridgeProcessor { ctx }),
            ProcessingMode::Debug => Box::new(DebugProcessor { ctx }),
            ProcessingMode::Production => Box::new(ProductionProcessor { ctx }),
        }
    }

    /// Unknown mode names are a configuration error.
    pub fn create_from_str(&self, mode: &str) -> Result<Box<dyn ResponseProcessor>> {
        Ok(self.create(mode.parse()?))
    }
}
