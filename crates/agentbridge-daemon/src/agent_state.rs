//! Agent state files and the resume contract.
//!
//! Every write to `state/<agent_id>.json` goes through [`AgentStateStore`],
//! which serializes read-modify-write cycles behind one async mutex.

use std::sync::Arc;

use agentbridge_core::{AgentState, AgentStatus, ResumeRequest, Result};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::layout::{list_json_stems, read_json, write_json_atomic, BridgeLayout};
use crate::validation::validate_agent_state_value;

pub struct AgentStateStore {
    layout: BridgeLayout,
    write_lock: Mutex<()>,
}

impl AgentStateStore {
    pub fn new(layout: BridgeLayout) -> Self {
        Self {
            layout,
            write_lock: Mutex::new(()),
        }
    }

    pub fn layout(&self) -> &BridgeLayout {
        &self.layout
    }

    pub async fn load(&self, agent_id: &str) -> Result<Option<AgentState>> {
        read_json(&self.layout.state_file(agent_id)).await
    }

    async fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Caller must hold the write lock.
    async fn load_or_init_locked(&self, agent_id: &str) -> Result<AgentState> {
        if let Some(state) = self.load(agent_id).await? {
            return Ok(state);
        }
        let state = AgentState::new(AgentStatus::Initializing);
        write_json_atomic(&self.layout.state_file(agent_id), &state).await?;
        info!(agent_id, "Created agent state");
        Ok(state)
    }

    /// Existing state, or a fresh `initializing` one written to disk.
    pub async fn load_or_init(&self, agent_id: &str) -> Result<AgentState> {
        let _guard = self.lock().await;
        self.load_or_init_locked(agent_id).await
    }

    pub async fn save(&self, agent_id: &str, state: &AgentState) -> Result<()> {
        let _guard = self.lock().await;
        write_json_atomic(&self.layout.state_file(agent_id), state).await
    }

    /// Set `status` and bump `last_update`, creating the file if needed.
    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<AgentState> {
        let _guard = self.lock().await;
        let mut state = self.load_or_init_locked(agent_id).await?;
        let previous = state.status;
        state.set_status(status);
        write_json_atomic(&self.layout.state_file(agent_id), &state).await?;
        debug!(agent_id, from = %previous, to = %status, "Agent status changed");
        Ok(state)
    }

    /// True when the state file exists and has well-typed `status`,
    /// `last_update` and `context`.
    pub async fn validate_agent_state(&self, agent_id: &str) -> bool {
        match read_json::<Value>(&self.layout.state_file(agent_id)).await {
            Ok(Some(value)) => {
                let result = validate_agent_state_value(&value);
                if !result.is_valid {
                    warn!(agent_id, errors = ?result.errors, "Invalid agent state");
                }
                result.is_valid
            }
            Ok(None) => false,
            Err(e) => {
                warn!(agent_id, error = %e, "Unreadable agent state");
                false
            }
        }
    }

    /// Agent ids with a state file, sorted.
    pub async fn list_agents(&self) -> Result<Vec<String>> {
        list_json_stems(&self.layout.state).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Status moved to `resuming` and a resume request was written.
    Resumed,
    /// Already `resuming`; nothing written.
    AlreadyResuming,
    /// Missing or malformed state file.
    InvalidState,
    /// Agents that were shut down are never resumed.
    ShutDown,
}

impl std::fmt::Display for ResumeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resumed => write!(f, "resumed"),
            Self::AlreadyResuming => write!(f, "already_resuming"),
            Self::InvalidState => write!(f, "invalid_state"),
            Self::ShutDown => write!(f, "shut_down"),
        }
    }
}

#[derive(Clone)]
pub struct ResumeController {
    store: Arc<AgentStateStore>,
}

impl ResumeController {
    pub fn new(store: Arc<AgentStateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<AgentStateStore> {
        &self.store
    }

    /// Transition to `resuming` and emit `resume/<agent_id>.json` with a
    /// snapshot of the agent's context. Idempotent while resuming.
    pub async fn resume_agent(&self, agent_id: &str) -> Result<ResumeOutcome> {
        let _guard = self.store.lock().await;

        if !self.store.validate_agent_state(agent_id).await {
            return Ok(ResumeOutcome::InvalidState);
        }
        let Some(mut state) = self.store.load(agent_id).await? else {
            return Ok(ResumeOutcome::InvalidState);
        };

        match state.status {
            AgentStatus::Resuming => {
                debug!(agent_id, "Resume already in progress");
                return Ok(ResumeOutcome::AlreadyResuming);
            }
            AgentStatus::Shutdown => {
                debug!(agent_id, "Not resuming a shut down agent");
                return Ok(ResumeOutcome::ShutDown);
            }
            _ => {}
        }

        let layout = self.store.layout();
        let request = ResumeRequest::new(agent_id, state.context.clone());
        write_json_atomic(&layout.resume_file(agent_id), &request).await?;

        let previous = state.status;
        state.set_status(AgentStatus::Resuming);
        write_json_atomic(&layout.state_file(agent_id), &state).await?;

        info!(agent_id, from = %previous, "Agent resuming");
        Ok(ResumeOutcome::Resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<AgentStateStore>) {
        let tmp = TempDir::new().unwrap();
        let layout = BridgeLayout::under(tmp.path());
        layout.ensure_dirs().await.unwrap();
        (tmp, Arc::new(AgentStateStore::new(layout)))
    }

    #[tokio::test]
    async fn missing_state_is_initialized() {
        let (_tmp, store) = setup().await;
        assert!(store.load("w1").await.unwrap().is_none());
        let state = store.load_or_init("w1").await.unwrap();
        assert_eq!(state.status, AgentStatus::Initializing);
        assert!(state.context.is_empty());
        assert!(store.validate_agent_state("w1").await);
        assert_eq!(store.list_agents().await.unwrap(), vec!["w1"]);
    }

    #[tokio::test]
    async fn set_status_keeps_context() {
        let (_tmp, store) = setup().await;
        let mut state = AgentState::new(AgentStatus::Idle);
        state.context.insert("task".into(), json!("T-7"));
        store.save("w1", &state).await.unwrap();

        let updated = store.set_status("w1", AgentStatus::Busy).await.unwrap();
        assert_eq!(updated.status, AgentStatus::Busy);
        assert_eq!(updated.context["task"], json!("T-7"));
    }

    #[tokio::test]
    async fn malformed_state_fails_validation() {
        let (_tmp, store) = setup().await;
        let path = store.layout().state_file("w1");
        std::fs::write(&path, r#"{"status":"idle","last_update":"x"}"#).unwrap();
        assert!(!store.validate_agent_state("w1").await);
        std::fs::write(&path, r#"{"status":"idle","last_update":"x","context":[]}"#).unwrap();
        assert!(!store.validate_agent_state("w1").await);
        std::fs::write(&path, "not json").unwrap();
        assert!(!store.validate_agent_state("w1").await);
        assert!(!store.validate_agent_state("nobody").await);
    }

    #[tokio::test]
    async fn resume_writes_request_once() {
        let (_tmp, store) = setup().await;
        let mut state = AgentState::new(AgentStatus::Busy);
        state.context.insert("step".into(), json!(4));
        store.save("w1", &state).await.unwrap();

        let ctl = ResumeController::new(store.clone());
        assert_eq!(ctl.resume_agent("w1").await.unwrap(), ResumeOutcome::Resumed);

        let resume_path = store.layout().resume_file("w1");
        let request: ResumeRequest = read_json(&resume_path).await.unwrap().unwrap();
        assert_eq!(request.agent_id, "w1");
        assert_eq!(request.context["step"], json!(4));
        let written = std::fs::metadata(&resume_path).unwrap().modified().unwrap();

        assert_eq!(ctl.resume_agent("w1").await.unwrap(), ResumeOutcome::AlreadyResuming);
        assert_eq!(std::fs::metadata(&resume_path).unwrap().modified().unwrap(), written);
        assert_eq!(store.load("w1").await.unwrap().unwrap().status, AgentStatus::Resuming);
    }

    #[tokio::test]
    async fn shutdown_and_invalid_agents_are_not_resumed() {
        let (_tmp, store) = setup().await;
        store.save("down", &AgentState::new(AgentStatus::Shutdown)).await.unwrap();
        let ctl = ResumeController::new(store.clone());

        assert_eq!(ctl.resume_agent("down").await.unwrap(), ResumeOutcome::ShutDown);
        assert_eq!(ctl.resume_agent("ghost").await.unwrap(), ResumeOutcome::InvalidState);
        assert!(!store.layout().resume_file("down").exists());
        assert!(!store.layout().resume_file("ghost").exists());
    }
}
