//! The daemon loop: mailbox in, archive or dead-letter out.
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//! ```
//!
//! Each new artifact runs in its own task holding one resource slot. The
//! fingerprint is recorded on every terminal outcome (archived or
//! dead-lettered) and never for an artifact interrupted by `stop()`, which
//! stays in the mailbox for the next run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agentbridge_core::{
    fingerprint_content, now_rfc3339, AgentStatus, ProcessingMode, ResponseArtifact, Result,
};
use dashmap::DashSet;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent_state::{AgentStateStore, ResumeController};
use crate::config::BridgeConfig;
use crate::heartbeat::HeartbeatMonitor;
use crate::layout::{write_json_atomic, BridgeLayout};
use crate::memory::MemoryTracker;
use crate::patch::{FsPatchBackend, PatchBackend};
use crate::processor::{ProcessorContext, ProcessorFactory, ResponseProcessor};
use crate::resources::ResourceManager;
use crate::retry::ErrorHandler;
use crate::validation::{is_plain_name, ValidationEngine};
use crate::watcher::{Candidate, MailboxWatcher};

/// Agent id passed to processors when the artifact names none.
pub const UNKNOWN_AGENT: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStats {
    pub processed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub retries: u64,
}

#[derive(Default)]
struct StatsCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    retries: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> DaemonStats {
        DaemonStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Sidecar written next to a dead-lettered artifact.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub file: String,
    pub fingerprint: String,
    pub error: String,
    pub kind: String,
    pub attempts: u32,
    pub failed_at: String,
}

/// What processing one artifact produced, before it is filed.
struct Outcome {
    result: Result<()>,
    attempts: u32,
    agent_id: Option<String>,
}

/// Everything one run of the loop shares with its artifact tasks.
struct Pipeline {
    layout: BridgeLayout,
    processor: Box<dyn ResponseProcessor>,
    memory: Mutex<MemoryTracker>,
    resources: ResourceManager,
    retry: ErrorHandler,
    store: Arc<AgentStateStore>,
    watcher: MailboxWatcher,
    in_flight_fingerprints: DashSet<String>,
    stats: Arc<StatsCounters>,
    cancel: CancellationToken,
}

struct RunHandles {
    cancel: CancellationToken,
    main_loop: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

pub struct Daemon {
    config: BridgeConfig,
    mode: ProcessingMode,
    layout: BridgeLayout,
    backend: Arc<dyn PatchBackend>,
    store: Arc<AgentStateStore>,
    stats: Arc<StatsCounters>,
    state: std::sync::Mutex<DaemonState>,
    run: Mutex<Option<RunHandles>>,
}

impl Daemon {
    /// A daemon staging patches on the filesystem.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let layout = BridgeLayout::from_config(&config.paths);
        let backend = Arc::new(FsPatchBackend::new(&layout.patches, &layout.validated));
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: BridgeConfig, backend: Arc<dyn PatchBackend>) -> Result<Self> {
        config.validate()?;
        let mode = config.mode()?;
        let layout = BridgeLayout::from_config(&config.paths);
        let store = Arc::new(AgentStateStore::new(layout.clone()));
        Ok(Self {
            config,
            mode,
            layout,
            backend,
            store,
            stats: Arc::new(StatsCounters::default()),
            state: std::sync::Mutex::new(DaemonState::Stopped),
            run: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    pub fn layout(&self) -> &BridgeLayout {
        &self.layout
    }

    pub fn agent_states(&self) -> &Arc<AgentStateStore> {
        &self.store
    }

    pub fn state(&self) -> DaemonState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> DaemonStats {
        self.stats.snapshot()
    }

    fn set_state(&self, next: DaemonState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Move `from -> to` atomically. False if the daemon was elsewhere.
    fn transition(&self, from: DaemonState, to: DaemonState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    /// Start the main loop and the heartbeat monitor. A no-op with a warning
    /// unless the daemon is stopped.
    pub async fn start(&self) -> Result<()> {
        if !self.transition(DaemonState::Stopped, DaemonState::Starting) {
            warn!(state = %self.state(), "start() ignored, daemon is not stopped");
            return Ok(());
        }

        match self.spawn_run().await {
            Ok(handles) => {
                *self.run.lock().await = Some(handles);
                self.set_state(DaemonState::Running);
                info!(
                    mode = %self.mode,
                    root = %self.layout.root.display(),
                    max_concurrent = self.config.daemon.max_concurrent,
                    "Daemon running"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(DaemonState::Stopped);
                error!(error = %e, "Daemon failed to start");
                Err(e)
            }
        }
    }

    async fn spawn_run(&self) -> Result<RunHandles> {
        self.layout.ensure_dirs().await?;
        let memory = MemoryTracker::load(&self.layout.memory_file).await?;
        let cancel = CancellationToken::new();

        let engine = Arc::new(ValidationEngine::with_defaults(self.backend.clone()));
        let factory = ProcessorFactory::new(ProcessorContext::new(
            engine,
            self.layout.clone(),
            self.config.completion.clone(),
        ));

        let pipeline = Arc::new(Pipeline {
            layout: self.layout.clone(),
            processor: factory.create(self.mode),
            memory: Mutex::new(memory),
            resources: ResourceManager::new(self.config.daemon.max_concurrent)?,
            retry: ErrorHandler::with_cancellation(
                self.config.retry.max_retries,
                self.config.retry.base_delay(),
                cancel.clone(),
            ),
            store: self.store.clone(),
            watcher: MailboxWatcher::new(&self.layout.mailbox, &self.config.paths.mailbox_pattern)?,
            in_flight_fingerprints: DashSet::new(),
            stats: self.stats.clone(),
            cancel: cancel.clone(),
        });

        let monitor = Arc::new(HeartbeatMonitor::new(
            ResumeController::new(self.store.clone()),
            self.config.heartbeat.check_interval(),
            self.config.heartbeat.stale_threshold(),
        ));

        let poll = self.config.daemon.poll_interval();
        Ok(RunHandles {
            main_loop: tokio::spawn(run_loop(pipeline, poll)),
            monitor: tokio::spawn(monitor.run(cancel.clone())),
            cancel,
        })
    }

    /// Cancel the loop, the monitor and every in-flight artifact, and wait
    /// for all of them. A no-op when already stopped.
    pub async fn stop(&self) {
        if !self.transition(DaemonState::Running, DaemonState::Stopping) {
            match self.state() {
                DaemonState::Stopped => debug!("stop() on a stopped daemon"),
                other => warn!(state = %other, "stop() ignored while {}", other),
            }
            return;
        }

        if let Some(run) = self.run.lock().await.take() {
            run.cancel.cancel();
            if let Err(e) = run.main_loop.await {
                log_join_error("main loop", e);
            }
            if let Err(e) = run.monitor.await {
                log_join_error("heartbeat monitor", e);
            }
        }
        self.set_state(DaemonState::Stopped);
        info!(stats = ?self.stats(), "Daemon stopped");
    }
}

fn log_join_error(what: &str, e: JoinError) {
    if e.is_panic() {
        error!("{} panicked: {}", what, e);
    } else {
        debug!("{} cancelled", what);
    }
}

async fn run_loop(p: Arc<Pipeline>, poll: std::time::Duration) {
    let mut tasks: JoinSet<()> = JoinSet::new();

    'outer: loop {
        match p.watcher.scan().await {
            Ok(candidates) => {
                for candidate in candidates {
                    if p.cancel.is_cancelled() {
                        break 'outer;
                    }
                    dispatch(&p, &mut tasks, candidate).await;
                }
            }
            Err(e) => warn!(error = %e, dir = %p.watcher.dir().display(), "Mailbox scan failed"),
        }

        let idle = tokio::time::sleep(poll);
        tokio::pin!(idle);
        loop {
            tokio::select! {
                _ = &mut idle => break,
                _ = p.cancel.cancelled() => break 'outer,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        log_join_error("artifact task", e);
                    }
                }
            }
        }
    }

    debug!(in_flight = tasks.len(), "Draining artifact tasks");
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            log_join_error("artifact task", e);
        }
    }
}

/// Read, fingerprint and either skip or hand off one candidate.
async fn dispatch(p: &Arc<Pipeline>, tasks: &mut JoinSet<()>, candidate: Candidate) {
    let bytes = match tokio::fs::read(&candidate.path).await {
        Ok(b) => b,
        Err(e) => {
            debug!(file = %candidate.name, error = %e, "Candidate vanished before read");
            return;
        }
    };
    let fingerprint = fingerprint_content(&bytes);

    if p.memory.lock().await.is_processed(&fingerprint) {
        if p.watcher.report_duplicate(&candidate) {
            p.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            info!(file = %candidate.name, fingerprint = %fingerprint, "Skipping already processed artifact");
        }
        return;
    }
    // Same content under another name is already running; look again next scan.
    if !p.in_flight_fingerprints.insert(fingerprint.clone()) {
        return;
    }
    if !p.watcher.claim(&candidate) {
        p.in_flight_fingerprints.remove(&fingerprint);
        return;
    }

    let p = p.clone();
    tasks.spawn(async move {
        handle_artifact(&p, &candidate, &bytes, &fingerprint).await;
        p.watcher.release(&candidate.path);
        p.in_flight_fingerprints.remove(&fingerprint);
    });
}

async fn handle_artifact(p: &Pipeline, candidate: &Candidate, bytes: &[u8], fingerprint: &str) {
    let outcome = tokio::select! {
        _ = p.cancel.cancelled() => None,
        outcome = process(p, candidate, bytes, fingerprint) => outcome,
    };
    match outcome {
        Some(outcome) => finish(p, candidate, fingerprint, outcome).await,
        None => info!(file = %candidate.name, "Interrupted by shutdown, left in mailbox"),
    }
}

/// Acquire a slot and run the processor with retries. `None` when shutdown
/// cut the retries short.
async fn process(p: &Pipeline, candidate: &Candidate, bytes: &[u8], fingerprint: &str) -> Option<Outcome> {
    let _slot = match p.resources.acquire().await {
        Ok(slot) => slot,
        Err(e) => {
            return Some(Outcome {
                result: Err(e),
                attempts: 0,
                agent_id: None,
            })
        }
    };

    let artifact = match ResponseArtifact::from_slice(&candidate.name, bytes) {
        Ok(a) => a,
        Err(e) => {
            return Some(Outcome {
                result: Err(e),
                attempts: 1,
                agent_id: None,
            })
        }
    };
    let agent_id = artifact
        .agent_id()
        .filter(|id| is_plain_name(id))
        .map(str::to_string);

    if let Some(id) = &agent_id {
        if let Err(e) = p.store.set_status(id, AgentStatus::Busy).await {
            warn!(agent_id = %id, error = %e, "Could not mark agent busy");
        }
    }

    let mut attempts = 0;
    loop {
        attempts += 1;
        let result = p
            .processor
            .process_response(&artifact, agent_id.as_deref().unwrap_or(UNKNOWN_AGENT))
            .await;
        match result {
            Ok(()) => {
                return Some(Outcome {
                    result: Ok(()),
                    attempts,
                    agent_id,
                })
            }
            Err(e) => {
                if p.retry.handle_error(&e, fingerprint).await {
                    p.stats.retries.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if p.cancel.is_cancelled() {
                    return None;
                }
                return Some(Outcome {
                    result: Err(e),
                    attempts,
                    agent_id,
                });
            }
        }
    }
}

/// Archive or dead-letter, then record the fingerprint and settle agent state.
///
/// Once the artifact has left the mailbox the outcome is final, so nothing
/// after the move can skip recording it.
async fn finish(p: &Pipeline, candidate: &Candidate, fingerprint: &str, outcome: Outcome) {
    let tag = fingerprint.get(..12).unwrap_or(fingerprint);
    let (filed, next_status) = match &outcome.result {
        Ok(()) => (p.layout.archive(&candidate.path, tag).await, AgentStatus::Idle),
        Err(_) => (p.layout.dead_letter(&candidate.path, tag).await, AgentStatus::Error),
    };
    let dest = match filed {
        Ok(dest) => dest,
        Err(e) => {
            error!(file = %candidate.name, error = %e, "Could not move artifact out of the mailbox");
            return;
        }
    };
    let filed_as = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(&candidate.name)
        .to_string();

    if let Err(e) = &outcome.result {
        let report = FailureReport {
            file: candidate.name.clone(),
            fingerprint: fingerprint.to_string(),
            error: e.to_string(),
            kind: e.kind().to_string(),
            attempts: outcome.attempts,
            failed_at: now_rfc3339(),
        };
        let report_path = failure_report_path(&p.layout, &filed_as);
        if let Err(write_err) = write_json_atomic(&report_path, &report).await {
            error!(file = %candidate.name, path = %report_path.display(), error = %write_err, "Could not write failure report");
        }
    }

    let meta = json!({
        "file": candidate.name,
        "filed_as": filed_as,
        "outcome": if outcome.result.is_ok() { "archived" } else { "failed" },
        "attempts": outcome.attempts,
    });
    if let Err(e) = p.memory.lock().await.track_processing(fingerprint, Some(&meta)).await {
        error!(file = %candidate.name, error = %e, "Could not record fingerprint");
    }

    match &outcome.result {
        Ok(()) => {
            p.stats.processed.fetch_add(1, Ordering::Relaxed);
            info!(file = %candidate.name, dest = %dest.display(), attempts = outcome.attempts, "Artifact processed");
        }
        Err(e) => {
            p.stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(file = %candidate.name, dest = %dest.display(), kind = e.kind(), error = %e, "Artifact dead-lettered");
        }
    }

    if let Some(id) = &outcome.agent_id {
        if let Err(e) = p.store.set_status(id, next_status).await {
            warn!(agent_id = %id, error = %e, "Could not update agent state");
        }
    }
}

/// `failed/<stem>.error.json` for the name an artifact was filed under in `failed/`.
pub fn failure_report_path(layout: &BridgeLayout, file_name: &str) -> PathBuf {
    let stem = std::path::Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    layout.failed.join(format!("{stem}.error.json"))
}
