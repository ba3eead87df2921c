//! End-to-end tests for the daemon loop against a temporary bridge root.
//!
//! Each test writes artifacts into `mailbox/`, runs the daemon, and checks
//! where the files end up and what was recorded on the way.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentbridge_core::{fingerprint_content, AgentState, AgentStatus, Error, HeartbeatRecord, PatchRecord, Result};
use agentbridge_daemon::config::BridgeConfig;
use agentbridge_daemon::daemon::{failure_report_path, Daemon, DaemonState};
use agentbridge_daemon::layout::BridgeLayout;
use agentbridge_daemon::memory::MemorySnapshot;
use agentbridge_daemon::patch::PatchBackend;
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

// ============================================================
// Helpers
// ============================================================

fn fast_config(root: &Path) -> BridgeConfig {
    let mut config = BridgeConfig::with_root(root);
    config.daemon.poll_interval_ms = 10;
    config.retry.base_delay_ms = 5;
    config.completion.sample_interval_ms = 10;
    config.completion.stability_samples = 2;
    config.completion.timeout_secs = 1;
    config.heartbeat.check_interval_secs = 1;
    config
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn drop_artifact(layout: &BridgeLayout, name: &str, body: &Value) -> Vec<u8> {
    std::fs::create_dir_all(&layout.mailbox).unwrap();
    let bytes = serde_json::to_vec_pretty(body).unwrap();
    std::fs::write(layout.mailbox.join(name), &bytes).unwrap();
    bytes
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn recorded(layout: &BridgeLayout) -> Vec<String> {
    match std::fs::read_to_string(&layout.memory_file) {
        Ok(text) => serde_json::from_str::<MemorySnapshot>(&text).unwrap().hashes,
        Err(_) => Vec::new(),
    }
}

fn prompt(agent: &str, content: &str) -> Value {
    json!({
        "agent_id": agent,
        "type": "prompt",
        "priority": 1,
        "timestamp": "2024-05-01T10:00:00Z",
        "content": content,
    })
}

fn patch(agent: &str, patch_id: &str) -> Value {
    json!({
        "agent_id": agent,
        "type": "patch_submission",
        "timestamp": "2024-05-01T10:00:00Z",
        "patch_id": patch_id,
        "test_id": format!("test-{patch_id}"),
        "content": "--- a/lib.rs\n+++ b/lib.rs\n",
    })
}

/// Fails `apply` a fixed number of times, tracks peak concurrency, always verifies.
#[derive(Default)]
struct FlakyBackend {
    failures_left: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    hold: Duration,
}

impl FlakyBackend {
    fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    fn slow(hold: Duration) -> Self {
        Self {
            hold,
            ..Self::default()
        }
    }
}

#[async_trait]
impl PatchBackend for FlakyBackend {
    async fn apply(&self, _patch: &PatchRecord) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(Error::processing("disk hiccup"));
        }
        Ok(())
    }

    async fn verify(&self, _patch: &PatchRecord) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self, _patch: &PatchRecord) -> Result<()> {
        Ok(())
    }
}

// ============================================================
// Mailbox scenario: dead-letter, record, skip resubmission
// ============================================================

#[tokio::test]
async fn missing_field_is_dead_lettered_and_resubmission_skipped() {
    let tmp = TempDir::new().unwrap();
    let config = fast_config(tmp.path());
    let layout = BridgeLayout::from_config(&config.paths);
    let daemon = Daemon::new(config).unwrap();

    let body = json!({
        "agent_id": "w1",
        "type": "patch_submission",
        "timestamp": "2024-05-01T10:00:00Z",
        "patch_id": "p-77",
        "content": "--- a\n+++ b\n",
    });
    let bytes = drop_artifact(&layout, "resp-1.json", &body);
    let fp = fingerprint_content(&bytes);

    daemon.start().await.unwrap();
    let failed = layout.failed.join("resp-1.json");
    wait_until("dead-letter", || failed.exists()).await;
    let report_path = failure_report_path(&layout, "resp-1.json");
    wait_until("fingerprint", || recorded(&layout).contains(&fp)).await;

    assert!(!layout.mailbox.join("resp-1.json").exists());
    let report = read_json(&report_path);
    assert_eq!(report["kind"], json!("validation"));
    assert_eq!(report["fingerprint"], json!(fp));
    assert_eq!(report["attempts"], json!(1));
    assert!(report["error"].as_str().unwrap().contains("test_id"));

    // Identical resubmission stays where it is.
    drop_artifact(&layout, "resp-1.json", &body);
    wait_until("duplicate noticed", || daemon.stats().duplicates == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(layout.mailbox.join("resp-1.json").exists());
    assert_eq!(daemon.stats().duplicates, 1, "duplicate is reported once");
    assert_eq!(daemon.stats().failed, 1);

    daemon.stop().await;
    let state: AgentState = serde_json::from_value(read_json(&layout.state_file("w1"))).unwrap();
    assert_eq!(state.status, AgentStatus::Error);
}

#[tokio::test]
async fn valid_prompt_is_archived_in_core_mode() {
    let tmp = TempDir::new().unwrap();
    let config = fast_config(tmp.path());
    let layout = BridgeLayout::from_config(&config.paths);
    let daemon = Daemon::new(config).unwrap();
    let bytes = drop_artifact(&layout, "ok.json", &prompt("w2", "summarize the diff"));

    daemon.start().await.unwrap();
    wait_until("archive", || layout.archive.join("ok.json").exists()).await;
    wait_until("processed count", || daemon.stats().processed == 1).await;
    daemon.stop().await;

    assert!(recorded(&layout).contains(&fingerprint_content(&bytes)));
    let state: AgentState = serde_json::from_value(read_json(&layout.state_file("w2"))).unwrap();
    assert_eq!(state.status, AgentStatus::Idle);
    assert!(!layout.outbox_file("w2").exists(), "CORE never relays");
}

#[tokio::test]
async fn non_json_artifact_is_dead_lettered() {
    let tmp = TempDir::new().unwrap();
    let config = fast_config(tmp.path());
    let layout = BridgeLayout::from_config(&config.paths);
    std::fs::create_dir_all(&layout.mailbox).unwrap();
    std::fs::write(layout.mailbox.join("garbage.json"), "not json at all").unwrap();

    let daemon = Daemon::new(config).unwrap();
    daemon.start().await.unwrap();
    wait_until("dead-letter", || failure_report_path(&layout, "garbage.json").exists()).await;
    daemon.stop().await;

    assert!(layout.failed.join("garbage.json").exists());
    assert_eq!(read_json(&failure_report_path(&layout, "garbage.json"))["kind"], json!("validation"));
}

#[tokio::test]
async fn same_name_failures_keep_both_artifacts() {
    let tmp = TempDir::new().unwrap();
    let config = fast_config(tmp.path());
    let layout = BridgeLayout::from_config(&config.paths);
    let daemon = Daemon::new(config).unwrap();
    daemon.start().await.unwrap();

    let first = drop_artifact(&layout, "resp.json", &json!({"agent_id": "w1", "type": "x", "first": 1}));
    wait_until("first dead-letter", || daemon.stats().failed == 1).await;
    let second = drop_artifact(&layout, "resp.json", &json!({"agent_id": "w1", "type": "x", "second": 2}));
    wait_until("second dead-letter", || daemon.stats().failed == 2).await;
    daemon.stop().await;

    let fp1 = fingerprint_content(&first);
    let fp2 = fingerprint_content(&second);
    let renamed = format!("resp-{}.json", &fp2[..12]);

    assert_eq!(read_json(&layout.failed.join("resp.json"))["first"], json!(1));
    assert_eq!(read_json(&layout.failed.join(&renamed))["second"], json!(2));
    assert_eq!(read_json(&failure_report_path(&layout, "resp.json"))["fingerprint"], json!(fp1));
    assert_eq!(read_json(&failure_report_path(&layout, &renamed))["fingerprint"], json!(fp2));
    assert_eq!(read_json(&failure_report_path(&layout, &renamed))["file"], json!("resp.json"));
}

#[tokio::test]
async fn unwritable_failure_report_still_settles_the_artifact() {
    let tmp = TempDir::new().unwrap();
    let config = fast_config(tmp.path());
    let layout = BridgeLayout::from_config(&config.paths);
    // A directory squatting on the sidecar name makes the report write fail.
    std::fs::create_dir_all(failure_report_path(&layout, "side.json")).unwrap();
    let bytes = drop_artifact(&layout, "side.json", &json!({"agent_id": "w6", "type": "prompt"}));

    let daemon = Daemon::new(config).unwrap();
    daemon.start().await.unwrap();
    wait_until("dead-letter", || daemon.stats().failed == 1).await;
    daemon.stop().await;

    assert!(layout.failed.join("side.json").is_file());
    assert!(recorded(&layout).contains(&fingerprint_content(&bytes)));
    let state: AgentState = serde_json::from_value(read_json(&layout.state_file("w6"))).unwrap();
    assert_eq!(state.status, AgentStatus::Error);
}

// ============================================================
// Retries and concurrency
// ============================================================

#[tokio::test]
async fn transient_failures_are_retried_then_archived() {
    let tmp = TempDir::new().unwrap();
    let config = fast_config(tmp.path());
    let layout = BridgeLayout::from_config(&config.paths);
    let daemon = Daemon::with_backend(config, Arc::new(FlakyBackend::failing(2))).unwrap();
    drop_artifact(&layout, "p1.json", &patch("w3", "p1"));

    daemon.start().await.unwrap();
    wait_until("archive", || layout.archive.join("p1.json").exists()).await;
    daemon.stop().await;

    let stats = daemon.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_with_attempt_count() {
    let tmp = TempDir::new().unwrap();
    let mut config = fast_config(tmp.path());
    config.retry.max_retries = 2;
    let layout = BridgeLayout::from_config(&config.paths);
    let daemon = Daemon::with_backend(config, Arc::new(FlakyBackend::failing(100))).unwrap();
    drop_artifact(&layout, "p2.json", &patch("w4", "p2"));

    daemon.start().await.unwrap();
    let report_path = failure_report_path(&layout, "p2.json");
    wait_until("dead-letter", || report_path.exists()).await;
    daemon.stop().await;

    let report = read_json(&report_path);
    assert_eq!(report["kind"], json!("processing"));
    assert_eq!(report["attempts"], json!(3));
    assert_eq!(daemon.stats().retries, 2);
}

#[tokio::test]
async fn concurrency_never_exceeds_max() {
    let tmp = TempDir::new().unwrap();
    let mut config = fast_config(tmp.path());
    config.daemon.max_concurrent = 2;
    let layout = BridgeLayout::from_config(&config.paths);
    let backend = Arc::new(FlakyBackend::slow(Duration::from_millis(60)));
    let daemon = Daemon::with_backend(config, backend.clone()).unwrap();
    for i in 0..5 {
        drop_artifact(&layout, &format!("p{i}.json"), &patch("w5", &format!("c{i}")));
    }

    daemon.start().await.unwrap();
    wait_until("all archived", || daemon.stats().processed == 5).await;
    daemon.stop().await;

    assert!(backend.peak.load(Ordering::SeqCst) <= 2);
    assert!(backend.peak.load(Ordering::SeqCst) >= 1);
}

// ============================================================
// BRIDGE mode and completion
// ============================================================

#[tokio::test]
async fn bridge_completes_when_capture_settles() {
    let tmp = TempDir::new().unwrap();
    let mut config = fast_config(tmp.path());
    config.daemon.mode = "BRIDGE".into();
    let layout = BridgeLayout::from_config(&config.paths);
    std::fs::create_dir_all(&layout.captures).unwrap();
    std::fs::write(layout.capture_file("w6"), "...done, waiting for input").unwrap();
    drop_artifact(&layout, "ask.json", &prompt("w6", "run the tests"));

    let daemon = Daemon::new(config).unwrap();
    daemon.start().await.unwrap();
    wait_until("archive", || layout.archive.join("ask.json").exists()).await;
    daemon.stop().await;

    let outbox = read_json(&layout.outbox_file("w6"));
    assert_eq!(outbox["status"], json!("pending"));
    assert_eq!(outbox["content"], json!("run the tests"));
    assert_eq!(outbox["source"], json!("ask.json"));
}

#[tokio::test]
async fn bridge_completes_on_outbox_status() {
    let tmp = TempDir::new().unwrap();
    let mut config = fast_config(tmp.path());
    config.daemon.mode = "BRIDGE".into();
    config.completion.timeout_secs = 5;
    let layout = BridgeLayout::from_config(&config.paths);
    drop_artifact(&layout, "ask.json", &prompt("w7", "explain"));

    let daemon = Daemon::new(config).unwrap();
    daemon.start().await.unwrap();
    let outbox = layout.outbox_file("w7");
    wait_until("relay", || outbox.exists()).await;
    assert!(layout.mailbox.join("ask.json").exists(), "still in flight");

    let mut entry = read_json(&outbox);
    entry["status"] = json!("complete");
    std::fs::write(&outbox, entry.to_string()).unwrap();

    wait_until("archive", || layout.archive.join("ask.json").exists()).await;
    daemon.stop().await;
    assert_eq!(daemon.stats().processed, 1);
}

#[tokio::test]
async fn bridge_timeout_is_dead_lettered() {
    let tmp = TempDir::new().unwrap();
    let mut config = fast_config(tmp.path());
    config.daemon.mode = "BRIDGE".into();
    let layout = BridgeLayout::from_config(&config.paths);
    drop_artifact(&layout, "slow.json", &prompt("w8", "think hard"));

    let daemon = Daemon::new(config).unwrap();
    daemon.start().await.unwrap();
    let report_path = failure_report_path(&layout, "slow.json");
    wait_until("dead-letter", || report_path.exists()).await;
    daemon.stop().await;

    assert_eq!(read_json(&report_path)["kind"], json!("completion_timeout"));
    assert_eq!(daemon.stats().retries, 0, "timeouts are not retried");
}

// ============================================================
// Shutdown
// ============================================================

#[tokio::test]
async fn stop_leaves_interrupted_artifact_in_mailbox() {
    let tmp = TempDir::new().unwrap();
    let mut config = fast_config(tmp.path());
    config.daemon.mode = "BRIDGE".into();
    config.completion.timeout_secs = 300;
    let layout = BridgeLayout::from_config(&config.paths);
    let bytes = drop_artifact(&layout, "long.json", &prompt("w9", "refactor everything"));

    let daemon = Daemon::new(config).unwrap();
    daemon.start().await.unwrap();
    wait_until("relay", || layout.outbox_file("w9").exists()).await;

    tokio::time::timeout(Duration::from_secs(2), daemon.stop())
        .await
        .expect("stop returns promptly");
    assert_eq!(daemon.state(), DaemonState::Stopped);
    assert!(layout.mailbox.join("long.json").exists());
    assert!(!recorded(&layout).contains(&fingerprint_content(&bytes)));
    assert_eq!(daemon.stats().failed, 0);
}

// ============================================================
// Heartbeats
// ============================================================

#[tokio::test]
async fn stale_agent_is_resumed_by_running_daemon() {
    let tmp = TempDir::new().unwrap();
    let config = fast_config(tmp.path());
    let layout = BridgeLayout::from_config(&config.paths);
    layout.ensure_dirs().await.unwrap();

    let mut state = AgentState::new(AgentStatus::Busy);
    state.context.insert("ticket".into(), json!("BR-12"));
    std::fs::write(layout.state_file("w10"), serde_json::to_string(&state).unwrap()).unwrap();
    let stale = HeartbeatRecord::new("w10", chrono::Utc::now() - chrono::Duration::hours(1));
    std::fs::write(layout.heartbeat_file("w10"), serde_json::to_string(&stale).unwrap()).unwrap();

    let daemon = Daemon::new(config).unwrap();
    daemon.start().await.unwrap();
    wait_until("resume request", || layout.resume_file("w10").exists()).await;
    daemon.stop().await;

    let request = read_json(&layout.resume_file("w10"));
    assert_eq!(request["agent_id"], json!("w10"));
    assert_eq!(request["context"]["ticket"], json!("BR-12"));
    let state: AgentState = serde_json::from_value(read_json(&layout.state_file("w10"))).unwrap();
    assert_eq!(state.status, AgentStatus::Resuming);
}
