//! Operator status report: every known agent with its state and heartbeat.

use std::collections::BTreeSet;
use std::path::PathBuf;

use agentbridge_core::{AgentState, HeartbeatRecord, Result};
use agentbridge_daemon::layout::{list_json_stems, read_json, BridgeLayout};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRow {
    pub agent_id: String,
    /// `None` when the agent has a heartbeat but no state file yet.
    pub status: Option<String>,
    pub last_update: Option<String>,
    pub heartbeat: Option<DateTime<Utc>>,
    pub stale: bool,
}

/// Join state files and heartbeat files by agent id.
pub async fn collect(layout: &BridgeLayout, threshold: chrono::Duration, now: DateTime<Utc>) -> Result<Vec<AgentRow>> {
    let mut ids: BTreeSet<String> = list_json_stems(&layout.state).await?.into_iter().collect();
    ids.extend(list_json_stems(&layout.heartbeats).await?);

    let mut rows = Vec::with_capacity(ids.len());
    for agent_id in ids {
        let (status, last_update) = match read_json::<AgentState>(&layout.state_file(&agent_id)).await {
            Ok(Some(state)) => (Some(state.status.to_string()), Some(state.last_update)),
            Ok(None) => (None, None),
            Err(_) => (Some("invalid".to_string()), None),
        };
        let heartbeat = read_json::<HeartbeatRecord>(&layout.heartbeat_file(&agent_id))
            .await
            .ok()
            .flatten();
        let stale = heartbeat.as_ref().is_some_and(|h| h.is_stale(now, threshold));
        rows.push(AgentRow {
            agent_id,
            status,
            last_update,
            heartbeat: heartbeat.map(|h| h.last_active),
            stale,
        });
    }
    Ok(rows)
}

pub fn render_markdown(rows: &[AgentRow], now: DateTime<Utc>) -> String {
    let mut md = format!("# Agent Status\n\nUpdated: {}\n\n", now.format("%Y-%m-%dT%H:%M:%SZ"));
    md.push_str("| Agent | Status | Last update | Heartbeat | Stale |\n");
    md.push_str("|-------|--------|-------------|-----------|-------|\n");
    for row in rows {
        let heartbeat = row
            .heartbeat
            .map(|h| h.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_else(|| "-".into());
        md.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            row.agent_id,
            row.status.as_deref().unwrap_or("-"),
            row.last_update.as_deref().unwrap_or("-"),
            heartbeat,
            if row.stale { "yes" } else { "no" },
        ));
    }
    md
}

pub fn render_json(rows: &[AgentRow]) -> Result<String> {
    Ok(serde_json::to_string_pretty(rows)?)
}

/// Write the markdown report to `<root>/status.md`.
pub async fn write_report(layout: &BridgeLayout, markdown: &str) -> Result<PathBuf> {
    fs::create_dir_all(&layout.root).await?;
    let path = layout.root.join("status.md");
    fs::write(&path, markdown).await?;
    Ok(path)
}
