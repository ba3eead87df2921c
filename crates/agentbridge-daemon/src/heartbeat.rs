//! Liveness monitor: resumes agents whose heartbeat went stale.

use std::sync::Arc;
use std::time::Duration;

use agentbridge_core::{HeartbeatRecord, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent_state::{ResumeController, ResumeOutcome};
use crate::layout::{list_json_stems, read_json};

pub struct HeartbeatMonitor {
    resume: ResumeController,
    interval: Duration,
    threshold: chrono::Duration,
}

impl HeartbeatMonitor {
    pub fn new(resume: ResumeController, interval: Duration, threshold: chrono::Duration) -> Self {
        Self {
            resume,
            interval,
            threshold,
        }
    }

    /// Agent ids whose heartbeat is older than the threshold at `now`.
    /// Unreadable heartbeat files are skipped.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let dir = &self.resume.store().layout().heartbeats;
        let mut stale = Vec::new();
        for agent_id in list_json_stems(dir).await? {
            let path = dir.join(format!("{agent_id}.json"));
            let record = match read_json::<HeartbeatRecord>(&path).await {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    warn!(agent_id, error = %e, "Skipping unreadable heartbeat");
                    continue;
                }
            };
            if record.is_stale(now, self.threshold) {
                debug!(agent_id, age_secs = record.age(now).num_seconds(), "Stale heartbeat");
                stale.push(agent_id);
            }
        }
        Ok(stale)
    }

    /// One monitoring pass: scan, then resume every stale agent.
    pub async fn check_once(&self) -> Result<Vec<(String, ResumeOutcome)>> {
        let stale = self.scan_once(Utc::now()).await?;
        let mut outcomes = Vec::with_capacity(stale.len());
        for agent_id in stale {
            match self.resume.resume_agent(&agent_id).await {
                Ok(outcome) => {
                    if outcome == ResumeOutcome::Resumed {
                        info!(agent_id, "Resumed stale agent");
                    }
                    outcomes.push((agent_id, outcome));
                }
                Err(e) => warn!(agent_id, error = %e, "Resume failed"),
            }
        }
        Ok(outcomes)
    }

    /// Run passes every interval until `cancel` fires. A failing or
    /// panicking pass is logged and the next one is scheduled as usual.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            threshold_secs = self.threshold.num_seconds(),
            "Heartbeat monitor started"
        );
        loop {
            let monitor = self.clone();
            let mut pass = tokio::spawn(async move { monitor.check_once().await });
            tokio::select! {
                joined = &mut pass => match joined {
                    Ok(Ok(outcomes)) => debug!(resumed = outcomes.len(), "Heartbeat pass done"),
                    Ok(Err(e)) => error!(error = %e, "Heartbeat pass failed"),
                    Err(e) => error!(error = %e, "Heartbeat pass panicked"),
                },
                _ = cancel.cancelled() => {
                    pass.abort();
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => break,
            }
        }
        info!("Heartbeat monitor stopped");
    }
}
