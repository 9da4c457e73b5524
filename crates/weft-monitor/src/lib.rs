//! Passive progress monitor.
//!
//! Records session and run state transitions pushed by the execution engine,
//! serves copy-on-read snapshots, and periodically persists the full state
//! as JSON with write-then-rename so concurrent readers never observe a
//! partial file. Stale sessions are evicted from memory during the periodic
//! sweep but stay in the persisted file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weft_core::config::MonitorConfig;
use weft_core::error::Result;
use weft_core::session::WorkflowSession;
use weft_core::traits::{ProgressSink, ProgressUpdate};
use weft_core::types::AgentRun;

/// In-memory monitor state; also the snapshot shape handed to readers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorState {
    pub workflow_sessions: HashMap<String, WorkflowSession>,
    pub agent_runs: HashMap<String, AgentRun>,
}

impl MonitorState {
    fn merge_from(&mut self, other: &MonitorState) {
        for (id, session) in &other.workflow_sessions {
            self.workflow_sessions
                .entry(id.clone())
                .or_insert_with(|| session.clone());
        }
        for (id, run) in &other.agent_runs {
            self.agent_runs
                .entry(id.clone())
                .or_insert_with(|| run.clone());
        }
    }
}

/// On-disk document format.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    agent_runs: HashMap<String, AgentRun>,
    workflow_sessions: HashMap<String, WorkflowSession>,
    last_updated: DateTime<Utc>,
}

/// Records engine state transitions and persists them on a fixed interval.
pub struct ProgressMonitor {
    path: PathBuf,
    persist_interval: Duration,
    staleness: Duration,
    /// Live state served by `snapshot()`.
    live: Mutex<MonitorState>,
    /// Sessions evicted from memory; retained so flushes never drop them
    /// from the persisted file.
    evicted: Mutex<MonitorState>,
}

impl ProgressMonitor {
    /// Create a monitor, reloading the last persisted snapshot if present.
    pub fn new(config: &MonitorConfig) -> Self {
        let path = PathBuf::from(&config.state_file);
        let live = Self::load(&path).unwrap_or_default();
        if !live.workflow_sessions.is_empty() || !live.agent_runs.is_empty() {
            info!(
                sessions = live.workflow_sessions.len(),
                runs = live.agent_runs.len(),
                "Restored monitor state"
            );
        }
        Self {
            path,
            persist_interval: Duration::from_secs(config.persist_interval_secs),
            staleness: Duration::from_secs(config.staleness_secs),
            live: Mutex::new(live),
            evicted: Mutex::new(MonitorState::default()),
        }
    }

    fn load(path: &Path) -> Option<MonitorState> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<PersistedState>(&content) {
            Ok(persisted) => Some(MonitorState {
                workflow_sessions: persisted.workflow_sessions,
                agent_runs: persisted.agent_runs,
            }),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Ignoring unreadable monitor state");
                None
            }
        }
    }

    /// Copy-on-read snapshot of the live state.
    pub fn snapshot(&self) -> MonitorState {
        self.live.lock().unwrap().clone()
    }

    /// Apply one state transition.
    pub fn record(&self, update: ProgressUpdate) {
        let mut live = self.live.lock().unwrap();
        match update {
            ProgressUpdate::SessionUpserted(session) => {
                live.workflow_sessions
                    .insert(session.session_id.0.clone(), session);
            }
            ProgressUpdate::RunUpserted(run) => {
                live.agent_runs.insert(run.run_id.0.clone(), run);
            }
        }
    }

    /// Evict sessions (and their runs) with no activity past the staleness
    /// threshold. Evicted entries stay in the persisted file.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::from_std(self.staleness).unwrap_or_default();
        let mut live = self.live.lock().unwrap();
        let mut evicted = self.evicted.lock().unwrap();

        let stale_sessions: Vec<String> = live
            .workflow_sessions
            .iter()
            .filter(|(_, s)| session_last_activity(s) < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale_sessions {
            if let Some(session) = live.workflow_sessions.remove(&id) {
                debug!(session_id = %id, "Evicting stale session from memory");
                evicted.workflow_sessions.insert(id, session);
            }
        }

        let stale_runs: Vec<String> = live
            .agent_runs
            .iter()
            .filter(|(_, r)| r.last_activity < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale_runs {
            if let Some(run) = live.agent_runs.remove(&id) {
                evicted.agent_runs.insert(id, run);
            }
        }
    }

    /// Persist the union of live and evicted state atomically.
    ///
    /// Errors are surfaced to the caller; the periodic loop logs and
    /// retries on the next cycle, leaving in-memory state authoritative.
    pub async fn flush(&self) -> Result<()> {
        let mut merged = self.snapshot();
        merged.merge_from(&self.evicted.lock().unwrap());

        let persisted = PersistedState {
            agent_runs: merged.agent_runs,
            workflow_sessions: merged.workflow_sessions,
            last_updated: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&persisted)?;

        // Write-then-rename so a concurrently reading dashboard never sees
        // a partial file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Periodic sweep-and-persist loop. Blocks until cancelled; performs a
    /// final flush on shutdown.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.persist_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // interval fires immediately; skip the initial tick
        tick.tick().await;

        info!(
            path = %self.path.display(),
            interval_secs = self.persist_interval.as_secs(),
            "Progress monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "Final monitor flush failed");
                    }
                    info!("Progress monitor shutting down");
                    break;
                }
                _ = tick.tick() => {
                    self.sweep(Utc::now());
                    if let Err(e) = self.flush().await {
                        // In-memory state stays authoritative; retry next cycle
                        warn!(error = %e, "Monitor persistence failed");
                    }
                }
            }
        }
    }
}

impl ProgressSink for ProgressMonitor {
    fn record(&self, update: ProgressUpdate) {
        ProgressMonitor::record(self, update);
    }
}

/// Most recent activity timestamp observable on a session record.
fn session_last_activity(session: &WorkflowSession) -> DateTime<Utc> {
    let mut latest = session.completed_at.unwrap_or(session.started_at);
    for step in &session.steps {
        if let Some(done) = step.completed_at {
            latest = latest.max(done);
        } else {
            latest = latest.max(step.started_at);
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::session::SessionStatus;
    use weft_core::types::{RunId, SessionId, WorkerType};

    fn monitor_at(dir: &Path) -> ProgressMonitor {
        let config = MonitorConfig {
            state_file: dir.join("monitoring_state.json").display().to_string(),
            persist_interval_secs: 60,
            staleness_secs: 3600,
        };
        ProgressMonitor::new(&config)
    }

    fn session(id: &str, status: SessionStatus) -> WorkflowSession {
        let mut s = WorkflowSession::new(SessionId::from_string(id), "test goal");
        s.status = status;
        s
    }

    fn run(worker: WorkerType) -> AgentRun {
        AgentRun::new(RunId::new(worker), worker, "test task")
    }

    #[test]
    fn test_record_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor_at(dir.path());

        monitor.record(ProgressUpdate::SessionUpserted(session(
            "s1",
            SessionStatus::Running,
        )));
        monitor.record(ProgressUpdate::RunUpserted(run(WorkerType::Researcher)));

        let snap = monitor.snapshot();
        assert_eq!(snap.workflow_sessions.len(), 1);
        assert_eq!(snap.agent_runs.len(), 1);
        assert_eq!(
            snap.workflow_sessions["s1"].status,
            SessionStatus::Running
        );
    }

    #[tokio::test]
    async fn test_idempotent_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let monitor = monitor_at(dir.path());
            monitor.record(ProgressUpdate::SessionUpserted(session(
                "s1",
                SessionStatus::Completed,
            )));
            monitor.record(ProgressUpdate::SessionUpserted(session(
                "s2",
                SessionStatus::Running,
            )));
            monitor.record(ProgressUpdate::RunUpserted(run(WorkerType::Writer)));
            monitor.flush().await.unwrap();
        }

        // Restart: a fresh monitor reloads the persisted snapshot
        let restored = monitor_at(dir.path());
        let snap = restored.snapshot();
        assert_eq!(snap.workflow_sessions.len(), 2);
        assert_eq!(snap.agent_runs.len(), 1);
        assert_eq!(
            snap.workflow_sessions["s1"].status,
            SessionStatus::Completed
        );
        assert_eq!(snap.workflow_sessions["s2"].status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_sweep_evicts_memory_but_not_file() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor_at(dir.path());

        let mut old = session("old", SessionStatus::Completed);
        old.started_at = Utc::now() - chrono::Duration::hours(2);
        old.completed_at = Some(Utc::now() - chrono::Duration::hours(2));
        monitor.record(ProgressUpdate::SessionUpserted(old));
        monitor.record(ProgressUpdate::SessionUpserted(session(
            "fresh",
            SessionStatus::Running,
        )));

        monitor.sweep(Utc::now());

        let snap = monitor.snapshot();
        assert!(!snap.workflow_sessions.contains_key("old"));
        assert!(snap.workflow_sessions.contains_key("fresh"));

        // The persisted file still carries the evicted session
        monitor.flush().await.unwrap();
        let content =
            std::fs::read_to_string(dir.path().join("monitoring_state.json")).unwrap();
        let persisted: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert!(persisted["workflow_sessions"].get("old").is_some());
        assert!(persisted["workflow_sessions"].get("fresh").is_some());
    }

    #[tokio::test]
    async fn test_live_state_wins_over_evicted_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor_at(dir.path());

        let mut s = session("s1", SessionStatus::Running);
        s.started_at = Utc::now() - chrono::Duration::hours(2);
        monitor.record(ProgressUpdate::SessionUpserted(s));
        monitor.sweep(Utc::now());

        // Session comes back to life with a newer status
        monitor.record(ProgressUpdate::SessionUpserted(session(
            "s1",
            SessionStatus::Completed,
        )));
        monitor.flush().await.unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("monitoring_state.json")).unwrap();
        let persisted: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(
            persisted["workflow_sessions"]["s1"]["status"],
            serde_json::json!("completed")
        );
    }
}
