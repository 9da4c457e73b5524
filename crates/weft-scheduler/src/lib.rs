//! Recurrence scheduler: persisted schedule entries plus a polling loop that
//! starts workflows through the execution engine when they come due.
//!
//! The entry map is owned exclusively by the scheduler; callers get
//! copy-on-read snapshots. Schedule state is persisted as JSON with
//! write-then-rename on every mutation batch.

pub mod recurrence;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use weft_core::config::SchedulerConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::WorkflowEvent;
use weft_engine::{ExecOptions, WorkflowEngine};

pub use recurrence::{compute_next_run, IntervalUnit, ScheduleSpec};

/// Lifecycle of a schedule entry.
///
/// `pending -> running -> pending` for recurring entries; `completed` once a
/// `Once` entry fires or `max_runs` is reached; `paused`/`cancelled` via
/// operator action; `failed` terminally when a scheduled run errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl ScheduleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A persisted rule describing when to automatically start a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub name: String,
    pub goal: String,
    pub schedule: ScheduleSpec,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
}

/// One row of [`Scheduler::upcoming`].
#[derive(Debug, Clone, Serialize)]
pub struct UpcomingRun {
    pub entry_id: String,
    pub name: String,
    pub next_run: DateTime<Utc>,
}

/// On-disk document format.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedSchedules {
    workflows: Vec<ScheduleEntry>,
    last_saved: DateTime<Utc>,
}

/// Owns schedule entries and drives the polling loop.
pub struct Scheduler {
    engine: Arc<WorkflowEngine>,
    path: PathBuf,
    tick: Duration,
    grace: Duration,
    entries: Mutex<HashMap<String, ScheduleEntry>>,
}

impl Scheduler {
    /// Create a scheduler, reloading persisted entries if present.
    pub fn new(config: &SchedulerConfig, engine: Arc<WorkflowEngine>) -> Self {
        let path = PathBuf::from(&config.state_file);
        let entries = Self::load(&path);
        if !entries.is_empty() {
            info!(count = entries.len(), "Restored scheduled workflows");
        }
        Self {
            engine,
            path,
            tick: Duration::from_secs(config.tick_secs),
            grace: Duration::from_secs(config.shutdown_grace_secs),
            entries: Mutex::new(entries),
        }
    }

    fn load(path: &Path) -> HashMap<String, ScheduleEntry> {
        let Ok(content) = std::fs::read_to_string(path) else {
            return HashMap::new();
        };
        match serde_json::from_str::<PersistedSchedules>(&content) {
            Ok(persisted) => persisted
                .workflows
                .into_iter()
                .map(|e| (e.id.clone(), e))
                .collect(),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Ignoring unreadable schedule state");
                HashMap::new()
            }
        }
    }

    /// Register a new scheduled workflow. The spec is validated and the
    /// first fire time computed up front, so a dead entry is never stored.
    pub async fn schedule(
        &self,
        name: impl Into<String>,
        goal: impl Into<String>,
        spec: ScheduleSpec,
        max_runs: Option<u32>,
    ) -> Result<String> {
        spec.validate()?;
        let now = Utc::now();
        let next_run = compute_next_run(&spec, None, now).ok_or_else(|| {
            WeftError::Schedule("schedule has no future occurrence".to_string())
        })?;

        let entry = ScheduleEntry {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            goal: goal.into(),
            schedule: spec,
            status: ScheduleStatus::Pending,
            created_at: now,
            last_run: None,
            next_run: Some(next_run),
            run_count: 0,
            max_runs,
        };
        let id = entry.id.clone();

        info!(
            entry_id = %id,
            name = %entry.name,
            next_run = %next_run,
            "Workflow scheduled"
        );
        self.entries.lock().unwrap().insert(id.clone(), entry);
        self.save().await?;
        Ok(id)
    }

    /// Snapshot of one entry.
    pub fn get(&self, entry_id: &str) -> Option<ScheduleEntry> {
        self.entries.lock().unwrap().get(entry_id).cloned()
    }

    /// Snapshots of all entries.
    pub fn list(&self) -> Vec<ScheduleEntry> {
        let mut entries: Vec<ScheduleEntry> =
            self.entries.lock().unwrap().values().cloned().collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    /// Pause a pending entry. It keeps its definition but stops firing.
    pub async fn pause(&self, entry_id: &str) -> bool {
        let paused = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(entry_id) {
                Some(entry) if entry.status == ScheduleStatus::Pending => {
                    entry.status = ScheduleStatus::Paused;
                    true
                }
                _ => false,
            }
        };
        if paused {
            self.persist_after_mutation().await;
        }
        paused
    }

    /// Resume a paused entry, recomputing its next fire time from now.
    pub async fn resume(&self, entry_id: &str) -> bool {
        let resumed = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(entry_id) {
                Some(entry) if entry.status == ScheduleStatus::Paused => {
                    entry.next_run = compute_next_run(&entry.schedule, entry.last_run, Utc::now());
                    // An expired one-shot has nothing left to do
                    entry.status = if entry.next_run.is_some() {
                        ScheduleStatus::Pending
                    } else {
                        ScheduleStatus::Completed
                    };
                    true
                }
                _ => false,
            }
        };
        if resumed {
            self.persist_after_mutation().await;
        }
        resumed
    }

    /// Permanently cancel an entry. The definition stays on file.
    pub async fn cancel(&self, entry_id: &str) -> bool {
        let cancelled = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(entry_id) {
                Some(entry) if !entry.status.is_terminal() => {
                    entry.status = ScheduleStatus::Cancelled;
                    entry.next_run = None;
                    true
                }
                _ => false,
            }
        };
        if cancelled {
            self.persist_after_mutation().await;
        }
        cancelled
    }

    /// Remove an entry entirely.
    pub async fn delete(&self, entry_id: &str) -> bool {
        let removed = self.entries.lock().unwrap().remove(entry_id).is_some();
        if removed {
            self.persist_after_mutation().await;
        }
        removed
    }

    /// Pending entries firing within the window, soonest first.
    pub fn upcoming(&self, within: Duration) -> Vec<UpcomingRun> {
        let cutoff = Utc::now() + chrono::Duration::from_std(within).unwrap_or_default();
        let mut runs: Vec<UpcomingRun> = self
            .entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.status == ScheduleStatus::Pending)
            .filter_map(|e| {
                let next_run = e.next_run?;
                (next_run <= cutoff).then(|| UpcomingRun {
                    entry_id: e.id.clone(),
                    name: e.name.clone(),
                    next_run,
                })
            })
            .collect();
        runs.sort_by_key(|r| r.next_run);
        runs
    }

    /// Polling loop. Blocks until cancelled, then drains in-flight runs up
    /// to the shutdown grace period before force-cancelling them.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut in_flight: JoinSet<(String, bool)> = JoinSet::new();

        info!(
            tick_secs = self.tick.as_secs(),
            path = %self.path.display(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let due = self.claim_due(Utc::now());
                    for entry in due {
                        info!(entry_id = %entry.id, name = %entry.name, "Firing scheduled workflow");
                        let engine = self.engine.clone();
                        in_flight.spawn(async move {
                            let ok = run_goal(engine, &entry.goal, &entry.name).await;
                            (entry.id, ok)
                        });
                    }
                    self.persist_after_mutation().await;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok((entry_id, ok)) => self.finish_run(&entry_id, ok),
                        Err(e) => warn!(error = %e, "Scheduled run task failed"),
                    }
                    self.persist_after_mutation().await;
                }
            }
        }

        // Drain in-flight runs, bounded by the grace period
        if !in_flight.is_empty() {
            info!(runs = in_flight.len(), grace_secs = self.grace.as_secs(), "Draining scheduled runs");
            let deadline = tokio::time::Instant::now() + self.grace;
            loop {
                match tokio::time::timeout_at(deadline, in_flight.join_next()).await {
                    Ok(Some(Ok((entry_id, ok)))) => self.finish_run(&entry_id, ok),
                    Ok(Some(Err(e))) => warn!(error = %e, "Scheduled run task failed"),
                    Ok(None) => break,
                    Err(_) => {
                        warn!(remaining = in_flight.len(), "Grace period expired, force-cancelling runs");
                        in_flight.abort_all();
                        break;
                    }
                }
            }
        }

        self.persist_after_mutation().await;
        info!("Scheduler shutting down");
    }

    /// Transition due pending entries to running and return their snapshots.
    fn claim_due(&self, now: DateTime<Utc>) -> Vec<ScheduleEntry> {
        let mut entries = self.entries.lock().unwrap();
        let mut due = Vec::new();
        for entry in entries.values_mut() {
            if entry.status != ScheduleStatus::Pending {
                continue;
            }
            let Some(next_run) = entry.next_run else {
                continue;
            };
            if next_run > now {
                continue;
            }
            if let Some(max) = entry.max_runs {
                if entry.run_count >= max {
                    entry.status = ScheduleStatus::Completed;
                    entry.next_run = None;
                    continue;
                }
            }
            entry.status = ScheduleStatus::Running;
            entry.last_run = Some(now);
            entry.run_count += 1;
            due.push(entry.clone());
        }
        due
    }

    /// Settle an entry after its run finished.
    fn finish_run(&self, entry_id: &str, ok: bool) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(entry_id) else {
            return;
        };

        if !ok {
            error!(entry_id = %entry.id, name = %entry.name, "Scheduled workflow failed");
            entry.status = ScheduleStatus::Failed;
            entry.next_run = None;
            return;
        }

        let exhausted = entry
            .max_runs
            .map_or(false, |max| entry.run_count >= max);
        if !entry.schedule.is_recurring() || exhausted {
            entry.status = ScheduleStatus::Completed;
            entry.next_run = None;
            info!(entry_id = %entry.id, name = %entry.name, runs = entry.run_count, "Schedule completed");
        } else {
            entry.status = ScheduleStatus::Pending;
            entry.next_run = compute_next_run(&entry.schedule, entry.last_run, Utc::now());
            if let Some(next_run) = entry.next_run {
                info!(entry_id = %entry.id, name = %entry.name, next_run = %next_run, "Schedule rearmed");
            } else {
                entry.status = ScheduleStatus::Completed;
            }
        }
    }

    /// Persist the entry map atomically.
    pub async fn save(&self) -> Result<()> {
        let persisted = PersistedSchedules {
            workflows: self.list(),
            last_saved: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&persisted)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Save, logging instead of propagating. In-memory state stays
    /// authoritative; the next mutation retries the write.
    async fn persist_after_mutation(&self) {
        if let Err(e) = self.save().await {
            warn!(error = %e, "Schedule persistence failed");
        }
    }
}

/// Drive one scheduled workflow to its terminal event.
async fn run_goal(engine: Arc<WorkflowEngine>, goal: &str, name: &str) -> bool {
    match engine.start(goal, ExecOptions::default()) {
        Ok((session_id, feed)) => {
            info!(name = %name, session_id = %session_id, "Scheduled workflow started");
            let events: Vec<WorkflowEvent> = feed.collect().await;
            matches!(
                events.last(),
                Some(WorkflowEvent::WorkflowCompleted { .. })
            )
        }
        Err(e) => {
            error!(name = %name, error = %e, "Failed to start scheduled workflow");
            false
        }
    }
}
