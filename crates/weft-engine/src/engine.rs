//! Workflow execution engine.
//!
//! Owns the session store exclusively; every other component sees
//! copy-on-read snapshots. Each `start` call plans the goal, creates a
//! session workspace, and drives the plan either strictly in order or in
//! parallel groups, forwarding run events onto the live progress feed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use weft_core::error::{Result, WeftError};
use weft_core::event::{EventBus, PlannedStep, WorkflowEvent};
use weft_core::plan::{Plan, Step};
use weft_core::session::{SessionStatus, StepResult, StepStatus, WorkflowSession};
use weft_core::traits::{ProgressSink, ProgressUpdate};
use weft_core::types::{RunId, SessionId};
use weft_stream::{BatchEvent, RunEvent, SpawnOptions, SpawnSpec, StreamMux};

use crate::grouping::group_steps;

/// Capacity of the per-session live feed channel.
const FEED_BUFFER: usize = 256;

/// Execution options for one workflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    /// Run independent consecutive steps concurrently in parallel groups.
    pub parallel: bool,
}

/// Runtime plan modification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ModifyOp {
    AddStep {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
        step: Step,
    },
    RemoveStep {
        index: usize,
    },
    ReplaceStep {
        index: usize,
        step: Step,
    },
}

enum DriveOutcome {
    Completed,
    Failed(String),
    Interrupted(String),
}

struct SessionHandle {
    session: WorkflowSession,
    plan: Plan,
    workspace: PathBuf,
    cancel: CancellationToken,
    /// Runs of the step or group currently in flight.
    active_runs: Vec<RunId>,
}

/// Drives plans to completion and owns all workflow sessions.
pub struct WorkflowEngine {
    mux: Arc<StreamMux>,
    event_bus: Arc<EventBus>,
    sink: Option<Arc<dyn ProgressSink>>,
    workspace_base: PathBuf,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl WorkflowEngine {
    pub fn new(
        mux: Arc<StreamMux>,
        event_bus: Arc<EventBus>,
        workspace_base: PathBuf,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> Self {
        Self {
            mux,
            event_bus,
            sink,
            workspace_base,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a workflow for a goal.
    ///
    /// Returns immediately with the session id and a live stream of
    /// progress events; the stream ends after the terminal
    /// `workflow_completed` / `workflow_interrupted` / `workflow_error`
    /// event.
    pub fn start(
        self: &Arc<Self>,
        goal: &str,
        options: ExecOptions,
    ) -> Result<(SessionId, ReceiverStream<WorkflowEvent>)> {
        let session_id = SessionId::new();
        let workspace = self
            .workspace_base
            .join(format!("{}-{}", slugify(goal), &session_id.0[..8]));
        std::fs::create_dir_all(&workspace)?;

        let plan = weft_planner::plan(goal);
        let mut session = WorkflowSession::new(session_id.clone(), goal);
        session.total_steps = plan.steps.len();

        self.sessions.lock().unwrap().insert(
            session_id.0.clone(),
            SessionHandle {
                session,
                plan,
                workspace,
                cancel: CancellationToken::new(),
                active_runs: Vec::new(),
            },
        );
        self.record_session(&session_id);

        info!(session_id = %session_id, goal = %goal, parallel = options.parallel, "Workflow started");

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let engine = self.clone();
        let sid = session_id.clone();
        tokio::spawn(async move { engine.drive(sid, tx, options).await });

        Ok((session_id, ReceiverStream::new(rx)))
    }

    /// Cancel all in-flight runs of a session and mark remaining steps
    /// interrupted. Returns whether any run was actually cancelled: false
    /// when the session is unknown, already terminal, or idle between
    /// steps (the workflow still stops in the latter case).
    pub fn interrupt(&self, session_id: &SessionId) -> bool {
        let active = {
            let sessions = self.sessions.lock().unwrap();
            match sessions.get(&session_id.0) {
                Some(handle) if handle.session.status == SessionStatus::Running => {
                    handle.cancel.cancel();
                    handle.active_runs.clone()
                }
                _ => return false,
            }
        };
        let cancelled = active.iter().filter(|id| self.mux.cancel(id)).count();
        info!(session_id = %session_id, cancelled, "Interrupting workflow");
        cancelled > 0
    }

    /// Apply a runtime plan modification. Rejected once the session has
    /// completed; failures surface as a `modification_failed` event.
    pub fn modify(&self, session_id: &SessionId, op: ModifyOp) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        let handle = match sessions.get_mut(&session_id.0) {
            Some(h) => h,
            None => {
                self.event_bus.publish(WorkflowEvent::ModificationFailed {
                    session_id: session_id.clone(),
                    reason: "session not found".to_string(),
                });
                return false;
            }
        };

        if handle.session.status == SessionStatus::Completed {
            self.event_bus.publish(WorkflowEvent::ModificationFailed {
                session_id: session_id.clone(),
                reason: "cannot modify completed workflow".to_string(),
            });
            return false;
        }

        let steps = &mut handle.plan.steps;
        let description = match op {
            ModifyOp::AddStep { position, step } => {
                let at = position.unwrap_or(steps.len()).min(steps.len());
                let id = step.id.clone();
                steps.insert(at, step);
                format!("step_added:{id}@{at}")
            }
            ModifyOp::RemoveStep { index } => {
                if index >= steps.len() {
                    self.event_bus.publish(WorkflowEvent::ModificationFailed {
                        session_id: session_id.clone(),
                        reason: format!("step index {index} out of range"),
                    });
                    return false;
                }
                let removed = steps.remove(index);
                format!("step_removed:{}@{index}", removed.id)
            }
            ModifyOp::ReplaceStep { index, step } => {
                if index >= steps.len() {
                    self.event_bus.publish(WorkflowEvent::ModificationFailed {
                        session_id: session_id.clone(),
                        reason: format!("step index {index} out of range"),
                    });
                    return false;
                }
                let id = step.id.clone();
                steps[index] = step;
                format!("step_replaced:{id}@{index}")
            }
        };

        handle.session.total_steps = handle.plan.steps.len();
        self.event_bus.publish(WorkflowEvent::WorkflowModified {
            session_id: session_id.clone(),
            modification: description,
        });
        true
    }

    /// Copy-on-read snapshot of one session.
    pub fn get_status(&self, session_id: &SessionId) -> Option<WorkflowSession> {
        self.sessions
            .lock()
            .unwrap()
            .get(&session_id.0)
            .map(|h| h.session.clone())
    }

    /// Snapshots of all known sessions.
    pub fn sessions(&self) -> Vec<WorkflowSession> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .map(|h| h.session.clone())
            .collect()
    }

    /// Subscribe to the cross-session event feed.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.event_bus.subscribe()
    }

    async fn drive(
        self: Arc<Self>,
        session_id: SessionId,
        tx: mpsc::Sender<WorkflowEvent>,
        options: ExecOptions,
    ) {
        let (goal, workspace, planned, category, cancel) = {
            let sessions = self.sessions.lock().unwrap();
            let handle = &sessions[&session_id.0];
            let planned: Vec<PlannedStep> = handle
                .plan
                .steps
                .iter()
                .enumerate()
                .map(|(i, s)| PlannedStep {
                    step: i + 1,
                    description: s.description.clone(),
                    worker_type: s.worker_type,
                })
                .collect();
            (
                handle.session.goal.clone(),
                handle.workspace.clone(),
                planned,
                handle.plan.category,
                handle.cancel.clone(),
            )
        };

        self.emit(
            &tx,
            WorkflowEvent::WorkflowStarted {
                session_id: session_id.clone(),
                goal,
                workspace: workspace.display().to_string(),
                timestamp: Utc::now(),
            },
        )
        .await;

        self.emit(
            &tx,
            WorkflowEvent::WorkflowPlanned {
                session_id: session_id.clone(),
                category: category.as_str().to_string(),
                total_steps: planned.len(),
                steps: planned,
            },
        )
        .await;

        let outcome = if options.parallel {
            self.run_parallel(&session_id, &workspace, &tx, &cancel).await
        } else {
            self.run_sequential(&session_id, &workspace, &tx, &cancel).await
        };

        let terminal = match outcome {
            Ok(DriveOutcome::Completed) => {
                let session = self.finish_session(&session_id, SessionStatus::Completed);
                WorkflowEvent::WorkflowCompleted {
                    session_id: session_id.clone(),
                    total_steps: session.total_steps,
                    metrics: session.metrics,
                    timestamp: Utc::now(),
                }
            }
            Ok(DriveOutcome::Interrupted(reason)) => {
                self.mark_remaining_interrupted(&session_id, &reason);
                self.finish_session(&session_id, SessionStatus::Interrupted);
                WorkflowEvent::WorkflowInterrupted {
                    session_id: session_id.clone(),
                    reason,
                }
            }
            Ok(DriveOutcome::Failed(message)) => {
                self.finish_session(&session_id, SessionStatus::Failed);
                WorkflowEvent::WorkflowError {
                    session_id: session_id.clone(),
                    message,
                }
            }
            Err(e) => {
                // Engine-level failure (e.g. workspace I/O): abort the run
                error!(session_id = %session_id, error = %e, "Workflow aborted");
                self.finish_session(&session_id, SessionStatus::Failed);
                WorkflowEvent::WorkflowError {
                    session_id: session_id.clone(),
                    message: e.to_string(),
                }
            }
        };

        self.emit(&tx, terminal).await;
    }

    /// Execute steps strictly in plan order.
    async fn run_sequential(
        &self,
        session_id: &SessionId,
        workspace: &Path,
        tx: &mpsc::Sender<WorkflowEvent>,
        cancel: &CancellationToken,
    ) -> Result<DriveOutcome> {
        let mut produced: HashSet<String> = HashSet::new();
        let mut index = 0usize;

        loop {
            // Re-read the plan each iteration; `modify` may have changed it
            let (step, total) = {
                let mut sessions = self.sessions.lock().unwrap();
                let handle = sessions
                    .get_mut(&session_id.0)
                    .ok_or_else(|| WeftError::SessionNotFound(session_id.0.clone()))?;
                handle.session.current_step_index = index;
                match handle.plan.steps.get(index) {
                    Some(step) => (step.clone(), handle.plan.steps.len()),
                    None => return Ok(DriveOutcome::Completed),
                }
            };
            self.record_session(session_id);

            if let Some(missing) = missing_input(&step, &produced) {
                let message =
                    format!("step '{}' requires missing artifact '{missing}'", step.id);
                self.push_step_result(session_id, failed_result(&step, &message));
                return Ok(DriveOutcome::Failed(message));
            }

            self.emit(
                tx,
                WorkflowEvent::StepStarted {
                    session_id: session_id.clone(),
                    step: index + 1,
                    total_steps: total,
                    description: step.description.clone(),
                    worker_type: step.worker_type,
                },
            )
            .await;

            let result = self
                .execute_step(session_id, workspace, &step, index, tx, cancel)
                .await?;
            let status = result.status;
            let error = result.error.clone();
            self.push_step_result(session_id, result.clone());

            match status {
                StepStatus::Completed => {
                    if let Some(artifact) = &step.output_artifact {
                        produced.insert(artifact.clone());
                    }
                    self.emit(
                        tx,
                        WorkflowEvent::StepCompleted {
                            session_id: session_id.clone(),
                            step: index + 1,
                            result,
                        },
                    )
                    .await;
                    index += 1;
                }
                StepStatus::Interrupted => {
                    return Ok(DriveOutcome::Interrupted(
                        error.unwrap_or_else(|| "cancelled".to_string()),
                    ));
                }
                _ => {
                    return Ok(DriveOutcome::Failed(format!(
                        "step '{}' failed: {}",
                        step.id,
                        error.unwrap_or_else(|| "unknown error".to_string())
                    )));
                }
            }
        }
    }

    /// Execute the plan as parallel groups of independent steps.
    async fn run_parallel(
        &self,
        session_id: &SessionId,
        workspace: &Path,
        tx: &mpsc::Sender<WorkflowEvent>,
        cancel: &CancellationToken,
    ) -> Result<DriveOutcome> {
        // Grouping is computed once; parallel plans are not modifiable
        // mid-flight
        let steps: Vec<Step> = {
            let sessions = self.sessions.lock().unwrap();
            sessions[&session_id.0].plan.steps.clone()
        };
        let groups = group_steps(&steps);
        let total_groups = groups.len();
        let mut produced: HashSet<String> = HashSet::new();

        for (group_no, group) in groups.into_iter().enumerate() {
            let members: Vec<(usize, Step)> =
                group.into_iter().map(|i| (i, steps[i].clone())).collect();

            for (_, step) in &members {
                if let Some(missing) = missing_input(step, &produced) {
                    let message =
                        format!("step '{}' requires missing artifact '{missing}'", step.id);
                    self.push_step_result(session_id, failed_result(step, &message));
                    return Ok(DriveOutcome::Failed(message));
                }
            }

            {
                let mut sessions = self.sessions.lock().unwrap();
                if let Some(handle) = sessions.get_mut(&session_id.0) {
                    handle.session.current_step_index = members[0].0;
                }
            }
            self.record_session(session_id);

            let outcome = if members.len() == 1 {
                let (index, step) = &members[0];
                self.emit(
                    tx,
                    WorkflowEvent::StepStarted {
                        session_id: session_id.clone(),
                        step: index + 1,
                        total_steps: steps.len(),
                        description: step.description.clone(),
                        worker_type: step.worker_type,
                    },
                )
                .await;
                vec![self
                    .execute_step(session_id, workspace, step, *index, tx, cancel)
                    .await?]
            } else {
                self.emit(
                    tx,
                    WorkflowEvent::ParallelGroupStarted {
                        session_id: session_id.clone(),
                        group: group_no + 1,
                        total_groups,
                        worker_types: members.iter().map(|(_, s)| s.worker_type).collect(),
                    },
                )
                .await;
                self.execute_group(session_id, workspace, &members, group_no, tx, cancel)
                    .await?
            };

            let mut failed: Option<String> = None;
            let mut interrupted: Option<String> = None;

            for ((index, step), result) in members.iter().zip(outcome) {
                let status = result.status;
                let err = result.error.clone();
                self.push_step_result(session_id, result.clone());
                match status {
                    StepStatus::Completed => {
                        if let Some(artifact) = &step.output_artifact {
                            produced.insert(artifact.clone());
                        }
                        self.emit(
                            tx,
                            WorkflowEvent::StepCompleted {
                                session_id: session_id.clone(),
                                step: index + 1,
                                result,
                            },
                        )
                        .await;
                    }
                    StepStatus::Interrupted => {
                        interrupted
                            .get_or_insert_with(|| err.unwrap_or_else(|| "cancelled".into()));
                    }
                    _ => {
                        failed.get_or_insert_with(|| {
                            format!(
                                "step '{}' failed: {}",
                                step.id,
                                err.unwrap_or_else(|| "unknown error".into())
                            )
                        });
                    }
                }
            }

            if let Some(message) = failed {
                return Ok(DriveOutcome::Failed(message));
            }
            if let Some(reason) = interrupted {
                return Ok(DriveOutcome::Interrupted(reason));
            }

            if members.len() > 1 {
                self.emit(
                    tx,
                    WorkflowEvent::ParallelGroupCompleted {
                        session_id: session_id.clone(),
                        group: group_no + 1,
                    },
                )
                .await;
            }

            let last = members.last().map(|(i, _)| *i).unwrap_or(0);
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(handle) = sessions.get_mut(&session_id.0) {
                handle.session.current_step_index = last + 1;
            }
        }

        Ok(DriveOutcome::Completed)
    }

    /// Run one step to its terminal event.
    async fn execute_step(
        &self,
        session_id: &SessionId,
        workspace: &Path,
        step: &Step,
        index: usize,
        tx: &mpsc::Sender<WorkflowEvent>,
        cancel: &CancellationToken,
    ) -> Result<StepResult> {
        let context = prepare_context(workspace, &step.input_artifacts).await;
        let handle = self.mux.spawn(
            SpawnSpec {
                worker_type: step.worker_type,
                task: step.task.clone(),
                prompt: build_prompt(&step.task, &context),
            },
            SpawnOptions {
                timeout: None,
                cancel: Some(cancel.clone()),
            },
        );

        let run_id = handle.run_id.clone();
        self.set_active_runs(session_id, vec![run_id.clone()]);
        let mut events = handle.events;
        let mut accum = StepAccum::new(step, run_id.clone());

        while let Some(event) = events.next().await {
            self.record_run(&run_id);
            match event {
                RunEvent::Initialized { .. } => {}
                RunEvent::TextChunk {
                    content,
                    word_count,
                    progress,
                    ..
                } => {
                    accum.push_chunk(&content, word_count);
                    self.emit(
                        tx,
                        WorkflowEvent::TextChunk {
                            session_id: session_id.clone(),
                            step: index + 1,
                            run_id: run_id.clone(),
                            content,
                            word_count,
                            progress,
                        },
                    )
                    .await;
                }
                RunEvent::ToolUse { name, input, .. } => {
                    accum.tool_calls += 1;
                    self.emit(
                        tx,
                        WorkflowEvent::ToolUse {
                            session_id: session_id.clone(),
                            step: index + 1,
                            run_id: run_id.clone(),
                            name,
                            input,
                        },
                    )
                    .await;
                }
                RunEvent::Completed {
                    total_words,
                    total_tokens,
                    elapsed_ms,
                    ..
                } => accum.complete(total_words, total_tokens, elapsed_ms),
                RunEvent::Interrupted { reason, .. } => accum.interrupt(&reason),
                RunEvent::Error { message, .. } => accum.fail(&message),
            }
        }

        let (result, totals) = accum.finish();
        if result.status == StepStatus::Completed {
            self.write_artifact(workspace, step, &result.output).await?;
            self.bump_metrics(session_id, &result, &totals);
        }
        Ok(result)
    }

    /// Run a multi-step group through the merged batch stream.
    async fn execute_group(
        &self,
        session_id: &SessionId,
        workspace: &Path,
        members: &[(usize, Step)],
        group_no: usize,
        tx: &mpsc::Sender<WorkflowEvent>,
        cancel: &CancellationToken,
    ) -> Result<Vec<StepResult>> {
        let mut specs = Vec::with_capacity(members.len());
        for (_, step) in members {
            let context = prepare_context(workspace, &step.input_artifacts).await;
            specs.push(SpawnSpec {
                worker_type: step.worker_type,
                task: step.task.clone(),
                prompt: build_prompt(&step.task, &context),
            });
        }

        let batch = self.mux.spawn_parallel(
            specs,
            format!("group_{group_no}"),
            SpawnOptions {
                timeout: None,
                cancel: Some(cancel.clone()),
            },
        );

        self.set_active_runs(session_id, batch.run_ids.clone());

        // Attribute merged events back to their step by run id
        let mut by_run: HashMap<RunId, usize> = HashMap::new();
        let mut accums: Vec<StepAccum> = Vec::with_capacity(members.len());
        for (pos, run_id) in batch.run_ids.iter().enumerate() {
            by_run.insert(run_id.clone(), pos);
            accums.push(StepAccum::new(&members[pos].1, run_id.clone()));
        }

        let mut events = batch.events;
        while let Some(BatchEvent { event, .. }) = events.next().await {
            let run_id = event.run_id().clone();
            self.record_run(&run_id);
            let pos = match by_run.get(&run_id) {
                Some(p) => *p,
                None => continue,
            };
            let step_no = members[pos].0 + 1;

            match event {
                RunEvent::Initialized { .. } => {}
                RunEvent::TextChunk {
                    content,
                    word_count,
                    progress,
                    ..
                } => {
                    accums[pos].push_chunk(&content, word_count);
                    self.emit(
                        tx,
                        WorkflowEvent::TextChunk {
                            session_id: session_id.clone(),
                            step: step_no,
                            run_id,
                            content,
                            word_count,
                            progress,
                        },
                    )
                    .await;
                }
                RunEvent::ToolUse { name, input, .. } => {
                    accums[pos].tool_calls += 1;
                    self.emit(
                        tx,
                        WorkflowEvent::ToolUse {
                            session_id: session_id.clone(),
                            step: step_no,
                            run_id,
                            name,
                            input,
                        },
                    )
                    .await;
                }
                RunEvent::Completed {
                    total_words,
                    total_tokens,
                    elapsed_ms,
                    ..
                } => accums[pos].complete(total_words, total_tokens, elapsed_ms),
                RunEvent::Interrupted { reason, .. } => accums[pos].interrupt(&reason),
                RunEvent::Error { message, .. } => accums[pos].fail(&message),
            }
        }

        let mut results = Vec::with_capacity(members.len());
        for (accum, (_, step)) in accums.into_iter().zip(members) {
            let (result, totals) = accum.finish();
            if result.status == StepStatus::Completed {
                self.write_artifact(workspace, step, &result.output).await?;
                self.bump_metrics(session_id, &result, &totals);
            }
            results.push(result);
        }
        Ok(results)
    }

    async fn write_artifact(&self, workspace: &Path, step: &Step, output: &str) -> Result<()> {
        if let Some(artifact) = &step.output_artifact {
            tokio::fs::write(workspace.join(artifact), output.as_bytes()).await?;
        }
        Ok(())
    }

    fn bump_metrics(&self, session_id: &SessionId, result: &StepResult, totals: &StepTotals) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(handle) = sessions.get_mut(&session_id.0) {
            let metrics = &mut handle.session.metrics;
            metrics.total_words += result.words;
            metrics.total_tokens += result.tokens;
            metrics.total_tool_calls += totals.tool_calls;
            let prior = metrics.avg_response_secs * metrics.completed_runs as f64;
            metrics.completed_runs += 1;
            metrics.avg_response_secs =
                (prior + totals.elapsed_ms as f64 / 1000.0) / metrics.completed_runs as f64;
        }
    }

    fn push_step_result(&self, session_id: &SessionId, result: StepResult) {
        {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(handle) = sessions.get_mut(&session_id.0) {
                handle.session.steps.push(result);
            }
        }
        self.record_session(session_id);
    }

    /// Append interrupted placeholders for steps that never started.
    fn mark_remaining_interrupted(&self, session_id: &SessionId, reason: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(handle) = sessions.get_mut(&session_id.0) {
            let executed = handle.session.steps.len();
            let now = Utc::now();
            for step in handle.plan.steps.iter().skip(executed) {
                handle.session.steps.push(StepResult {
                    step_id: step.id.clone(),
                    description: step.description.clone(),
                    worker_type: step.worker_type,
                    status: StepStatus::Interrupted,
                    run_id: None,
                    output: String::new(),
                    output_artifact: step.output_artifact.clone(),
                    error: Some(reason.to_string()),
                    words: 0,
                    tokens: 0,
                    started_at: now,
                    completed_at: Some(now),
                });
            }
        }
    }

    fn finish_session(&self, session_id: &SessionId, status: SessionStatus) -> WorkflowSession {
        let snapshot = {
            let mut sessions = self.sessions.lock().unwrap();
            let handle = sessions.get_mut(&session_id.0).expect("session exists");
            handle.session.status = status;
            handle.session.completed_at = Some(Utc::now());
            handle.active_runs.clear();
            if status == SessionStatus::Completed {
                handle.session.current_step_index = handle.plan.steps.len();
            }
            handle.session.clone()
        };
        self.record_session(session_id);
        // Run records were forwarded to the sink event by event; the mux
        // does not need to keep finished ones around.
        self.mux.prune_terminal();
        snapshot
    }

    fn set_active_runs(&self, session_id: &SessionId, runs: Vec<RunId>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(handle) = sessions.get_mut(&session_id.0) {
            handle.active_runs = runs;
        }
    }

    async fn emit(&self, tx: &mpsc::Sender<WorkflowEvent>, event: WorkflowEvent) {
        self.event_bus.publish(event.clone());
        // The per-session feed consumer may have gone away; that is fine
        let _ = tx.send(event).await;
    }

    fn record_session(&self, session_id: &SessionId) {
        if let Some(sink) = &self.sink {
            let snapshot = self
                .sessions
                .lock()
                .unwrap()
                .get(&session_id.0)
                .map(|h| h.session.clone());
            if let Some(session) = snapshot {
                sink.record(ProgressUpdate::SessionUpserted(session));
            }
        }
    }

    fn record_run(&self, run_id: &RunId) {
        if let Some(sink) = &self.sink {
            if let Some(run) = self.mux.run(run_id) {
                sink.record(ProgressUpdate::RunUpserted(run));
            }
        }
    }
}

/// Wall-clock and tool-call totals for one completed run.
struct StepTotals {
    elapsed_ms: u64,
    tool_calls: u64,
}

/// Per-step accumulation of run output and terminal state.
struct StepAccum {
    result: StepResult,
    chunks: Vec<String>,
    tool_calls: u64,
    elapsed_ms: u64,
}

impl StepAccum {
    fn new(step: &Step, run_id: RunId) -> Self {
        Self {
            result: StepResult {
                step_id: step.id.clone(),
                description: step.description.clone(),
                worker_type: step.worker_type,
                status: StepStatus::Running,
                run_id: Some(run_id),
                output: String::new(),
                output_artifact: step.output_artifact.clone(),
                error: None,
                words: 0,
                tokens: 0,
                started_at: Utc::now(),
                completed_at: None,
            },
            chunks: vec![],
            tool_calls: 0,
            elapsed_ms: 0,
        }
    }

    fn push_chunk(&mut self, content: &str, word_count: u64) {
        self.chunks.push(content.to_string());
        self.result.words += word_count;
    }

    fn complete(&mut self, total_words: u64, total_tokens: u64, elapsed_ms: u64) {
        self.result.status = StepStatus::Completed;
        self.result.words = total_words;
        self.result.tokens = total_tokens;
        self.elapsed_ms = elapsed_ms;
    }

    fn interrupt(&mut self, reason: &str) {
        self.result.status = StepStatus::Interrupted;
        self.result.error = Some(reason.to_string());
    }

    fn fail(&mut self, message: &str) {
        self.result.status = StepStatus::Failed;
        self.result.error = Some(message.to_string());
    }

    fn finish(mut self) -> (StepResult, StepTotals) {
        if self.result.status == StepStatus::Running {
            // Stream ended without a terminal event; treat as failure
            warn!(step_id = %self.result.step_id, "Run stream ended without terminal event");
            self.result.status = StepStatus::Failed;
            self.result.error = Some("run ended without terminal event".to_string());
        }
        self.result.output = self.chunks.join("\n");
        self.result.completed_at = Some(Utc::now());
        let totals = StepTotals {
            elapsed_ms: self.elapsed_ms,
            tool_calls: self.tool_calls,
        };
        (self.result, totals)
    }
}

fn failed_result(step: &Step, message: &str) -> StepResult {
    let now = Utc::now();
    StepResult {
        step_id: step.id.clone(),
        description: step.description.clone(),
        worker_type: step.worker_type,
        status: StepStatus::Failed,
        run_id: None,
        output: String::new(),
        output_artifact: step.output_artifact.clone(),
        error: Some(message.to_string()),
        words: 0,
        tokens: 0,
        started_at: now,
        completed_at: Some(now),
    }
}

fn missing_input<'a>(step: &'a Step, produced: &HashSet<String>) -> Option<&'a str> {
    step.input_artifacts
        .iter()
        .find(|a| !produced.contains(a.as_str()))
        .map(|a| a.as_str())
}

/// Inline prior-step artifacts into the worker prompt.
async fn prepare_context(workspace: &Path, inputs: &[String]) -> String {
    let mut parts = Vec::new();
    for input in inputs {
        match tokio::fs::read_to_string(workspace.join(input)).await {
            Ok(content) => parts.push(format!("=== {input} ===\n{content}\n")),
            Err(e) => warn!(artifact = %input, error = %e, "Context artifact unreadable"),
        }
    }
    parts.join("\n")
}

fn build_prompt(task: &str, context: &str) -> String {
    if context.is_empty() {
        task.to_string()
    } else {
        format!(
            "CONTEXT:\n{context}\n\nTASK:\n{task}\n\n\
             Complete this task based on the provided context."
        )
    }
}

fn slugify(goal: &str) -> String {
    let slug: String = goal
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    slug.trim_matches('-').chars().take(20).collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::config::StreamConfig;
    use weft_core::types::WorkerType;
    use weft_test_utils::{MockWorker, WorkerScript};

    fn engine_with(worker: Arc<MockWorker>, base: &Path) -> Arc<WorkflowEngine> {
        let mux = Arc::new(StreamMux::new(worker, StreamConfig::default()));
        Arc::new(WorkflowEngine::new(
            mux,
            Arc::new(EventBus::default()),
            base.to_path_buf(),
            None,
        ))
    }

    fn count<F: Fn(&WorkflowEvent) -> bool>(events: &[WorkflowEvent], pred: F) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }

    #[tokio::test]
    async fn test_sequential_workflow_completes() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Arc::new(MockWorker::new(WorkerScript::chunks(&[
            "one two three four",
        ])));
        let engine = engine_with(worker.clone(), dir.path());

        let (sid, feed) = engine
            .start("Research AI trends", ExecOptions::default())
            .unwrap();
        let events: Vec<WorkflowEvent> = feed.collect().await;

        assert!(matches!(events[0], WorkflowEvent::WorkflowStarted { .. }));
        assert!(matches!(events[1], WorkflowEvent::WorkflowPlanned { .. }));
        assert_eq!(
            count(&events, |e| matches!(e, WorkflowEvent::StepCompleted { .. })),
            3
        );
        match events.last().unwrap() {
            WorkflowEvent::WorkflowCompleted {
                total_steps,
                metrics,
                ..
            } => {
                assert_eq!(*total_steps, 3);
                assert_eq!(metrics.total_words, 12);
                assert_eq!(metrics.total_tokens, 30);
                assert_eq!(metrics.completed_runs, 3);
            }
            other => panic!("expected WorkflowCompleted, got {other:?}"),
        }

        let session = engine.get_status(&sid).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.steps.len(), 3);
        assert!((session.progress() - 1.0).abs() < f64::EPSILON);

        // Each step wrote its artifact into the session workspace
        let workspace = match &events[0] {
            WorkflowEvent::WorkflowStarted { workspace, .. } => PathBuf::from(workspace),
            _ => unreachable!(),
        };
        for artifact in [
            "research_notes.md",
            "research_synthesis.md",
            "research_summary.md",
        ] {
            assert!(workspace.join(artifact).exists(), "missing {artifact}");
        }

        // Later steps see earlier artifacts inlined as context
        let invocations = worker.invocations();
        assert_eq!(invocations.len(), 3);
        assert!(invocations[1].prompt.contains("=== research_notes.md ==="));
        assert!(invocations[2].prompt.contains("=== research_synthesis.md ==="));
    }

    #[tokio::test]
    async fn test_step_failure_halts_sequential_execution() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Arc::new(
            MockWorker::new(WorkerScript::chunks(&["fine output"])).route(
                "Analyze the research notes",
                WorkerScript::FailsMidStream {
                    message: "worker crashed".to_string(),
                },
            ),
        );
        let engine = engine_with(worker.clone(), dir.path());

        let (sid, feed) = engine
            .start("Research AI trends", ExecOptions::default())
            .unwrap();
        let events: Vec<WorkflowEvent> = feed.collect().await;

        assert_eq!(
            count(&events, |e| matches!(e, WorkflowEvent::StepCompleted { .. })),
            1
        );
        match events.last().unwrap() {
            WorkflowEvent::WorkflowError { message, .. } => {
                assert!(message.contains("research-2"));
            }
            other => panic!("expected WorkflowError, got {other:?}"),
        }

        // Step 3 never reached the worker
        assert_eq!(worker.invocations().len(), 2);
        let session = engine.get_status(&sid).unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_interrupt_marks_remaining_steps() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Arc::new(MockWorker::new(WorkerScript::Hangs));
        let engine = engine_with(worker, dir.path());

        let (sid, mut feed) = engine
            .start("Research AI trends", ExecOptions::default())
            .unwrap();
        while let Some(event) = feed.next().await {
            if matches!(event, WorkflowEvent::StepStarted { .. }) {
                break;
            }
        }

        assert!(engine.interrupt(&sid));
        let rest: Vec<WorkflowEvent> = feed.collect().await;
        assert!(matches!(
            rest.last().unwrap(),
            WorkflowEvent::WorkflowInterrupted { .. }
        ));

        let session = engine.get_status(&sid).unwrap();
        assert_eq!(session.status, SessionStatus::Interrupted);
        assert_eq!(session.steps.len(), 3);
        assert!(session
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Interrupted));

        // Terminal sessions cannot be interrupted again
        assert!(!engine.interrupt(&sid));
    }

    #[tokio::test]
    async fn test_interrupt_before_any_run_reports_nothing_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Arc::new(MockWorker::new(WorkerScript::Hangs));
        let engine = engine_with(worker, dir.path());

        let (sid, feed) = engine
            .start("Research AI trends", ExecOptions::default())
            .unwrap();
        // The driver has not been polled yet, so no run is in flight:
        // nothing is actually cancelled, but the workflow still stops
        assert!(!engine.interrupt(&sid));

        let events: Vec<WorkflowEvent> = feed.collect().await;
        assert!(matches!(
            events.last().unwrap(),
            WorkflowEvent::WorkflowInterrupted { .. }
        ));
        assert_eq!(
            engine.get_status(&sid).unwrap().status,
            SessionStatus::Interrupted
        );
    }

    #[tokio::test]
    async fn test_completed_session_prunes_run_records() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Arc::new(MockWorker::new(WorkerScript::chunks(&["done"])));
        let mux = Arc::new(StreamMux::new(worker, StreamConfig::default()));
        let engine = Arc::new(WorkflowEngine::new(
            mux.clone(),
            Arc::new(EventBus::default()),
            dir.path().to_path_buf(),
            None,
        ));

        let (_sid, feed) = engine
            .start("Research AI trends", ExecOptions::default())
            .unwrap();
        let _events: Vec<WorkflowEvent> = feed.collect().await;

        assert!(mux.runs().is_empty());
    }

    #[tokio::test]
    async fn test_modify_running_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Arc::new(MockWorker::new(WorkerScript::Hangs));
        let engine = engine_with(worker, dir.path());

        let (sid, feed) = engine
            .start("Research AI trends", ExecOptions::default())
            .unwrap();

        let extra = Step::new(
            "research-4",
            "Fact-check the summary",
            weft_core::types::WorkerType::Qa,
            "Verify the claims in the summary",
        );
        assert!(engine.modify(&sid, ModifyOp::AddStep {
            position: None,
            step: extra,
        }));
        assert_eq!(engine.get_status(&sid).unwrap().total_steps, 4);

        assert!(!engine.modify(&sid, ModifyOp::RemoveStep { index: 99 }));

        engine.interrupt(&sid);
        let events: Vec<WorkflowEvent> = feed.collect().await;
        assert!(matches!(
            events.last().unwrap(),
            WorkflowEvent::WorkflowInterrupted { .. }
        ));
        // The added step is accounted for in the interrupted placeholders
        assert_eq!(engine.get_status(&sid).unwrap().steps.len(), 4);
    }

    #[tokio::test]
    async fn test_modify_rejected_after_completion() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Arc::new(MockWorker::new(WorkerScript::chunks(&["done"])));
        let engine = engine_with(worker, dir.path());

        let (sid, feed) = engine
            .start("Research AI trends", ExecOptions::default())
            .unwrap();
        let _events: Vec<WorkflowEvent> = feed.collect().await;

        assert!(!engine.modify(&sid, ModifyOp::RemoveStep { index: 0 }));
    }

    #[tokio::test]
    async fn test_parallel_group_runs_independent_steps_together() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Arc::new(MockWorker::new(WorkerScript::chunks(&["alpha beta"])));
        let engine = engine_with(worker.clone(), dir.path());

        let (sid, feed) = engine
            .start("Research AI trends", ExecOptions { parallel: true })
            .unwrap();

        // Rework the plan into three independent steps before the driver's
        // first poll snapshots it
        let replacements = [
            ("fan-1", WorkerType::Researcher, "survey the landscape", "survey.md"),
            ("fan-2", WorkerType::Writer, "draft the briefing", "briefing.md"),
            ("fan-3", WorkerType::Analyst, "tabulate the figures", "figures.md"),
        ];
        for (i, (id, worker_type, task, artifact)) in replacements.iter().enumerate() {
            assert!(engine.modify(
                &sid,
                ModifyOp::ReplaceStep {
                    index: i,
                    step: Step::new(*id, *task, *worker_type, *task).with_output(*artifact),
                }
            ));
        }

        let events: Vec<WorkflowEvent> = feed.collect().await;

        match events
            .iter()
            .find(|e| matches!(e, WorkflowEvent::ParallelGroupStarted { .. }))
        {
            Some(WorkflowEvent::ParallelGroupStarted {
                group,
                total_groups,
                worker_types,
                ..
            }) => {
                assert_eq!(*group, 1);
                assert_eq!(*total_groups, 1);
                assert_eq!(worker_types.len(), 3);
            }
            _ => panic!("expected a ParallelGroupStarted event"),
        }
        assert_eq!(
            count(&events, |e| matches!(e, WorkflowEvent::StepCompleted { .. })),
            3
        );
        assert_eq!(
            count(&events, |e| matches!(
                e,
                WorkflowEvent::ParallelGroupCompleted { .. }
            )),
            1
        );
        match events.last().unwrap() {
            WorkflowEvent::WorkflowCompleted { metrics, .. } => {
                assert_eq!(metrics.completed_runs, 3);
            }
            other => panic!("expected WorkflowCompleted, got {other:?}"),
        }

        // Results settle in plan order regardless of merge interleaving
        let session = engine.get_status(&sid).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        let ids: Vec<&str> = session.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["fan-1", "fan-2", "fan-3"]);

        let workspace = match &events[0] {
            WorkflowEvent::WorkflowStarted { workspace, .. } => PathBuf::from(workspace),
            _ => unreachable!(),
        };
        for artifact in ["survey.md", "briefing.md", "figures.md"] {
            assert!(workspace.join(artifact).exists(), "missing {artifact}");
        }
    }

    #[tokio::test]
    async fn test_parallel_mode_on_chained_plan_matches_sequential() {
        // Research template steps form a linear artifact chain, so parallel
        // mode degenerates to singleton groups with no group events
        let dir = tempfile::tempdir().unwrap();
        let worker = Arc::new(MockWorker::new(WorkerScript::chunks(&["a b c"])));
        let engine = engine_with(worker, dir.path());

        let (sid, feed) = engine
            .start("Research AI trends", ExecOptions { parallel: true })
            .unwrap();
        let events: Vec<WorkflowEvent> = feed.collect().await;

        assert_eq!(
            count(&events, |e| matches!(e, WorkflowEvent::StepCompleted { .. })),
            3
        );
        assert_eq!(
            count(&events, |e| matches!(
                e,
                WorkflowEvent::ParallelGroupStarted { .. }
            )),
            0
        );
        assert!(matches!(
            events.last().unwrap(),
            WorkflowEvent::WorkflowCompleted { .. }
        ));
        assert_eq!(
            engine.get_status(&sid).unwrap().status,
            SessionStatus::Completed
        );
    }
}
