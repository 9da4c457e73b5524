//! Workflow orchestration core.
//!
//! A goal is decomposed into typed steps, each dispatched to a specialized
//! worker that streams incremental output; execution is interruptible,
//! progress is persisted, and workflows can be re-run on a schedule.
//!
//! [`WorkflowService`] wires the pieces together behind the control surface
//! front-ends consume: start/interrupt/status for live workflows, schedule
//! management for recurring ones, and a broadcast event feed.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

pub use weft_core::config::AppConfig;
pub use weft_core::error::{Result, WeftError};
pub use weft_core::event::{EventBus, WorkflowEvent};
pub use weft_core::plan::{Plan, Step, TaskCategory};
pub use weft_core::session::{SessionStatus, StepResult, StepStatus, WorkflowSession};
pub use weft_core::traits::{ProgressSink, ProgressUpdate, WorkerClient, WorkerDelta, WorkerRequest};
pub use weft_core::types::{AgentRun, RunId, SessionId, WorkerType};
pub use weft_engine::{ExecOptions, ModifyOp, WorkflowEngine};
pub use weft_monitor::{MonitorState, ProgressMonitor};
pub use weft_planner::{classify, plan};
pub use weft_scheduler::{
    IntervalUnit, ScheduleEntry, ScheduleSpec, ScheduleStatus, Scheduler, UpcomingRun,
};
pub use weft_stream::StreamMux;

/// Everything wired together: engine, monitor, and scheduler sharing one
/// event bus and worker client.
pub struct WorkflowService {
    event_bus: Arc<EventBus>,
    engine: Arc<WorkflowEngine>,
    monitor: Arc<ProgressMonitor>,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkflowService {
    pub fn new(config: AppConfig, worker: Arc<dyn WorkerClient>) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let monitor = Arc::new(ProgressMonitor::new(&config.monitor));
        let mux = Arc::new(StreamMux::new(worker, config.stream.clone()));
        let engine = Arc::new(WorkflowEngine::new(
            mux,
            event_bus.clone(),
            config.workspace.base_path(),
            Some(monitor.clone() as Arc<dyn ProgressSink>),
        ));
        let scheduler = Arc::new(Scheduler::new(&config.scheduler, engine.clone()));

        Self {
            event_bus,
            engine,
            monitor,
            scheduler,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the monitor persistence loop and the scheduler poll loop.
    /// Idempotent workflows can run without this; scheduled ones cannot.
    pub fn start_background(&self) {
        let mut background = self.background.lock().unwrap();

        let monitor = self.monitor.clone();
        let cancel = self.shutdown.clone();
        background.push(tokio::spawn(async move { monitor.run(cancel).await }));

        let scheduler = self.scheduler.clone();
        let cancel = self.shutdown.clone();
        background.push(tokio::spawn(async move { scheduler.run(cancel).await }));
    }

    /// Start a workflow for a goal; returns the session id and its live
    /// event feed.
    pub fn start_workflow(
        &self,
        goal: &str,
        options: ExecOptions,
    ) -> Result<(SessionId, ReceiverStream<WorkflowEvent>)> {
        self.engine.start(goal, options)
    }

    /// Cancel a running workflow. False if unknown or already terminal.
    pub fn interrupt_workflow(&self, session_id: &SessionId) -> bool {
        self.engine.interrupt(session_id)
    }

    /// Apply a runtime plan modification to a running workflow.
    pub fn modify_workflow(&self, session_id: &SessionId, op: ModifyOp) -> bool {
        self.engine.modify(session_id, op)
    }

    /// Snapshot of one workflow session.
    pub fn get_workflow_status(&self, session_id: &SessionId) -> Option<WorkflowSession> {
        self.engine.get_status(session_id)
    }

    /// Register a workflow to run on a schedule; returns the entry id.
    pub async fn schedule_workflow(
        &self,
        name: impl Into<String>,
        goal: impl Into<String>,
        spec: ScheduleSpec,
        max_runs: Option<u32>,
    ) -> Result<String> {
        self.scheduler.schedule(name, goal, spec, max_runs).await
    }

    /// Snapshots of all schedule entries.
    pub fn list_scheduled(&self) -> Vec<ScheduleEntry> {
        self.scheduler.list()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn monitor(&self) -> &ProgressMonitor {
        &self.monitor
    }

    /// Subscribe to the cross-session event feed.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.event_bus.subscribe()
    }

    /// Stop background loops and flush persisted state. Safe to call once;
    /// further workflow starts remain possible but nothing persists them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.background.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task did not shut down cleanly");
            }
        }
    }
}

/// Initialize tracing for binaries embedding the service. Respects
/// `RUST_LOG`, defaulting to info for this crate family.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .init();
}
