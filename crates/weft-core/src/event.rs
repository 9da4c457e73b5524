use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session::{StepResult, WorkflowMetrics};
use crate::types::{RunId, SessionId, WorkerType};

/// Step summary included in the `workflow_planned` event.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedStep {
    pub step: usize,
    pub description: String,
    pub worker_type: WorkerType,
}

/// Live progress feed: an ordered sequence of tagged events per session.
///
/// Serialized with a `type` tag so front-ends can consume the feed over a
/// socket without knowing the Rust types.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        session_id: SessionId,
        goal: String,
        workspace: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowPlanned {
        session_id: SessionId,
        category: String,
        total_steps: usize,
        steps: Vec<PlannedStep>,
    },
    StepStarted {
        session_id: SessionId,
        step: usize,
        total_steps: usize,
        description: String,
        worker_type: WorkerType,
    },
    TextChunk {
        session_id: SessionId,
        step: usize,
        run_id: RunId,
        content: String,
        word_count: u64,
        progress: f64,
    },
    ToolUse {
        session_id: SessionId,
        step: usize,
        run_id: RunId,
        name: String,
        input: serde_json::Value,
    },
    StepCompleted {
        session_id: SessionId,
        step: usize,
        result: StepResult,
    },
    ParallelGroupStarted {
        session_id: SessionId,
        group: usize,
        total_groups: usize,
        worker_types: Vec<WorkerType>,
    },
    ParallelGroupCompleted {
        session_id: SessionId,
        group: usize,
    },
    WorkflowModified {
        session_id: SessionId,
        modification: String,
    },
    ModificationFailed {
        session_id: SessionId,
        reason: String,
    },
    WorkflowCompleted {
        session_id: SessionId,
        total_steps: usize,
        metrics: WorkflowMetrics,
        timestamp: DateTime<Utc>,
    },
    WorkflowInterrupted {
        session_id: SessionId,
        reason: String,
    },
    WorkflowError {
        session_id: SessionId,
        message: String,
    },
}

impl WorkflowEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::WorkflowStarted { session_id, .. }
            | Self::WorkflowPlanned { session_id, .. }
            | Self::StepStarted { session_id, .. }
            | Self::TextChunk { session_id, .. }
            | Self::ToolUse { session_id, .. }
            | Self::StepCompleted { session_id, .. }
            | Self::ParallelGroupStarted { session_id, .. }
            | Self::ParallelGroupCompleted { session_id, .. }
            | Self::WorkflowModified { session_id, .. }
            | Self::ModificationFailed { session_id, .. }
            | Self::WorkflowCompleted { session_id, .. }
            | Self::WorkflowInterrupted { session_id, .. }
            | Self::WorkflowError { session_id, .. } => session_id,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
