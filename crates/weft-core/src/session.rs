use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{RunId, SessionId, WorkerType};

/// Lifecycle of a workflow session. Terminal once it leaves `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Lifecycle of a single plan step within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
}

/// Outcome record for one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub description: String,
    pub worker_type: WorkerType,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// Accumulated text output of the worker run.
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub words: u64,
    pub tokens: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregated metrics for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub total_words: u64,
    pub total_tokens: u64,
    pub total_tool_calls: u64,
    pub completed_runs: u64,
    /// Mean wall-clock seconds per completed run.
    pub avg_response_secs: f64,
}

/// Runtime record of one plan's execution.
///
/// Owned exclusively by the execution engine; other components read
/// copy-on-read snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub session_id: SessionId,
    pub goal: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub metrics: WorkflowMetrics,
}

impl WorkflowSession {
    pub fn new(session_id: SessionId, goal: impl Into<String>) -> Self {
        Self {
            session_id,
            goal: goal.into(),
            status: SessionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            current_step_index: 0,
            total_steps: 0,
            steps: vec![],
            metrics: WorkflowMetrics::default(),
        }
    }

    /// Fraction of steps that reached a terminal state, in [0, 1].
    pub fn progress(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        let done = self
            .steps
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    StepStatus::Completed | StepStatus::Failed | StepStatus::Interrupted
                )
            })
            .count();
        done as f64 / self.total_steps as f64
    }
}
