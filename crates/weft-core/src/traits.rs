use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::session::WorkflowSession;
use crate::types::AgentRun;

/// Request handed to the worker invocation client for one step.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub system_prompt: String,
    pub prompt: String,
    pub allowed_capabilities: Vec<String>,
    pub max_turns: usize,
}

/// Low-level event emitted by the worker invocation client.
///
/// The stream multiplexer wraps these into metric-carrying run events;
/// nothing else in the workspace consumes them directly.
#[derive(Debug, Clone)]
pub enum WorkerDelta {
    /// A chunk of generated text.
    Text(String),
    /// The worker invoked a capability.
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    /// Token usage update.
    Usage { tokens: u64 },
}

/// Worker invocation client — the external collaborator that turns a task
/// into a stream of output events. Within one stream, deltas are strictly
/// ordered.
pub trait WorkerClient: Send + Sync + 'static {
    fn invoke(
        &self,
        request: WorkerRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<WorkerDelta>>>>;
}

/// State transition pushed from the engine to passive observers.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    SessionUpserted(WorkflowSession),
    RunUpserted(AgentRun),
}

/// Passive observer of engine state transitions.
pub trait ProgressSink: Send + Sync + 'static {
    fn record(&self, update: ProgressUpdate);
}
