use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique workflow session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one worker run (one step execution).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Run ids embed the worker type for readable logs, e.g.
    /// `researcher-3f2a9c1d`.
    pub fn new(worker_type: WorkerType) -> Self {
        let suffix = &Uuid::new_v4().to_string()[..8];
        Self(format!("{}-{}", worker_type.as_str(), suffix))
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of specialist worker types a step can be assigned to.
///
/// Each variant carries a static profile (system prompt, capability
/// allowlist, turn budget) so dispatch is exhaustiveness-checked instead of
/// keyed on free-form strings.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    Researcher,
    Coder,
    Writer,
    Analyst,
    Designer,
    Qa,
}

impl WorkerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Researcher => "researcher",
            Self::Coder => "coder",
            Self::Writer => "writer",
            Self::Analyst => "analyst",
            Self::Designer => "designer",
            Self::Qa => "qa",
        }
    }

    /// Static invocation profile for this worker type.
    pub fn profile(&self) -> &'static WorkerProfile {
        match self {
            Self::Researcher => &WorkerProfile {
                system_prompt: "You are a research specialist. Gather, synthesize, and present \
                    information in a clear, structured manner. Use credible sources and verify \
                    facts. Present findings in well-organized bullet points with attribution.",
                capabilities: &["search_web", "write_md", "read_files"],
                max_turns: 8,
            },
            Self::Coder => &WorkerProfile {
                system_prompt: "You are a senior software developer. Write clean, well-documented, \
                    efficient code. Follow best practices and include error handling where it \
                    matters.",
                capabilities: &["write_md", "write_file", "read_files", "list_directory"],
                max_turns: 6,
            },
            Self::Writer => &WorkerProfile {
                system_prompt: "You are a professional writer and content creator. Create \
                    engaging, clear, well-structured content adapted to the target audience.",
                capabilities: &["write_md", "read_files"],
                max_turns: 6,
            },
            Self::Analyst => &WorkerProfile {
                system_prompt: "You are a data analyst and trend specialist. Analyze patterns, \
                    identify trends, and provide actionable insights backed by evidence.",
                capabilities: &["search_web", "write_md", "read_files", "analyze_data"],
                max_turns: 7,
            },
            Self::Designer => &WorkerProfile {
                system_prompt: "You are a system architect and designer. Create scalable, \
                    maintainable designs with clear documentation.",
                capabilities: &["write_md", "create_diagram", "read_files"],
                max_turns: 5,
            },
            Self::Qa => &WorkerProfile {
                system_prompt: "You are a quality assurance specialist. Test, validate, and \
                    verify deliverables. Identify issues and provide detailed reports.",
                capabilities: &["write_md", "test_code", "read_files", "validate_output"],
                max_turns: 5,
            },
        }
    }
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static configuration for invoking one worker type.
#[derive(Debug)]
pub struct WorkerProfile {
    pub system_prompt: &'static str,
    pub capabilities: &'static [&'static str],
    pub max_turns: usize,
}

/// Lifecycle of a single worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Starting,
    Running,
    Paused,
    Completed,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Interrupted)
    }
}

/// Runtime record of one step execution against the worker client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub run_id: RunId,
    pub worker_type: WorkerType,
    pub task: String,
    pub status: RunStatus,
    /// Progress estimate in [0, 1]. Heuristic while streaming, 1.0 on
    /// completion.
    pub progress: f64,
    pub current_step_label: String,
    pub tokens_used: u64,
    pub words_generated: u64,
    pub tool_calls: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl AgentRun {
    pub fn new(run_id: RunId, worker_type: WorkerType, task: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            worker_type,
            task: task.into(),
            status: RunStatus::Starting,
            progress: 0.0,
            current_step_label: "Initializing".to_string(),
            tokens_used: 0,
            words_generated: 0,
            tool_calls: 0,
            started_at: now,
            last_activity: now,
        }
    }
}
