use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::WorkerType;

/// Task categories a goal can be classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Research,
    Development,
    Writing,
    Analysis,
    Design,
    Mixed,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Development => "development",
            Self::Writing => "writing",
            Self::Analysis => "analysis",
            Self::Design => "design",
            Self::Mixed => "mixed",
        }
    }
}

/// One unit of work assigned to a worker type.
///
/// `input_artifacts` name files that must exist before the step may start;
/// they form an implicit DAG over the plan even though templates emit a
/// linear chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub description: String,
    pub worker_type: WorkerType,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_artifact: Option<String>,
    #[serde(default)]
    pub input_artifacts: Vec<String>,
    #[serde(default)]
    pub requires_approval: bool,
}

impl Step {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        worker_type: WorkerType,
        task: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            worker_type,
            task: task.into(),
            output_artifact: None,
            input_artifacts: vec![],
            requires_approval: false,
        }
    }

    pub fn with_output(mut self, artifact: impl Into<String>) -> Self {
        self.output_artifact = Some(artifact.into());
        self
    }

    pub fn with_inputs(mut self, artifacts: Vec<String>) -> Self {
        self.input_artifacts = artifacts;
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

/// Ordered step sequence derived from a goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub category: TaskCategory,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(goal: impl Into<String>, category: TaskCategory, steps: Vec<Step>) -> Self {
        Self {
            goal: goal.into(),
            category,
            steps,
        }
    }

    /// Verify that every step's inputs are produced by a strictly earlier
    /// step. Returns the first violating (step id, artifact) pair.
    pub fn check_dependencies(&self) -> Option<(&str, &str)> {
        let mut produced: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            for input in &step.input_artifacts {
                if !produced.contains(input.as_str()) {
                    return Some((step.id.as_str(), input.as_str()));
                }
            }
            if let Some(out) = &step.output_artifact {
                produced.insert(out.as_str());
            }
        }
        None
    }
}
