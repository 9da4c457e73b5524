//! Workflow execution engine: drives planned steps through the stream
//! multiplexer, sequentially or as parallel groups of independent steps.

pub mod engine;
pub mod grouping;

pub use engine::{ExecOptions, ModifyOp, WorkflowEngine};
pub use grouping::group_steps;
