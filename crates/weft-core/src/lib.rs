pub mod config;
pub mod error;
pub mod event;
pub mod plan;
pub mod session;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, WeftError};
pub use event::{EventBus, WorkflowEvent};
pub use plan::{Plan, Step, TaskCategory};
pub use session::{SessionStatus, StepResult, StepStatus, WorkflowMetrics, WorkflowSession};
pub use types::*;
