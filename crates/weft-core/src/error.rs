use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Worker invocation errors
    #[error("Worker invocation failed: {0}")]
    Worker(String),

    #[error("Worker stream error: {0}")]
    Stream(String),

    // Engine errors
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run exceeded timeout ({0}s)")]
    Timeout(u64),

    // Scheduler errors
    #[error("Invalid schedule: {0}")]
    Schedule(String),

    #[error("Schedule entry not found: {0}")]
    ScheduleNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WeftError>;
