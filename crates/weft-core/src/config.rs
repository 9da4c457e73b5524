use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level weft configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Where per-session workspaces and their artifacts live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_dir")]
    pub base_dir: String,
}

impl WorkspaceConfig {
    pub fn base_path(&self) -> PathBuf {
        PathBuf::from(&self.base_dir)
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: default_workspace_dir(),
        }
    }
}

/// Stream multiplexer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Per-producer bounded buffer; a full buffer blocks the producer
    /// instead of dropping events.
    #[serde(default = "default_stream_buffer")]
    pub buffer: usize,
    /// Default wall-clock timeout per run. Exceeding it is treated as
    /// cancellation.
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer: default_stream_buffer(),
            run_timeout_secs: default_run_timeout(),
        }
    }
}

/// Progress monitor persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_state_file")]
    pub state_file: String,
    #[serde(default = "default_persist_interval")]
    pub persist_interval_secs: u64,
    /// Sessions idle longer than this are evicted from memory during the
    /// periodic sweep (the persisted file keeps them).
    #[serde(default = "default_staleness")]
    pub staleness_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            state_file: default_monitor_state_file(),
            persist_interval_secs: default_persist_interval(),
            staleness_secs: default_staleness(),
        }
    }
}

/// Recurrence scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_schedule_file")]
    pub state_file: String,
    #[serde(default = "default_tick")]
    pub tick_secs: u64,
    /// Grace period for draining in-flight runs at shutdown before they
    /// are force-cancelled.
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            state_file: default_schedule_file(),
            tick_secs: default_tick(),
            shutdown_grace_secs: default_grace(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: WorkspaceConfig::default(),
            stream: StreamConfig::default(),
            monitor: MonitorConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(WeftError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| WeftError::Config(e.to_string()))
    }

    /// Load from a file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(_) => Self::default(),
        }
    }
}

fn default_workspace_dir() -> String {
    "workspaces".to_string()
}

fn default_stream_buffer() -> usize {
    100
}

fn default_run_timeout() -> u64 {
    300
}

fn default_monitor_state_file() -> String {
    "monitoring_state.json".to_string()
}

fn default_persist_interval() -> u64 {
    60
}

fn default_staleness() -> u64 {
    3600
}

fn default_schedule_file() -> String {
    "scheduled_workflows.json".to_string()
}

fn default_tick() -> u64 {
    60
}

fn default_grace() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.workspace.base_dir, "workspaces");
        assert_eq!(config.stream.buffer, 100);
        assert_eq!(config.scheduler.tick_secs, 60);
        assert_eq!(config.monitor.staleness_secs, 3600);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml_src = r#"
            [scheduler]
            tick_secs = 5

            [stream]
            buffer = 8
        "#;
        let config: AppConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.scheduler.tick_secs, 5);
        assert_eq!(config.stream.buffer, 8);
        // Untouched sections keep defaults
        assert_eq!(config.monitor.persist_interval_secs, 60);
        assert_eq!(config.workspace.base_dir, "workspaces");
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/weft.toml")).unwrap_err();
        assert!(matches!(err, WeftError::ConfigNotFound(_)));
    }
}
