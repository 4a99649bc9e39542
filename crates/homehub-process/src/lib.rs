use std::fmt;

use chrono::{DateTime, Utc};

/// Stable application identifier: the key of an entry under `apps:` in the
/// hub config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct AppId(pub String);

impl AppId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl ProcessState {
    /// A launch is underway or already succeeded; another start is a no-op.
    pub fn is_active(self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatus {
    pub app_id: AppId,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
    pub message: Option<String>,
}

/// One card of the hub dashboard: static metadata plus reconciled status.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AppSummary {
    pub id: AppId,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub color: String,
    pub host: String,
    pub port: u16,
    pub url: String,
    pub idle_timeout_secs: u64,
    pub status: ProcessStatus,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HubInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IdleEntry {
    pub app_id: AppId,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub idle_secs: u64,
    pub timeout_secs: u64,
    pub secs_until_shutdown: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub check_interval_secs: u64,
    pub default_idle_timeout_secs: u64,
    pub apps: Vec<IdleEntry>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealthReport {
    pub app_id: AppId,
    pub healthy: bool,
    pub url: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    #[default]
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogTail {
    pub app_id: AppId,
    pub stream: LogStream,
    pub path: String,
    pub lines: Vec<String>,
    /// Current size of the log file; zero when it does not exist yet.
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_snake_case() {
        let v = serde_json::to_value(ProcessState::Crashed).unwrap();
        assert_eq!(v, serde_json::json!("crashed"));
    }

    #[test]
    fn only_starting_and_running_are_active() {
        assert!(ProcessState::Starting.is_active());
        assert!(ProcessState::Running.is_active());
        assert!(!ProcessState::Stopping.is_active());
        assert!(!ProcessState::Stopped.is_active());
        assert!(!ProcessState::Crashed.is_active());
    }

    #[test]
    fn app_id_is_transparent_on_the_wire() {
        let id = AppId::from("demo");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"demo\"");
        assert_eq!(id.to_string(), "demo");
    }
}
