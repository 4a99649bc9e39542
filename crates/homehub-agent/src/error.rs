use std::path::PathBuf;

use homehub_process::AppId;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("app not found: {0}")]
    NotFound(String),

    /// Working directory or entry point missing, spawn failure, or the
    /// child exited during its startup grace period.
    #[error("failed to launch {app_id}: {message}")]
    Launch {
        app_id: AppId,
        message: String,
        details: Option<String>,
    },

    #[error("port {port} for {app_id} is already bound by another process")]
    PortConflict { app_id: AppId, port: u16 },

    #[error("{app_id} did not become healthy within {timeout_ms}ms")]
    HealthCheckTimeout { app_id: AppId, timeout_ms: u64 },

    #[error("read log {}: {source}", .path.display())]
    LogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LifecycleError {
    /// Stable machine-readable kind.
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::NotFound(_) => "not_found",
            LifecycleError::Launch { .. } => "launch_error",
            LifecycleError::PortConflict { .. } => "port_conflict",
            LifecycleError::HealthCheckTimeout { .. } => "health_check_timeout",
            LifecycleError::LogRead { .. } => "log_read_failed",
        }
    }

    pub fn details(&self) -> Option<&str> {
        match self {
            LifecycleError::Launch { details, .. } => details.as_deref(),
            _ => None,
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            LifecycleError::Launch { .. } => {
                Some("Check the app's path and command, then look at its stderr log.")
            }
            LifecycleError::PortConflict { .. } => {
                Some("Stop whatever is listening on the port, or change the app's port.")
            }
            LifecycleError::HealthCheckTimeout { .. } => {
                Some("The process started but never answered its health endpoint.")
            }
            _ => None,
        }
    }
}
