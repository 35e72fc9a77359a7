use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// One spawned child process tracked on behalf of a project.
///
/// Everything except `port` is fixed at spawn time. The handle is plain data:
/// the `Child` itself stays with the task that reaps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub id: Uuid,
    pub project_id: String,
    pub pid: u32,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub port: Option<u16>,
    pub started_at: DateTime<Utc>,
}

impl ProcessHandle {
    /// Command line as it would be typed in a shell, for logs and UIs.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// How to launch a project's dev server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevServerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub port: Option<u16>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Source of a captured output line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
            LogStream::System => "system",
        }
    }
}

/// Dev server log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevServerLog {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

/// Signal escalation level used by the terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    /// SIGTERM on unix, plain `taskkill` elsewhere
    Graceful,
    /// SIGKILL on unix, `taskkill /F` elsewhere
    Forceful,
}

/// Outcome of one `ensure_ports_freed` pass.
///
/// A port only lands in `freed` after a re-probe saw nothing killable bound to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCleanupReport {
    pub freed: Vec<u16>,
    pub still_busy: Vec<u16>,
    pub skipped_reserved: Vec<u16>,
}

impl PortCleanupReport {
    pub fn all_freed(&self) -> bool {
        self.still_busy.is_empty()
    }
}

/// Error types for process operations
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Refusing to terminate protected PID {pid}")]
    ProtectedPid { pid: u32 },

    #[error("Port {port} is reserved for the host application")]
    ReservedPort { port: u16 },

    #[error("Port {port} is still in use after cleanup")]
    PortBusy { port: u16 },

    #[error("Failed to spawn process '{command}': {error}")]
    SpawnFailed { command: String, error: String },

    #[error("Failed to signal process with PID {pid}: {error}")]
    SignalFailed { pid: u32, error: String },

    #[error("Invalid project id '{project_id}': {reason}")]
    InvalidProjectId { project_id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    /// Short message for UIs. The detailed cause is only logged.
    pub fn user_message(&self) -> &'static str {
        match self {
            ProcessError::ProtectedPid { .. } => "This process is protected and cannot be stopped",
            ProcessError::ReservedPort { .. } => "This port is reserved by the application",
            ProcessError::PortBusy { .. } => "Port is still in use",
            ProcessError::SpawnFailed { .. } => "Failed to start process",
            ProcessError::SignalFailed { .. } => "Failed to stop process",
            ProcessError::InvalidProjectId { .. } => "Invalid project id",
            ProcessError::Io(_) => "Process operation failed",
        }
    }
}

/// Result type for process operations
pub type ProcessResult<T> = Result<T, ProcessError>;
