// ABOUTME: Job records, spawn options, log entries and error types for tracked jobs
// ABOUTME: Everything here is plain data; transitions live in state.rs

use chrono::{DateTime, Utc};
use foreman_process::LogStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Starting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// `succeeded`, `failed` and `cancelled` are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Starting => "starting",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to a job's process. Fed to [`JobStatus::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    SpawnRequested,
    Spawned,
    Exited { success: bool },
    SpawnFailed,
    Cancel,
}

/// One captured output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

impl LogEntry {
    pub fn new(stream: LogStream, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            message: message.into(),
        }
    }
}

/// A tracked invocation of a build/test/lint command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub project_id: String,
    pub job_type: String,
    pub display_name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Signal number that terminated the process, unix only.
    pub signal: Option<i32>,
    pub pid: Option<u32>,
    /// Spawn or wait error, if that is how the job failed.
    pub error: Option<String>,
    pub logs: Vec<LogEntry>,
    /// Opaque result attached by the caller (coverage figures etc.).
    pub summary: Option<serde_json::Value>,
}

/// Spawn options for [`crate::JobRunner::start_job`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    pub project_id: String,
    pub cwd: PathBuf,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Defaults to a title-cased job type.
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Ports to free before spawning, for jobs that replace a running server.
    #[serde(default)]
    pub free_ports: Vec<u16>,
}

/// Live notifications for a single job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    Log(LogEntry),
    Status(JobStatus),
}

/// `frontend:test` → `Frontend Test`
pub fn display_name_for(job_type: &str) -> String {
    job_type
        .split(|c: char| c == ':' || c == '-' || c == '_' || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job options: {reason}")]
    InvalidOptions { reason: String },

    #[error("Job not found: {id}")]
    NotFound { id: String },
}

impl JobError {
    /// Short message for UIs. The detailed cause is only logged.
    pub fn user_message(&self) -> &'static str {
        match self {
            JobError::InvalidOptions { .. } => "Failed to run job",
            JobError::NotFound { .. } => "Job not found",
        }
    }
}

pub type JobResult<T> = Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_for_job_types() {
        assert_eq!(display_name_for("frontend:test"), "Frontend Test");
        assert_eq!(display_name_for("backend:test"), "Backend Test");
        assert_eq!(display_name_for("lint"), "Lint");
        assert_eq!(display_name_for("e2e:run-all"), "E2e Run All");
        assert_eq!(display_name_for(""), "");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_value(JobStatus::Cancelled).unwrap();
        assert_eq!(json, serde_json::json!("cancelled"));
        assert_eq!(JobStatus::Running.to_string(), "running");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Starting.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
