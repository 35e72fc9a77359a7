// ABOUTME: In-memory job registry keyed by job id with one lock per job
// ABOUTME: Status changes and log appends go through JobEntry so terminal jobs stay frozen

use crate::types::{Job, JobEvent, JobStatus, JobUpdate, LogEntry};
use chrono::Utc;
use foreman_process::LogStream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tracing::debug;

/// Default capacity for per-job update channels
const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// A job plus everything needed to mutate it safely.
pub(crate) struct JobEntry {
    pub(crate) job: Job,
    /// Set while the spawned root process has not been reaped.
    pub(crate) process_running: bool,
    /// Wakes the driver, which owns the child and performs the kill.
    pub(crate) cancel: Arc<Notify>,
    seq: u64,
    updates: broadcast::Sender<JobUpdate>,
}

impl JobEntry {
    /// Apply `event` to the job. Returns `false` when the transition is illegal
    /// (most importantly: anything after a terminal status).
    pub(crate) fn apply(&mut self, event: JobEvent) -> bool {
        self.apply_with_log(event, None)
    }

    /// Like [`apply`](Self::apply) but appends `message` as the last log line
    /// before the status changes, so the line survives a terminal transition.
    pub(crate) fn apply_with_log(&mut self, event: JobEvent, message: Option<String>) -> bool {
        let Some(next) = self.job.status.apply(&event) else {
            debug!(
                "Ignoring {:?} for job {} in status {}",
                event, self.job.id, self.job.status
            );
            return false;
        };

        if let Some(message) = message {
            self.push_log(LogStream::System, message);
        }

        let now = Utc::now();
        match next {
            JobStatus::Running => self.job.started_at = Some(now),
            status if status.is_terminal() => self.job.completed_at = Some(now),
            _ => {}
        }
        self.job.status = next;
        let _ = self.updates.send(JobUpdate::Status(next));
        true
    }

    /// Append a log line. Discarded once the job is terminal.
    pub(crate) fn push_log(&mut self, stream: LogStream, message: String) -> bool {
        if self.job.status.is_terminal() {
            return false;
        }
        let entry = LogEntry::new(stream, message);
        self.job.logs.push(entry.clone());
        // No receivers is fine
        let _ = self.updates.send(JobUpdate::Log(entry));
        true
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.updates.subscribe()
    }
}

pub(crate) type JobSlot = Arc<Mutex<JobEntry>>;

/// Every job created in this process, active and terminal.
///
/// The map lock is only held to insert, look up or remove a slot; the job itself
/// is mutated under its own slot lock.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<String, JobSlot>>>,
    next_seq: Arc<AtomicU64>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn insert(&self, job: Job) -> JobSlot {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let id = job.id.clone();
        let slot = Arc::new(Mutex::new(JobEntry {
            job,
            process_running: false,
            cancel: Arc::new(Notify::new()),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            updates,
        }));
        self.jobs.write().await.insert(id, slot.clone());
        slot
    }

    pub(crate) async fn slot(&self, id: &str) -> Option<JobSlot> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Snapshot of one job.
    pub async fn get(&self, id: &str) -> Option<Job> {
        let slot = self.slot(id).await?;
        let entry = slot.lock().await;
        Some(entry.job.clone())
    }

    /// Snapshots of a project's jobs, most recent first.
    pub async fn list_for_project(&self, project_id: &str) -> Vec<Job> {
        let slots: Vec<JobSlot> = self.jobs.read().await.values().cloned().collect();

        let mut jobs = Vec::new();
        for slot in slots {
            let entry = slot.lock().await;
            if entry.job.project_id == project_id {
                jobs.push((entry.seq, entry.job.clone()));
            }
        }
        jobs.sort_by(|a, b| b.0.cmp(&a.0));
        jobs.into_iter().map(|(_, job)| job).collect()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Drop a terminal job. Active jobs are kept.
    pub async fn remove_terminal(&self, id: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(slot) = jobs.get(id).cloned() else {
            return false;
        };
        if !slot.lock().await.job.status.is_terminal() {
            return false;
        }
        jobs.remove(id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn job(id: &str, project_id: &str) -> Job {
        Job {
            id: id.to_string(),
            project_id: project_id.to_string(),
            job_type: "frontend:test".to_string(),
            display_name: "Frontend Test".to_string(),
            command: "npm".to_string(),
            args: vec!["test".to_string()],
            cwd: PathBuf::from("/tmp"),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            signal: None,
            pid: None,
            error: None,
            logs: Vec::new(),
            summary: None,
        }
    }

    #[tokio::test]
    async fn test_list_for_project_is_most_recent_first() {
        let registry = JobRegistry::new();
        registry.insert(job("a", "web")).await;
        registry.insert(job("b", "api")).await;
        registry.insert(job("c", "web")).await;
        registry.insert(job("d", "web")).await;

        let ids: Vec<String> = registry
            .list_for_project("web")
            .await
            .into_iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(ids, vec!["d", "c", "a"]);
        assert!(registry.list_for_project("nope").await.is_empty());
    }

    #[tokio::test]
    async fn test_transitions_stamp_timestamps_and_notify() {
        let registry = JobRegistry::new();
        let slot = registry.insert(job("a", "web")).await;
        let mut entry = slot.lock().await;
        let mut updates = entry.subscribe();

        assert!(entry.apply(JobEvent::SpawnRequested));
        assert!(entry.apply(JobEvent::Spawned));
        assert!(entry.job.started_at.is_some());
        assert!(entry.job.completed_at.is_none());
        assert!(entry.apply(JobEvent::Exited { success: true }));
        assert!(entry.job.completed_at.is_some());

        assert_eq!(updates.try_recv().unwrap(), JobUpdate::Status(JobStatus::Starting));
        assert_eq!(updates.try_recv().unwrap(), JobUpdate::Status(JobStatus::Running));
        assert_eq!(updates.try_recv().unwrap(), JobUpdate::Status(JobStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_terminal_job_rejects_logs_and_transitions() {
        let registry = JobRegistry::new();
        let slot = registry.insert(job("a", "web")).await;
        let mut entry = slot.lock().await;

        assert!(entry.push_log(LogStream::Stdout, "before".to_string()));
        assert!(entry.apply_with_log(JobEvent::Cancel, Some("Job cancelled".to_string())));
        let completed_at = entry.job.completed_at;

        assert!(!entry.push_log(LogStream::Stdout, "late".to_string()));
        assert!(!entry.apply(JobEvent::Exited { success: true }));
        assert!(!entry.apply_with_log(JobEvent::Cancel, Some("again".to_string())));

        let messages: Vec<&str> = entry.job.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["before", "Job cancelled"]);
        assert_eq!(entry.job.status, JobStatus::Cancelled);
        assert_eq!(entry.job.completed_at, completed_at);
    }

    #[tokio::test]
    async fn test_remove_terminal_only() {
        let registry = JobRegistry::new();
        let slot = registry.insert(job("a", "web")).await;

        assert!(!registry.remove_terminal("a").await);
        assert!(!registry.remove_terminal("missing").await);

        slot.lock().await.apply(JobEvent::Cancel);
        assert!(registry.remove_terminal("a").await);
        assert!(registry.get("a").await.is_none());
        assert!(registry.is_empty().await);
    }
}
