// ABOUTME: Spawns tracked jobs, captures their output and drives them to a terminal status
// ABOUTME: Cancellation and natural exit race through the same per-job lock

use crate::registry::{JobRegistry, JobSlot};
use crate::types::{
    display_name_for, Job, JobError, JobEvent, JobOptions, JobResult, JobStatus, JobUpdate,
    LogEntry,
};
use chrono::{DateTime, Utc};
use foreman_config::ProcessSettings;
use foreman_process::{LogStream, ProcessManager};
use futures::future::join_all;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long the driver waits for output readers after the process exited.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs one-shot commands as tracked jobs.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct JobRunner {
    registry: JobRegistry,
    manager: ProcessManager,
    drain_timeout: Duration,
}

impl JobRunner {
    pub fn new(registry: JobRegistry, manager: ProcessManager) -> Self {
        Self {
            registry,
            manager,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Runner wired to the real OS with a fresh registry.
    pub fn system(settings: &ProcessSettings) -> Self {
        Self::new(JobRegistry::new(), ProcessManager::system(settings))
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Register a job and spawn its command in the background.
    ///
    /// Returns the job as registered, in `pending`. Spawn failures do not surface
    /// here; they turn the job `failed`.
    ///
    /// # Errors
    ///
    /// * `JobError::InvalidOptions` - empty job type, project id or command
    pub async fn start_job(&self, job_type: &str, options: JobOptions) -> JobResult<Job> {
        if job_type.trim().is_empty() {
            return Err(JobError::InvalidOptions {
                reason: "job type cannot be empty".to_string(),
            });
        }
        if options.project_id.trim().is_empty() {
            return Err(JobError::InvalidOptions {
                reason: "project id cannot be empty".to_string(),
            });
        }
        if options.command.trim().is_empty() {
            return Err(JobError::InvalidOptions {
                reason: "command cannot be empty".to_string(),
            });
        }

        let job = Job {
            id: Uuid::new_v4().to_string(),
            project_id: options.project_id.clone(),
            job_type: job_type.to_string(),
            display_name: options
                .display_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| display_name_for(job_type)),
            command: options.command.clone(),
            args: options.args.clone(),
            cwd: options.cwd.clone(),
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
        };

        info!(
            "Starting job {} ({}) for project {}",
            job.id, job.job_type, job.project_id
        );

        let slot = self.registry.insert(job.clone()).await;
        let runner = self.clone();
        tokio::spawn(async move { runner.drive(slot, options).await });

        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> Option<Job> {
        self.registry.get(id).await
    }

    /// All of a project's jobs, most recent first.
    pub async fn list_jobs_for_project(&self, project_id: &str) -> Vec<Job> {
        self.registry.list_for_project(project_id).await
    }

    /// Move an active job to `cancelled` and kill its process tree.
    ///
    /// The kill is carried out by the job's driver while the root process is still
    /// unreaped, so a PID that was already reaped is never signalled. Returns `false`
    /// for unknown or already terminal jobs.
    pub async fn cancel_job(&self, id: &str) -> bool {
        let Some(slot) = self.registry.slot(id).await else {
            return false;
        };

        let mut entry = slot.lock().await;
        if !entry.apply_with_log(JobEvent::Cancel, Some("Job cancelled".to_string())) {
            return false;
        }
        if entry.process_running {
            entry.cancel.notify_one();
        }

        info!("Cancelled job {}", id);
        true
    }

    /// Poll until the job's root process has been reaped (or was never spawned).
    ///
    /// Returns `false` if it is still running when `within` elapses. Unknown jobs
    /// have nothing running and return `true`.
    pub async fn wait_for_process_exit(&self, id: &str, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            let Some(slot) = self.registry.slot(id).await else {
                return true;
            };
            if !slot.lock().await.process_running {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Logs newer than `since`, capped to the last `limit` entries.
    pub async fn job_logs(
        &self,
        id: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Option<Vec<LogEntry>> {
        let slot = self.registry.slot(id).await?;
        let entry = slot.lock().await;

        let filtered: Vec<LogEntry> = entry
            .job
            .logs
            .iter()
            .filter(|log| since.map_or(true, |since| log.timestamp > since))
            .cloned()
            .collect();

        Some(match limit {
            Some(max) if filtered.len() > max => filtered[filtered.len() - max..].to_vec(),
            _ => filtered,
        })
    }

    /// Live updates for a job. Updates that happened before the call are not replayed.
    pub async fn subscribe(&self, id: &str) -> Option<broadcast::Receiver<JobUpdate>> {
        let slot = self.registry.slot(id).await?;
        let entry = slot.lock().await;
        Some(entry.subscribe())
    }

    /// Poll until the job is terminal or `within` elapses. Returns the latest
    /// snapshot either way, `None` for unknown jobs.
    pub async fn wait_for_job(&self, id: &str, within: Duration) -> Option<Job> {
        let deadline = Instant::now() + within;
        loop {
            let job = self.registry.get(id).await?;
            let now = Instant::now();
            if job.status.is_terminal() || now >= deadline {
                return Some(job);
            }
            sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Attach the caller's structured result. Allowed in any status.
    pub async fn set_summary(&self, id: &str, summary: serde_json::Value) -> JobResult<()> {
        let slot = self
            .registry
            .slot(id)
            .await
            .ok_or_else(|| JobError::NotFound { id: id.to_string() })?;
        slot.lock().await.job.summary = Some(summary);
        Ok(())
    }

    /// Forget a terminal job. Active jobs must be cancelled first.
    pub async fn purge_job(&self, id: &str) -> bool {
        let purged = self.registry.remove_terminal(id).await;
        if purged {
            debug!("Purged job {}", id);
        }
        purged
    }

    async fn drive(&self, slot: JobSlot, options: JobOptions) {
        let job_id = slot.lock().await.job.id.clone();

        if !options.free_ports.is_empty() {
            slot.lock().await.push_log(
                LogStream::System,
                format!("Freeing ports {:?}", options.free_ports),
            );
            if !self
                .manager
                .wait_for_ports_to_free(&options.free_ports, None)
                .await
            {
                warn!(
                    "Ports {:?} still busy before job {}, starting anyway",
                    options.free_ports, job_id
                );
                slot.lock().await.push_log(
                    LogStream::System,
                    format!("Ports {:?} are still in use, starting anyway", options.free_ports),
                );
            }
        }

        // Spawn under the job lock so a concurrent cancel either sees no process
        // at all or sees the PID it has to kill.
        let (mut child, cancel) = {
            let mut entry = slot.lock().await;
            if !entry.apply(JobEvent::SpawnRequested) {
                debug!("Job {} was cancelled before it spawned", job_id);
                return;
            }

            let mut command = Command::new(&options.command);
            command
                .args(&options.args)
                .current_dir(&options.cwd)
                .envs(&options.env)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .stdin(Stdio::null());

            match command.spawn() {
                Ok(child) => {
                    entry.job.pid = child.id();
                    let started = format!(
                        "Started '{}' with PID {}",
                        entry.job.command,
                        child.id().map_or_else(|| "?".to_string(), |pid| pid.to_string())
                    );
                    entry.push_log(LogStream::System, started);
                    entry.apply(JobEvent::Spawned);
                    entry.process_running = true;
                    (child, entry.cancel.clone())
                }
                Err(e) => {
                    error!("Failed to spawn job {}: {}", job_id, e);
                    entry.job.error = Some(e.to_string());
                    entry.apply_with_log(
                        JobEvent::SpawnFailed,
                        Some(format!("Failed to start '{}': {}", options.command, e)),
                    );
                    return;
                }
            }
        };

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(slot.clone(), LogStream::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(slot.clone(), LogStream::Stderr, stderr));
        }

        // A cancel only wins while the root is unreaped; after that its PID may be reused
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.notified() => None,
        };
        let waited = match exited {
            Some(status) => status,
            None => {
                if let Some(pid) = child.id() {
                    if !self.manager.kill_process_tree(pid).await {
                        warn!("Process tree of cancelled job PID {} did not fully exit", pid);
                    }
                }
                child.wait().await
            }
        };
        slot.lock().await.process_running = false;

        if timeout(self.drain_timeout, join_all(readers)).await.is_err() {
            warn!("Output of job {} still open after exit, detaching readers", job_id);
        }

        let mut entry = slot.lock().await;
        match waited {
            Ok(status) => {
                let (code, signal) = exit_details(&status);
                let success = status.success();
                let message = match (code, signal) {
                    (Some(code), _) => format!("Process exited with code {}", code),
                    (None, Some(signal)) => format!("Process terminated by signal {}", signal),
                    (None, None) => "Process exited".to_string(),
                };
                if entry.apply_with_log(JobEvent::Exited { success }, Some(message)) {
                    entry.job.exit_code = code;
                    entry.job.signal = signal;
                    info!("Job {} finished: {}", job_id, entry.job.status);
                } else {
                    debug!(
                        "Job {} exited ({:?}) after reaching {}, ignoring",
                        job_id, status, entry.job.status
                    );
                }
            }
            Err(e) => {
                error!("Failed to wait for job {}: {}", job_id, e);
                if entry.apply_with_log(
                    JobEvent::Exited { success: false },
                    Some(format!("Failed to wait for process: {}", e)),
                ) {
                    entry.job.error = Some(e.to_string());
                }
            }
        }
    }
}

fn spawn_reader<R>(slot: JobSlot, stream: LogStream, pipe: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    // Late lines after a terminal status are dropped here
                    slot.lock().await.push_log(stream, line);
                }
                Err(e) => {
                    debug!("Stopped reading {} of job: {}", stream.as_str(), e);
                    break;
                }
            }
        }
    })
}

#[cfg(unix)]
fn exit_details(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

#[cfg(not(unix))]
fn exit_details(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), None)
}
