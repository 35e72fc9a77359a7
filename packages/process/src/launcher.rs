// ABOUTME: Starts, stops and restarts per-project dev servers on top of the process manager
// ABOUTME: Captures child output into a bounded per-project log and reaps exited servers

use crate::manager::ProcessManager;
use crate::registry::ProcessRegistry;
use crate::types::{DevServerLog, DevServerSpec, LogStream, ProcessError, ProcessHandle, ProcessResult};
use chrono::{DateTime, Utc};
use foreman_config::constants::PORT;
use foreman_config::ProcessSettings;
use futures::future::join_all;
use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How long the reaper waits for output readers once the server has exited.
/// A grandchild that inherited the pipes can keep them open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Validate project ID to prevent path traversal and shell surprises.
///
/// Project IDs must contain only alphanumeric characters, hyphens, and underscores.
pub fn validate_project_id(project_id: &str) -> ProcessResult<()> {
    if project_id.is_empty() {
        return Err(ProcessError::InvalidProjectId {
            project_id: project_id.to_string(),
            reason: "Project ID cannot be empty".to_string(),
        });
    }

    if !project_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ProcessError::InvalidProjectId {
            project_id: project_id.to_string(),
            reason: "Project ID can only contain alphanumeric characters, hyphens, and underscores"
                .to_string(),
        });
    }

    Ok(())
}

/// Dev server lifecycle for every project.
///
/// One instance is built at startup and cloned into whatever needs it; clones share
/// the registry and the log buffers.
#[derive(Clone)]
pub struct DevServerLauncher {
    manager: ProcessManager,
    registry: ProcessRegistry,
    logs: Arc<RwLock<HashMap<String, VecDeque<DevServerLog>>>>,
    log_limit: usize,
}

impl DevServerLauncher {
    pub fn new(manager: ProcessManager, registry: ProcessRegistry, log_limit: usize) -> Self {
        Self {
            manager,
            registry,
            logs: Arc::new(RwLock::new(HashMap::new())),
            log_limit: log_limit.max(1),
        }
    }

    /// Launcher wired to the real OS with a fresh registry.
    pub fn system(settings: &ProcessSettings) -> Self {
        Self::new(
            ProcessManager::system(settings),
            ProcessRegistry::new(),
            settings.dev_server_log_limit,
        )
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &ProcessManager {
        &self.manager
    }

    /// Start a development server for a project.
    ///
    /// Frees the requested port first and exports it to the child as `PORT`.
    /// Other servers already registered for the project keep running.
    ///
    /// # Errors
    ///
    /// * `ProcessError::InvalidProjectId` - the id contains anything but `[A-Za-z0-9_-]`
    /// * `ProcessError::ReservedPort` - the port belongs to the host application
    /// * `ProcessError::PortBusy` - the port could not be freed in time
    /// * `ProcessError::SpawnFailed` - the command could not be started
    pub async fn start(&self, project_id: &str, spec: DevServerSpec) -> ProcessResult<ProcessHandle> {
        validate_project_id(project_id)?;

        if let Some(port) = spec.port {
            if self.manager.is_reserved_port(port) {
                return Err(ProcessError::ReservedPort { port });
            }
            if !self.manager.wait_for_ports_to_free(&[port], None).await {
                self.add_log(
                    project_id,
                    LogStream::System,
                    format!("Port {} is still in use, not starting", port),
                )
                .await;
                return Err(ProcessError::PortBusy { port });
            }
        }

        let command_line = if spec.args.is_empty() {
            spec.command.clone()
        } else {
            format!("{} {}", spec.command, spec.args.join(" "))
        };
        self.add_log(
            project_id,
            LogStream::System,
            format!(
                "Starting '{}' in {}",
                command_line,
                spec.cwd.display()
            ),
        )
        .await;

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        if let Some(port) = spec.port {
            command.env(PORT, port.to_string());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn dev server for project {}: {}", project_id, e);
                self.add_log(
                    project_id,
                    LogStream::System,
                    format!("Failed to start '{}': {}", command_line, e),
                )
                .await;
                return Err(ProcessError::SpawnFailed {
                    command: command_line,
                    error: e.to_string(),
                });
            }
        };

        let Some(pid) = child.id() else {
            return Err(ProcessError::SpawnFailed {
                command: command_line,
                error: "process exited before its PID could be read".to_string(),
            });
        };

        let handle = ProcessHandle {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            pid,
            command: spec.command,
            args: spec.args,
            cwd: spec.cwd,
            port: spec.port,
            started_at: Utc::now(),
        };

        self.registry.register(handle.clone()).await;
        self.add_log(
            project_id,
            LogStream::System,
            format!("Development server started with PID {}", pid),
        )
        .await;

        let readers = self.capture_output(project_id, &mut child);
        self.spawn_reaper(project_id.to_string(), pid, child, readers);

        Ok(handle)
    }

    /// Stop every dev server of a project, process trees included.
    ///
    /// Returns the handles that were registered. Unknown projects are a no-op.
    pub async fn stop(&self, project_id: &str) -> ProcessResult<Vec<ProcessHandle>> {
        validate_project_id(project_id)?;

        let handles = self.registry.take_project(project_id).await;
        if handles.is_empty() {
            info!("No dev servers running for project {}", project_id);
            return Ok(handles);
        }

        for handle in &handles {
            if self.manager.kill_process_tree(handle.pid).await {
                info!(
                    "Stopped dev server PID {} for project {}",
                    handle.pid, project_id
                );
            } else {
                warn!(
                    "Dev server PID {} for project {} may still be running",
                    handle.pid, project_id
                );
            }
        }

        self.add_log(
            project_id,
            LogStream::System,
            format!("Stopped {} dev server process(es)", handles.len()),
        )
        .await;

        Ok(handles)
    }

    pub async fn restart(&self, project_id: &str, spec: DevServerSpec) -> ProcessResult<ProcessHandle> {
        self.stop(project_id).await?;
        self.start(project_id, spec).await
    }

    /// Stop every project's servers, e.g. on shutdown.
    pub async fn stop_all(&self) {
        for project_id in self.registry.projects().await {
            if let Err(e) = self.stop(&project_id).await {
                warn!("Failed to stop dev servers for project {}: {}", project_id, e);
            }
        }
    }

    pub async fn running(&self, project_id: &str) -> Vec<ProcessHandle> {
        self.registry.handles_for(project_id).await
    }

    /// Drop registry entries whose process has disappeared without being reaped.
    pub async fn reap_exited(&self) -> Vec<ProcessHandle> {
        let pids: Vec<u32> = self
            .registry
            .all_handles()
            .await
            .into_iter()
            .map(|h| h.pid)
            .collect();
        if pids.is_empty() {
            return Vec::new();
        }

        // Liveness checks block on the process table
        let manager = self.manager.clone();
        let exited = tokio::task::spawn_blocking(move || {
            pids.into_iter()
                .filter(|pid| !manager.is_process_running(*pid))
                .collect::<HashSet<u32>>()
        })
        .await;

        match exited {
            Ok(exited) => self.registry.remove_pids(&exited).await,
            Err(e) => {
                warn!("Failed to check dev server liveness: {}", e);
                Vec::new()
            }
        }
    }

    /// Logs for a project, optionally only newer than `since` and capped to the
    /// last `limit` entries.
    pub async fn logs(
        &self,
        project_id: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Vec<DevServerLog> {
        let logs = self.logs.read().await;
        let Some(project_logs) = logs.get(project_id) else {
            return Vec::new();
        };

        let filtered: Vec<DevServerLog> = project_logs
            .iter()
            .filter(|log| since.map_or(true, |since| log.timestamp > since))
            .cloned()
            .collect();

        match limit {
            Some(max) if filtered.len() > max => filtered[filtered.len() - max..].to_vec(),
            _ => filtered,
        }
    }

    pub async fn clear_logs(&self, project_id: &str) {
        let mut logs = self.logs.write().await;
        logs.remove(project_id);
        info!("Cleared logs for project: {}", project_id);
    }

    async fn add_log(&self, project_id: &str, stream: LogStream, message: String) {
        let entry = DevServerLog {
            timestamp: Utc::now(),
            stream,
            message,
        };

        let mut logs = self.logs.write().await;
        let project_logs = logs.entry(project_id.to_string()).or_default();
        project_logs.push_back(entry);
        while project_logs.len() > self.log_limit {
            project_logs.pop_front();
        }
    }

    fn capture_output(&self, project_id: &str, child: &mut Child) -> Vec<JoinHandle<()>> {
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(project_id, LogStream::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(project_id, LogStream::Stderr, stderr));
        }
        readers
    }

    fn spawn_reader<R>(&self, project_id: &str, stream: LogStream, pipe: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let launcher = self.clone();
        let project_id = project_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                launcher.add_log(&project_id, stream, line).await;
            }
        })
    }

    fn spawn_reaper(
        &self,
        project_id: String,
        pid: u32,
        mut child: Child,
        readers: Vec<JoinHandle<()>>,
    ) {
        let launcher = self.clone();
        tokio::spawn(async move {
            let message = match child.wait().await {
                Ok(status) => format!("Process {} exited with {}", pid, status),
                Err(e) => format!("Failed to wait for process {}: {}", pid, e),
            };

            if tokio::time::timeout(READER_DRAIN_TIMEOUT, join_all(readers))
                .await
                .is_err()
            {
                warn!("Output of PID {} still open after exit, detaching readers", pid);
            }

            launcher
                .add_log(&project_id, LogStream::System, message)
                .await;
            if launcher.registry.remove_pid(&project_id, pid).await.is_some() {
                info!("Dev server PID {} for project {} exited on its own", pid, project_id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launcher(log_limit: usize) -> DevServerLauncher {
        DevServerLauncher::new(
            ProcessManager::system(&ProcessSettings::default()),
            ProcessRegistry::new(),
            log_limit,
        )
    }

    #[test]
    fn test_validate_project_id_valid() {
        assert!(validate_project_id("my-project").is_ok());
        assert!(validate_project_id("project_123").is_ok());
        assert!(validate_project_id("ABC-def_789").is_ok());
    }

    #[test]
    fn test_validate_project_id_rejects_traversal_and_specials() {
        for bad in ["", "../etc", "a/b", "a\\b", "a b", "a;rm", "a$b"] {
            assert!(
                matches!(
                    validate_project_id(bad),
                    Err(ProcessError::InvalidProjectId { .. })
                ),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_log_buffer_drops_oldest() {
        let launcher = launcher(3);
        for i in 0..5 {
            launcher
                .add_log("web", LogStream::Stdout, format!("line {}", i))
                .await;
        }

        let messages: Vec<String> = launcher
            .logs("web", None, None)
            .await
            .into_iter()
            .map(|log| log.message)
            .collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn test_logs_limit_keeps_newest_and_since_filters() {
        let launcher = launcher(100);
        launcher.add_log("web", LogStream::System, "old".to_string()).await;
        let cutoff = Utc::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        launcher.add_log("web", LogStream::Stdout, "a".to_string()).await;
        launcher.add_log("web", LogStream::Stderr, "b".to_string()).await;

        let since: Vec<String> = launcher
            .logs("web", Some(cutoff), None)
            .await
            .into_iter()
            .map(|log| log.message)
            .collect();
        assert_eq!(since, vec!["a", "b"]);

        let last = launcher.logs("web", None, Some(1)).await;
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].message, "b");
        assert_eq!(last[0].stream, LogStream::Stderr);

        assert!(launcher.logs("other", None, None).await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_logs() {
        let launcher = launcher(10);
        launcher.add_log("web", LogStream::System, "x".to_string()).await;
        launcher.clear_logs("web").await;
        assert!(launcher.logs("web", None, None).await.is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_reserved_port() {
        let launcher = launcher(10);
        let spec = DevServerSpec {
            command: "true".to_string(),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
            port: Some(3000),
            env: HashMap::new(),
        };

        let result = launcher.start("web", spec).await;
        assert!(matches!(result, Err(ProcessError::ReservedPort { port: 3000 })));
        assert!(launcher.registry().projects().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_project_id() {
        let launcher = launcher(10);
        let spec = DevServerSpec {
            command: "true".to_string(),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
            port: None,
            env: HashMap::new(),
        };

        let result = launcher.start("../web", spec).await;
        assert!(matches!(result, Err(ProcessError::InvalidProjectId { .. })));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_and_logged() {
        let launcher = launcher(10);
        let spec = DevServerSpec {
            command: "definitely-not-a-real-binary-foreman".to_string(),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
            port: None,
            env: HashMap::new(),
        };

        let result = launcher.start("web", spec).await;
        assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));
        assert!(launcher.registry().projects().await.is_empty());
        assert!(launcher
            .logs("web", None, None)
            .await
            .iter()
            .any(|log| log.message.starts_with("Failed to start")));
    }
}
