use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::types::ProcessHandle;

/// Running dev-server processes keyed by project id.
///
/// Every mutation goes through the single lock owned by this registry; one instance
/// is created at startup and handed to whoever needs it.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    entries: Arc<RwLock<HashMap<String, Vec<ProcessHandle>>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly spawned process for `handle.project_id`.
    pub async fn register(&self, handle: ProcessHandle) {
        let mut entries = self.entries.write().await;
        info!(
            "Registered PID {} for project {} ({})",
            handle.pid,
            handle.project_id,
            handle.command_line()
        );
        entries
            .entry(handle.project_id.clone())
            .or_default()
            .push(handle);
    }

    pub async fn handles_for(&self, project_id: &str) -> Vec<ProcessHandle> {
        let entries = self.entries.read().await;
        entries.get(project_id).cloned().unwrap_or_default()
    }

    /// Remove one process from a project. Returns the removed handle.
    pub async fn remove_pid(&self, project_id: &str, pid: u32) -> Option<ProcessHandle> {
        let mut entries = self.entries.write().await;
        let handles = entries.get_mut(project_id)?;
        let index = handles.iter().position(|h| h.pid == pid)?;
        let removed = handles.remove(index);
        if handles.is_empty() {
            entries.remove(project_id);
        }
        debug!("Unregistered PID {} for project {}", pid, project_id);
        Some(removed)
    }

    /// Remove and return every process of a project.
    pub async fn take_project(&self, project_id: &str) -> Vec<ProcessHandle> {
        let mut entries = self.entries.write().await;
        entries.remove(project_id).unwrap_or_default()
    }

    /// Project ids with at least one registered process, sorted.
    pub async fn projects(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut projects: Vec<String> = entries.keys().cloned().collect();
        projects.sort();
        projects
    }

    pub async fn all_handles(&self) -> Vec<ProcessHandle> {
        let entries = self.entries.read().await;
        entries.values().flatten().cloned().collect()
    }

    /// Drop handles whose process is gone. Returns what was removed.
    ///
    /// `is_running` is evaluated without the registry lock held.
    pub async fn reap_exited<F>(&self, is_running: F) -> Vec<ProcessHandle>
    where
        F: Fn(u32) -> bool,
    {
        let exited: HashSet<u32> = self
            .all_handles()
            .await
            .into_iter()
            .map(|h| h.pid)
            .filter(|pid| !is_running(*pid))
            .collect();
        self.remove_pids(&exited).await
    }

    /// Drop every handle whose PID is in `pids`, across all projects.
    pub async fn remove_pids(&self, pids: &HashSet<u32>) -> Vec<ProcessHandle> {
        if pids.is_empty() {
            return Vec::new();
        }

        let mut entries = self.entries.write().await;
        let mut reaped = Vec::new();

        entries.retain(|_, handles| {
            let (dead, alive): (Vec<_>, Vec<_>) =
                handles.drain(..).partition(|h| pids.contains(&h.pid));
            reaped.extend(dead);
            *handles = alive;
            !handles.is_empty()
        });

        for handle in &reaped {
            info!(
                "Reaped exited PID {} for project {}",
                handle.pid, handle.project_id
            );
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn handle(project_id: &str, pid: u32) -> ProcessHandle {
        ProcessHandle {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            pid,
            command: "npm".to_string(),
            args: vec!["run".to_string(), "dev".to_string()],
            cwd: PathBuf::from("/tmp"),
            port: Some(5173),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup_per_project() {
        let registry = ProcessRegistry::new();
        registry.register(handle("alpha", 10)).await;
        registry.register(handle("alpha", 11)).await;
        registry.register(handle("beta", 20)).await;

        let alpha: Vec<u32> = registry
            .handles_for("alpha")
            .await
            .iter()
            .map(|h| h.pid)
            .collect();
        assert_eq!(alpha, vec![10, 11]);
        assert_eq!(registry.projects().await, vec!["alpha", "beta"]);
        assert!(registry.handles_for("gamma").await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_last_pid_drops_project() {
        let registry = ProcessRegistry::new();
        registry.register(handle("alpha", 10)).await;

        assert_eq!(registry.remove_pid("alpha", 10).await.map(|h| h.pid), Some(10));
        assert!(registry.remove_pid("alpha", 10).await.is_none());
        assert!(registry.projects().await.is_empty());
    }

    #[tokio::test]
    async fn test_take_project_leaves_others() {
        let registry = ProcessRegistry::new();
        registry.register(handle("alpha", 10)).await;
        registry.register(handle("beta", 20)).await;

        assert_eq!(registry.take_project("alpha").await.len(), 1);
        assert_eq!(registry.all_handles().await.len(), 1);
        assert_eq!(registry.projects().await, vec!["beta"]);
    }

    #[tokio::test]
    async fn test_reap_exited() {
        let registry = ProcessRegistry::new();
        registry.register(handle("alpha", 10)).await;
        registry.register(handle("alpha", 11)).await;
        registry.register(handle("beta", 20)).await;

        let reaped = registry.reap_exited(|pid| pid == 11).await;

        let mut reaped_pids: Vec<u32> = reaped.iter().map(|h| h.pid).collect();
        reaped_pids.sort();
        assert_eq!(reaped_pids, vec![10, 20]);
        assert_eq!(registry.projects().await, vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_reap_exited_checks_liveness_without_lock() {
        let registry = ProcessRegistry::new();
        registry.register(handle("alpha", 10)).await;
        registry.register(handle("beta", 20)).await;
        let other = registry.clone();

        let reaped = registry
            .reap_exited(|pid| {
                assert!(other.entries.try_write().is_ok());
                pid == 20
            })
            .await;

        assert_eq!(reaped.iter().map(|h| h.pid).collect::<Vec<_>>(), vec![10]);
        assert_eq!(registry.projects().await, vec!["beta"]);
    }

    #[tokio::test]
    async fn test_concurrent_registration() {
        let registry = ProcessRegistry::new();
        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .register(handle(if i % 2 == 0 { "even" } else { "odd" }, i))
                        .await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.handles_for("even").await.len(), 16);
        assert_eq!(registry.handles_for("odd").await.len(), 16);
    }
}
