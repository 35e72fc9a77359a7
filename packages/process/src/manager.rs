// ABOUTME: Frees ports and tears down process trees on behalf of projects
// ABOUTME: Always probe, filter protected PIDs, terminate, then re-verify

use crate::guard::PidGuard;
use crate::prober::{PortProber, SystemPortProber};
use crate::signal::is_valid_pid;
use crate::terminator::ProcessTerminator;
use crate::tree::{ProcessTree, SystemProcessTree};
use crate::types::PortCleanupReport;
use foreman_config::ProcessSettings;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Polling bounds for [`ProcessManager::wait_for_ports_to_free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitForPortsOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitForPortsOptions {
    pub fn from_settings(settings: &ProcessSettings) -> Self {
        Self {
            timeout: settings.port_free_timeout,
            interval: settings.port_free_poll_interval,
        }
    }
}

impl Default for WaitForPortsOptions {
    fn default() -> Self {
        Self::from_settings(&ProcessSettings::default())
    }
}

/// Stateless orchestration over the prober, the process tree and the terminator.
#[derive(Clone)]
pub struct ProcessManager {
    prober: Arc<dyn PortProber>,
    tree: Arc<dyn ProcessTree>,
    terminator: ProcessTerminator,
    port_wait: WaitForPortsOptions,
}

impl ProcessManager {
    pub fn new(
        prober: Arc<dyn PortProber>,
        tree: Arc<dyn ProcessTree>,
        terminator: ProcessTerminator,
        port_wait: WaitForPortsOptions,
    ) -> Self {
        Self {
            prober,
            tree,
            terminator,
            port_wait,
        }
    }

    /// Manager wired to the real OS.
    pub fn system(settings: &ProcessSettings) -> Self {
        Self::new(
            Arc::new(SystemPortProber),
            Arc::new(SystemProcessTree),
            ProcessTerminator::system(settings),
            WaitForPortsOptions::from_settings(settings),
        )
    }

    pub fn guard(&self) -> &PidGuard {
        self.terminator.guard()
    }

    pub fn terminator(&self) -> &ProcessTerminator {
        &self.terminator
    }

    pub fn port_wait_options(&self) -> WaitForPortsOptions {
        self.port_wait
    }

    pub fn is_protected_pid(&self, pid: u32) -> bool {
        self.guard().is_protected_pid(pid)
    }

    pub fn is_reserved_port(&self, port: u16) -> bool {
        self.guard().is_reserved_port(port)
    }

    pub fn is_process_running(&self, pid: u32) -> bool {
        self.terminator.is_alive(pid)
    }

    pub async fn list_pids_on_port(&self, port: u16) -> Vec<u32> {
        self.prober.list_pids_on_port(port).await
    }

    /// Free `ports` using the retrying terminator.
    pub async fn ensure_ports_freed(&self, ports: &[u16]) -> PortCleanupReport {
        let terminator = &self.terminator;
        self.ensure_ports_freed_with(ports, |pid| terminator.terminate_pid_with_retry(pid))
            .await
    }

    /// Free `ports` with an injected kill function.
    ///
    /// Reserved ports are never probed. Protected PIDs are filtered before `kill_fn`
    /// sees them. Best effort: one failing PID does not stop the others.
    pub async fn ensure_ports_freed_with<K, KFut>(
        &self,
        ports: &[u16],
        kill_fn: K,
    ) -> PortCleanupReport
    where
        K: Fn(u32) -> KFut,
        KFut: Future<Output = bool>,
    {
        let mut report = PortCleanupReport::default();
        let mut to_probe = Vec::new();

        for port in unique_ports(ports) {
            if self.is_reserved_port(port) {
                debug!("Port {} is reserved for the host, not probing it", port);
                report.skipped_reserved.push(port);
            } else {
                to_probe.push(port);
            }
        }

        let kill_fn = &kill_fn;
        let outcomes = join_all(to_probe.into_iter().map(|port| async move {
            let pids = self.killable_pids_on_port(port).await;
            if pids.is_empty() {
                return (port, true);
            }

            info!("Freeing port {} held by PIDs {:?}", port, pids);
            for pid in pids {
                if !kill_fn(pid).await {
                    warn!("Failed to terminate PID {} on port {}", pid, port);
                }
            }

            (port, self.killable_pids_on_port(port).await.is_empty())
        }))
        .await;

        for (port, freed) in outcomes {
            if freed {
                report.freed.push(port);
            } else {
                warn!("Port {} is still in use after cleanup", port);
                report.still_busy.push(port);
            }
        }

        report
    }

    /// Poll `ports` until nothing killable is bound to them, terminating occupants
    /// on every pass. Uses the configured timeout unless `options` overrides it.
    pub async fn wait_for_ports_to_free(
        &self,
        ports: &[u16],
        options: Option<WaitForPortsOptions>,
    ) -> bool {
        let prober = &self.prober;
        let terminator = &self.terminator;
        self.wait_for_ports_to_free_with(
            ports,
            options.unwrap_or(self.port_wait),
            |port| prober.list_pids_on_port(port),
            |pid| terminator.terminate_pid_with_retry(pid),
        )
        .await
    }

    /// [`wait_for_ports_to_free`](Self::wait_for_ports_to_free) with injected lookups.
    ///
    /// Returns `false` once `options.timeout` elapses with any port still occupied.
    pub async fn wait_for_ports_to_free_with<F, FFut, K, KFut>(
        &self,
        ports: &[u16],
        options: WaitForPortsOptions,
        find_pids: F,
        terminate_pid: K,
    ) -> bool
    where
        F: Fn(u16) -> FFut,
        FFut: Future<Output = Vec<u32>>,
        K: Fn(u32) -> KFut,
        KFut: Future<Output = bool>,
    {
        let mut pending: Vec<u16> = unique_ports(ports)
            .into_iter()
            .filter(|port| {
                let reserved = self.is_reserved_port(*port);
                if reserved {
                    debug!("Port {} is reserved for the host, not waiting on it", port);
                }
                !reserved
            })
            .collect();

        if pending.is_empty() {
            return true;
        }

        let deadline = Instant::now() + options.timeout;
        let find_pids = &find_pids;
        let terminate_pid = &terminate_pid;

        loop {
            let pass = join_all(pending.iter().map(|&port| async move {
                let pids = self.filter_killable(find_pids(port).await);
                if pids.is_empty() {
                    return (port, true);
                }
                for pid in pids {
                    terminate_pid(pid).await;
                }
                (port, self.filter_killable(find_pids(port).await).is_empty())
            }));
            let checks = match timeout_at(deadline, pass).await {
                Ok(checks) => checks,
                Err(_) => {
                    warn!(
                        "Timed out after {:?} waiting for ports {:?} to free",
                        options.timeout, pending
                    );
                    return false;
                }
            };

            pending = checks
                .into_iter()
                .filter_map(|(port, clear)| (!clear).then_some(port))
                .collect();

            if pending.is_empty() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Timed out after {:?} waiting for ports {:?} to free",
                    options.timeout, pending
                );
                return false;
            }
            sleep(options.interval.min(deadline - now)).await;
        }
    }

    /// Terminate `pid` and all of its descendants, leaves first and the root last.
    ///
    /// A protected root shields its whole tree. Returns `true` when every process
    /// was confirmed gone.
    pub async fn kill_process_tree(&self, pid: u32) -> bool {
        if self.is_protected_pid(pid) {
            warn!("Skipping protected PID {} (host process)", pid);
            return false;
        }
        if !is_valid_pid(pid) {
            debug!("Ignoring process tree kill for invalid PID {}", pid);
            return true;
        }

        let tree = self.tree.clone();
        let descendants = tokio::task::spawn_blocking(move || tree.descendants_of(pid))
            .await
            .unwrap_or_else(|e| {
                warn!("Failed to resolve descendants of PID {}: {}", pid, e);
                Vec::new()
            });

        info!(
            "Killing process tree rooted at PID {} ({} descendants)",
            pid,
            descendants.len()
        );

        let mut all_exited = true;
        for descendant in descendants.into_iter().rev().chain(std::iter::once(pid)) {
            if !self.terminator.terminate_pid_with_retry(descendant).await {
                warn!("PID {} in tree of {} did not exit", descendant, pid);
                all_exited = false;
            }
        }
        all_exited
    }

    async fn killable_pids_on_port(&self, port: u16) -> Vec<u32> {
        self.filter_killable(self.prober.list_pids_on_port(port).await)
    }

    fn filter_killable(&self, pids: Vec<u32>) -> Vec<u32> {
        pids.into_iter()
            .filter(|pid| {
                let protected = self.is_protected_pid(*pid);
                if protected {
                    debug!("Leaving protected PID {} (host process) in place", pid);
                }
                !protected && is_valid_pid(*pid)
            })
            .collect()
    }
}

fn unique_ports(ports: &[u16]) -> Vec<u16> {
    ports
        .iter()
        .copied()
        .filter(|port| *port != 0)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
