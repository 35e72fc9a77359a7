// ABOUTME: Terminates single PIDs with SIGTERM, escalating to SIGKILL, and waits for exit
// ABOUTME: Every termination path in the crate goes through the PID guard here

use crate::guard::PidGuard;
use crate::signal::{is_valid_pid, Signaller, SystemSignaller};
use crate::types::TerminationSignal;
use foreman_config::ProcessSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Timing knobs for termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminatorOptions {
    /// Grace period between SIGTERM and SIGKILL on the first attempt; doubles per retry.
    pub force_delay: Duration,
    /// How long each attempt waits for the PID to disappear.
    pub exit_timeout: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl TerminatorOptions {
    pub fn from_settings(settings: &ProcessSettings) -> Self {
        Self {
            force_delay: settings.force_delay,
            exit_timeout: settings.pid_exit_timeout,
            poll_interval: settings.pid_exit_poll_interval,
            max_attempts: settings.kill_retry_attempts.max(1),
        }
    }
}

impl Default for TerminatorOptions {
    fn default() -> Self {
        Self::from_settings(&ProcessSettings::default())
    }
}

/// Sends termination signals to single PIDs, never to the host.
#[derive(Clone)]
pub struct ProcessTerminator {
    guard: PidGuard,
    signaller: Arc<dyn Signaller>,
    options: TerminatorOptions,
}

impl ProcessTerminator {
    pub fn new(guard: PidGuard, signaller: Arc<dyn Signaller>, options: TerminatorOptions) -> Self {
        Self {
            guard,
            signaller,
            options,
        }
    }

    /// Terminator wired to real OS signals.
    pub fn system(settings: &ProcessSettings) -> Self {
        Self::new(
            PidGuard::from_settings(settings),
            Arc::new(SystemSignaller),
            TerminatorOptions::from_settings(settings),
        )
    }

    pub fn guard(&self) -> &PidGuard {
        &self.guard
    }

    pub fn options(&self) -> &TerminatorOptions {
        &self.options
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.signaller.is_alive(pid)
    }

    /// Send SIGTERM, then SIGKILL if the process is still around after `force_delay`.
    ///
    /// Never fails: protected PIDs are skipped with a warning and signal errors are logged.
    pub async fn terminate_pid(&self, pid: u32, force_delay: Option<Duration>) {
        if self.guard.is_protected_pid(pid) {
            warn!("Skipping protected PID {} (host process)", pid);
            return;
        }
        if !is_valid_pid(pid) {
            debug!("Ignoring termination request for invalid PID {}", pid);
            return;
        }

        let force_delay = force_delay.unwrap_or(self.options.force_delay);

        if let Err(e) = self.signaller.send(pid, TerminationSignal::Graceful) {
            if !self.signaller.is_alive(pid) {
                debug!("PID {} already exited: {}", pid, e);
                return;
            }
            warn!("{}", e);
        }

        if self.wait_until_gone(pid, force_delay).await {
            info!("Process {} terminated gracefully after SIGTERM", pid);
            return;
        }

        warn!(
            "Process {} did not respond to SIGTERM within {:?}, sending SIGKILL",
            pid, force_delay
        );
        if let Err(e) = self.signaller.send(pid, TerminationSignal::Forceful) {
            if self.signaller.is_alive(pid) {
                warn!("{}", e);
            }
        }
    }

    /// Poll until `pid` is gone or `timeout` (default: the configured exit timeout) elapses.
    ///
    /// Invalid PIDs count as already exited.
    pub async fn wait_for_pid_exit(&self, pid: u32, timeout: Option<Duration>) -> bool {
        if !is_valid_pid(pid) {
            return true;
        }
        self.wait_until_gone(pid, timeout.unwrap_or(self.options.exit_timeout))
            .await
    }

    /// Terminate and confirm exit, retrying with a doubled grace period.
    ///
    /// Returns `false` without signalling anything when `pid` is protected.
    pub async fn terminate_pid_with_retry(&self, pid: u32) -> bool {
        if self.guard.is_protected_pid(pid) {
            warn!("Skipping protected PID {} (host process)", pid);
            return false;
        }
        if !is_valid_pid(pid) || !self.signaller.is_alive(pid) {
            return true;
        }

        let mut force_delay = self.options.force_delay;
        for attempt in 1..=self.options.max_attempts {
            self.terminate_pid(pid, Some(force_delay)).await;

            if self.wait_for_pid_exit(pid, None).await {
                debug!("PID {} exited after attempt {}", pid, attempt);
                return true;
            }

            warn!(
                "PID {} still alive after termination attempt {}/{}",
                pid, attempt, self.options.max_attempts
            );
            force_delay = force_delay.saturating_mul(2);
        }

        false
    }

    async fn wait_until_gone(&self, pid: u32, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if !self.signaller.is_alive(pid) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.options.poll_interval.min(deadline - now)).await;
        }
    }
}
