// ABOUTME: Signal delivery and liveness checks for single PIDs
// ABOUTME: nix/sysinfo on unix, taskkill on Windows; tests substitute a recording fake

use crate::types::{ProcessError, ProcessResult, TerminationSignal};
use sysinfo::{Pid as SysPid, ProcessStatus, System};
use tracing::debug;

/// OS seam used by the terminator. Implementations must not consult the PID guard;
/// that check happens once, in the terminator.
pub trait Signaller: Send + Sync {
    fn send(&self, pid: u32, signal: TerminationSignal) -> ProcessResult<()>;

    /// Zombies count as exited.
    fn is_alive(&self, pid: u32) -> bool;
}

/// PIDs that can name a real process. `0` would address the whole process group.
pub fn is_valid_pid(pid: u32) -> bool {
    pid > 0 && i32::try_from(pid).is_ok()
}

#[derive(Debug, Clone, Default)]
pub struct SystemSignaller;

impl Signaller for SystemSignaller {
    #[cfg(unix)]
    fn send(&self, pid: u32, signal: TerminationSignal) -> ProcessResult<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).map_err(|_| ProcessError::SignalFailed {
            pid,
            error: "PID out of range".to_string(),
        })?;
        let nix_signal = match signal {
            TerminationSignal::Graceful => Signal::SIGTERM,
            TerminationSignal::Forceful => Signal::SIGKILL,
        };

        kill(Pid::from_raw(raw), nix_signal).map_err(|e| ProcessError::SignalFailed {
            pid,
            error: format!("Failed to send {:?}: {}", nix_signal, e),
        })?;
        debug!("Sent {:?} to process with PID: {}", nix_signal, pid);
        Ok(())
    }

    #[cfg(not(unix))]
    fn send(&self, pid: u32, signal: TerminationSignal) -> ProcessResult<()> {
        let pid_str = pid.to_string();
        let mut args = vec!["/PID", pid_str.as_str()];
        if signal == TerminationSignal::Forceful {
            args.push("/F");
        }

        let output = std::process::Command::new("taskkill").args(&args).output()?;
        if output.status.success() {
            debug!("taskkill {:?} succeeded for PID {}", signal, pid);
            Ok(())
        } else {
            Err(ProcessError::SignalFailed {
                pid,
                error: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        if !is_valid_pid(pid) {
            return false;
        }

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            // Cheap existence probe before the full process table lookup
            if let Err(Errno::ESRCH) = kill(Pid::from_raw(pid as i32), None::<Signal>) {
                return false;
            }
        }

        let sys_pid = SysPid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(sys_pid) {
            return false;
        }
        system
            .process(sys_pid)
            .is_some_and(|process| process.status() != ProcessStatus::Zombie)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_pid_bounds() {
        assert!(!is_valid_pid(0));
        assert!(is_valid_pid(1));
        assert!(is_valid_pid(i32::MAX as u32));
        assert!(!is_valid_pid(i32::MAX as u32 + 1));
        assert!(!is_valid_pid(u32::MAX));
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(SystemSignaller.is_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pid_is_not_alive() {
        assert!(!SystemSignaller.is_alive(0));
        assert!(!SystemSignaller.is_alive(u32::MAX));
    }

    #[cfg(unix)]
    #[test]
    fn test_reaped_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(!SystemSignaller.is_alive(pid));
    }
}
