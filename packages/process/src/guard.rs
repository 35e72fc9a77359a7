// ABOUTME: Classifies PIDs and ports that belong to the host application
// ABOUTME: Single source of truth for what the core must never terminate or probe

use foreman_config::ProcessSettings;
use std::collections::BTreeSet;

/// Pure predicates over the host PID and the reserved port set.
#[derive(Debug, Clone)]
pub struct PidGuard {
    host_pid: u32,
    reserved_ports: BTreeSet<u16>,
}

impl PidGuard {
    /// Guard for the current process.
    pub fn new(reserved_ports: impl IntoIterator<Item = u16>) -> Self {
        Self::with_host_pid(std::process::id(), reserved_ports)
    }

    pub fn with_host_pid(host_pid: u32, reserved_ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            host_pid,
            reserved_ports: reserved_ports.into_iter().collect(),
        }
    }

    pub fn from_settings(settings: &ProcessSettings) -> Self {
        Self::new(settings.reserved_ports.iter().copied())
    }

    pub fn host_pid(&self) -> u32 {
        self.host_pid
    }

    /// True iff `pid` is the host process.
    pub fn is_protected_pid(&self, pid: u32) -> bool {
        pid == self.host_pid
    }

    /// True for ports the host itself listens on.
    pub fn is_reserved_port(&self, port: u16) -> bool {
        self.reserved_ports.contains(&port)
    }

    pub fn reserved_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.reserved_ports.iter().copied()
    }
}
