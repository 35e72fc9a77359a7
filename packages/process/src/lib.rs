//! Foreman Process - port cleanup and safe process termination
//!
//! This crate finds the processes bound to a port, terminates them (and their
//! descendants) without ever touching the host process, and manages the
//! lifecycle of per-project development servers.

pub mod guard;
pub mod launcher;
pub mod manager;
pub mod prober;
pub mod registry;
pub mod signal;
pub mod terminator;
pub mod tree;
pub mod types;

// Re-export key types and functions for easier use
pub use guard::PidGuard;
pub use launcher::{validate_project_id, DevServerLauncher};
pub use manager::{ProcessManager, WaitForPortsOptions};
pub use prober::{PortProber, SystemPortProber};
pub use registry::ProcessRegistry;
pub use signal::{is_valid_pid, Signaller, SystemSignaller};
pub use terminator::{ProcessTerminator, TerminatorOptions};
pub use tree::{collect_descendants, ProcessTree, SystemProcessTree};
pub use types::{
    DevServerLog, DevServerSpec, LogStream, PortCleanupReport, ProcessError, ProcessHandle,
    ProcessResult, TerminationSignal,
};
