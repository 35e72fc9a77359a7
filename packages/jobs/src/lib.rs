//! Foreman Jobs - tracked one-shot commands
//!
//! Runs build/test/lint commands as jobs with a strict status lifecycle,
//! captured output, live updates and cancellation.

pub mod registry;
pub mod runner;
pub mod state;
pub mod types;

pub use registry::JobRegistry;
pub use runner::JobRunner;
pub use types::{
    display_name_for, Job, JobError, JobEvent, JobOptions, JobResult, JobStatus, JobUpdate,
    LogEntry,
};
