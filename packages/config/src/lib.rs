// ABOUTME: Configuration for the Foreman process and job core
// ABOUTME: Environment variable names and settings loaded from the environment

pub mod constants;
pub mod settings;

pub use settings::{ConfigError, ProcessSettings, DEFAULT_API_PORT, DEFAULT_RESERVED_PORTS};
