// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Foreman

// Port Configuration
pub const FOREMAN_API_PORT: &str = "FOREMAN_API_PORT";
pub const FOREMAN_RESERVED_PORTS: &str = "FOREMAN_RESERVED_PORTS";

// Process Termination
pub const FOREMAN_KILL_FORCE_DELAY_MS: &str = "FOREMAN_KILL_FORCE_DELAY_MS";
pub const FOREMAN_KILL_RETRY_ATTEMPTS: &str = "FOREMAN_KILL_RETRY_ATTEMPTS";
pub const FOREMAN_PID_EXIT_TIMEOUT_MS: &str = "FOREMAN_PID_EXIT_TIMEOUT_MS";
pub const FOREMAN_PID_EXIT_POLL_MS: &str = "FOREMAN_PID_EXIT_POLL_MS";

// Port Cleanup
pub const FOREMAN_PORT_FREE_TIMEOUT_MS: &str = "FOREMAN_PORT_FREE_TIMEOUT_MS";
pub const FOREMAN_PORT_FREE_POLL_MS: &str = "FOREMAN_PORT_FREE_POLL_MS";

// Dev Server Logs
pub const FOREMAN_DEV_SERVER_LOG_LIMIT: &str = "FOREMAN_DEV_SERVER_LOG_LIMIT";

// Passed to spawned dev servers
pub const PORT: &str = "PORT";
