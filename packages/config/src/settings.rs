// ABOUTME: Process and port management settings loaded from environment variables
// ABOUTME: Defaults, validation and clamping for every timing knob of the core

use std::collections::BTreeSet;
use std::env;
use std::num::ParseIntError;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::constants::*;

/// Port the host API listens on unless `FOREMAN_API_PORT` says otherwise.
pub const DEFAULT_API_PORT: u16 = 4001;

/// Ports the host depends on that are never probed for killable occupants.
pub const DEFAULT_RESERVED_PORTS: &[u16] = &[3000];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {source}")]
    InvalidNumber {
        name: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("Invalid port '{value}' in {name}")]
    InvalidPortList { name: &'static str, value: String },
}

/// Timing and port-protection settings shared by the process and job crates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSettings {
    pub api_port: u16,
    /// Always contains `api_port`.
    pub reserved_ports: BTreeSet<u16>,
    pub force_delay: Duration,
    pub kill_retry_attempts: u32,
    pub pid_exit_timeout: Duration,
    pub pid_exit_poll_interval: Duration,
    pub port_free_timeout: Duration,
    pub port_free_poll_interval: Duration,
    pub dev_server_log_limit: usize,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        let mut reserved_ports: BTreeSet<u16> = DEFAULT_RESERVED_PORTS.iter().copied().collect();
        reserved_ports.insert(DEFAULT_API_PORT);

        Self {
            api_port: DEFAULT_API_PORT,
            reserved_ports,
            force_delay: Duration::from_millis(250),
            kill_retry_attempts: 3,
            pid_exit_timeout: Duration::from_secs(5),
            pid_exit_poll_interval: Duration::from_millis(100),
            port_free_timeout: Duration::from_secs(10),
            port_free_poll_interval: Duration::from_millis(200),
            dev_server_log_limit: 5000,
        }
    }
}

impl ProcessSettings {
    /// Load settings from the environment, falling back to defaults for unset variables.
    ///
    /// `FOREMAN_RESERVED_PORTS` replaces the default reserved set (comma separated);
    /// the API port is added to it regardless.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_port = match read_u64(FOREMAN_API_PORT)? {
            Some(port) => validate_port(port)?,
            None => defaults.api_port,
        };

        let mut reserved_ports = match env::var(FOREMAN_RESERVED_PORTS) {
            Ok(raw) => parse_port_list(FOREMAN_RESERVED_PORTS, &raw)?,
            Err(_) => DEFAULT_RESERVED_PORTS.iter().copied().collect(),
        };
        reserved_ports.insert(api_port);

        let settings = Self {
            api_port,
            reserved_ports,
            force_delay: read_millis(FOREMAN_KILL_FORCE_DELAY_MS, 10, 10_000)?
                .unwrap_or(defaults.force_delay),
            kill_retry_attempts: read_u64(FOREMAN_KILL_RETRY_ATTEMPTS)?
                .map(|v| v.clamp(1, 10) as u32)
                .unwrap_or(defaults.kill_retry_attempts),
            pid_exit_timeout: read_millis(FOREMAN_PID_EXIT_TIMEOUT_MS, 100, 60_000)?
                .unwrap_or(defaults.pid_exit_timeout),
            pid_exit_poll_interval: read_millis(FOREMAN_PID_EXIT_POLL_MS, 10, 5_000)?
                .unwrap_or(defaults.pid_exit_poll_interval),
            port_free_timeout: read_millis(FOREMAN_PORT_FREE_TIMEOUT_MS, 100, 120_000)?
                .unwrap_or(defaults.port_free_timeout),
            port_free_poll_interval: read_millis(FOREMAN_PORT_FREE_POLL_MS, 10, 10_000)?
                .unwrap_or(defaults.port_free_poll_interval),
            dev_server_log_limit: read_u64(FOREMAN_DEV_SERVER_LOG_LIMIT)?
                .map(|v| v.clamp(100, 100_000) as usize)
                .unwrap_or(defaults.dev_server_log_limit),
        };

        debug!(
            "Loaded process settings: api_port={}, reserved_ports={:?}",
            settings.api_port, settings.reserved_ports
        );
        Ok(settings)
    }

    pub fn is_reserved_port(&self, port: u16) -> bool {
        self.reserved_ports.contains(&port)
    }
}

fn read_u64(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|source| ConfigError::InvalidNumber { name, source }),
        _ => Ok(None),
    }
}

fn read_millis(name: &'static str, min: u64, max: u64) -> Result<Option<Duration>, ConfigError> {
    Ok(read_u64(name)?.map(|ms| Duration::from_millis(ms.clamp(min, max))))
}

fn validate_port(port: u64) -> Result<u16, ConfigError> {
    match u16::try_from(port) {
        Ok(0) => Err(ConfigError::PortOutOfRange(0)),
        Ok(port) => Ok(port),
        Err(_) => Err(ConfigError::PortOutOfRange(u16::MAX)),
    }
}

fn parse_port_list(name: &'static str, raw: &str) -> Result<BTreeSet<u16>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<u16>() {
            Ok(port) if port != 0 => Ok(port),
            _ => Err(ConfigError::InvalidPortList {
                name,
                value: s.to_string(),
            }),
        })
        .collect()
}
