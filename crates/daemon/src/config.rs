//! Configuration management for the session orchestrator.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/session-orchestrator/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default address the HTTP API binds to.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port range must satisfy 1 <= range_start <= range_end, got {0}..={1}")]
    InvalidPortRange(u16, u16),

    #[error("port range {0}..={1} contains the orchestrator's own bind port {2}")]
    PortRangeOverlapsBind(u16, u16, u16),

    #[error("bind_addr is not a valid socket address: {0}")]
    InvalidBindAddr(String),

    #[error("ttl_secs must be greater than 0")]
    InvalidTtl,

    #[error("reap_interval_secs must be greater than 0")]
    InvalidReapInterval,

    #[error("startup_timeout_ms must be greater than 0")]
    InvalidStartupTimeout,

    #[error("health_poll_interval_ms must be greater than 0")]
    InvalidPollInterval,

    #[error("start_attempts must be between 1 and 10, got {0}")]
    InvalidStartAttempts(u32),

    #[error("health_path must start with '/', got {0}")]
    InvalidHealthPath(String),

    #[error("worker command not found: {0}")]
    InvalidWorkerCommand(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("log_format must be one of: pretty, compact, json; got {0}")]
    InvalidLogFormat(String),

    #[error("log_rotation must be one of: hourly, daily, never; got {0}")]
    InvalidLogRotation(String),
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: &[&str] = &["pretty", "compact", "json"];
const VALID_LOG_ROTATIONS: &[&str] = &["hourly", "daily", "never"];

/// Main configuration structure for the session orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP API configuration.
    pub http: HttpConfig,

    /// Port pool handed out to workers.
    pub ports: PortsConfig,

    /// How workers are launched and supervised.
    pub worker: WorkerConfig,

    /// Session lifecycle configuration.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding the state database and pid file.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format (pretty, compact, json).
    pub log_format: String,

    /// Optional log file written in addition to stderr.
    pub log_file: Option<PathBuf>,

    /// Rotation for the log file (hourly, daily, never).
    pub log_rotation: String,
}

/// HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Address the API listens on.
    pub bind_addr: String,
}

/// Port pool configuration. Both ends are inclusive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PortsConfig {
    /// First port handed out.
    pub range_start: u16,

    /// Last port handed out.
    pub range_end: u16,

    /// Skip ports that some other process already has bound.
    pub skip_bound: bool,
}

/// Where a worker runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// A separate OS process started from `command`.
    Process,
    /// An in-process HTTP worker, for development and tests.
    Embedded,
}

/// Worker launch and supervision configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Launch mode.
    pub mode: WorkerMode,

    /// Executable started for each worker (process mode).
    pub command: String,

    /// Extra arguments passed to the worker executable.
    pub args: Vec<String>,

    /// Environment variable carrying the allocated port.
    pub port_env: String,

    /// Host workers bind to and are reached on.
    pub host: String,

    /// Health endpoint polled until the worker reports ready.
    pub health_path: String,

    /// Maximum time a single start attempt may take to become ready.
    pub startup_timeout_ms: u64,

    /// Delay between health polls.
    pub health_poll_interval_ms: u64,

    /// Number of start attempts before giving up.
    pub start_attempts: u32,

    /// Backoff before the second attempt; doubled for each further attempt.
    pub retry_backoff_ms: u64,

    /// Time allowed for graceful termination before a forced kill.
    pub stop_grace_ms: u64,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of a session from creation.
    pub ttl_secs: u64,

    /// How often the reaper scans for expired sessions.
    pub reap_interval_secs: u64,

    /// Tear down every session when the orchestrator shuts down.
    pub stop_workers_on_shutdown: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_file: None,
            log_rotation: "daily".to_string(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: 3001,
            range_end: 3999,
            skip_bound: true,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: WorkerMode::Process,
            command: "steel-browser".to_string(),
            args: Vec::new(),
            port_env: "PORT".to_string(),
            host: "127.0.0.1".to_string(),
            health_path: "/health".to_string(),
            startup_timeout_ms: 10_000,
            health_poll_interval_ms: 250,
            start_attempts: 3,
            retry_backoff_ms: 500,
            stop_grace_ms: 3_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            reap_interval_secs: 5,
            stop_workers_on_shutdown: false,
        }
    }
}

impl WorkerConfig {
    /// Startup timeout for a single attempt.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Delay between health polls.
    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    /// Backoff before the given retry (1-based attempt that just failed).
    pub fn retry_backoff(&self, failed_attempt: u32) -> Duration {
        let factor = 1u64 << failed_attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    /// Grace period before a forced kill.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl SessionConfig {
    /// Session lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Reaper scan interval.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("session-orchestrator")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("session-orchestrator")
}

impl Config {
    /// Path of the state database inside the data directory.
    pub fn state_db_path(&self) -> PathBuf {
        self.daemon.data_dir.join("state.db")
    }

    /// Path of the pid file inside the data directory.
    pub fn pid_file_path(&self) -> PathBuf {
        self.daemon.data_dir.join("orchestrator.pid")
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - ORCHESTRATOR_LOG_LEVEL: Override log level
    /// - ORCHESTRATOR_BIND_ADDR: Override the HTTP bind address
    /// - ORCHESTRATOR_WORKER_COMMAND: Override the worker executable
    /// - ORCHESTRATOR_SESSION_TTL_SECS: Override the session TTL
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = non_empty_env("ORCHESTRATOR_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(addr) = non_empty_env("ORCHESTRATOR_BIND_ADDR") {
            tracing::info!("Overriding bind_addr from environment: {}", addr);
            self.http.bind_addr = addr;
        }

        if let Some(command) = non_empty_env("ORCHESTRATOR_WORKER_COMMAND") {
            tracing::info!("Overriding worker command from environment: {}", command);
            self.worker.command = command;
        }

        if let Some(ttl) = non_empty_env("ORCHESTRATOR_SESSION_TTL_SECS") {
            match ttl.parse::<u64>() {
                Ok(secs) => {
                    tracing::info!("Overriding session ttl_secs from environment: {}", secs);
                    self.session.ttl_secs = secs;
                }
                Err(_) => {
                    tracing::warn!("Ignoring non-numeric ORCHESTRATOR_SESSION_TTL_SECS: {}", ttl);
                }
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ports = &self.ports;
        if ports.range_start == 0 || ports.range_start > ports.range_end {
            return Err(ConfigError::InvalidPortRange(
                ports.range_start,
                ports.range_end,
            ));
        }

        let bind: SocketAddr = self
            .http
            .bind_addr
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddr(self.http.bind_addr.clone()))?;
        if (ports.range_start..=ports.range_end).contains(&bind.port()) {
            return Err(ConfigError::PortRangeOverlapsBind(
                ports.range_start,
                ports.range_end,
                bind.port(),
            ));
        }

        if self.session.ttl_secs == 0 {
            return Err(ConfigError::InvalidTtl);
        }
        if self.session.reap_interval_secs == 0 {
            return Err(ConfigError::InvalidReapInterval);
        }

        let worker = &self.worker;
        if worker.startup_timeout_ms == 0 {
            return Err(ConfigError::InvalidStartupTimeout);
        }
        if worker.health_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }
        if worker.start_attempts == 0 || worker.start_attempts > 10 {
            return Err(ConfigError::InvalidStartAttempts(worker.start_attempts));
        }
        if !worker.health_path.starts_with('/') {
            return Err(ConfigError::InvalidHealthPath(worker.health_path.clone()));
        }

        if worker.mode == WorkerMode::Process {
            let command = Path::new(&worker.command);
            let found = if command.is_absolute() {
                command.exists()
            } else {
                which::which(&worker.command).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidWorkerCommand(worker.command.clone()));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }
        let format = self.daemon.log_format.to_lowercase();
        if !VALID_LOG_FORMATS.contains(&format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(self.daemon.log_format.clone()));
        }
        let rotation = self.daemon.log_rotation.to_lowercase();
        if !VALID_LOG_ROTATIONS.contains(&rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(
                self.daemon.log_rotation.clone(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
