//! Logging initialisation.
//!
//! # Environment Variables
//!
//! - `ORCHESTRATOR_LOG` - Log filter (overrides `RUST_LOG`)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! A filter from `--verbose` wins over both. Without any filter the level
//! comes from `daemon.log_level`.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::DaemonConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-line format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON lines for log aggregation
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Rotation of the optional log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Resolved logging configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Log file written in addition to stderr.
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Filter directive; overrides `level` when set.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Build from the `[daemon]` config section. Unparseable values fall
    /// back to defaults; `Config::validate` reports them.
    pub fn from_daemon_config(daemon: &DaemonConfig, verbose: bool) -> Self {
        Self {
            level: parse_level(&daemon.log_level).unwrap_or(Level::INFO),
            format: daemon.log_format.parse().unwrap_or_default(),
            file_path: daemon.log_file.clone(),
            rotation: daemon.log_rotation.parse().unwrap_or_default(),
            filter: verbose.then(|| "debug".to_string()),
        }
    }

    /// Take the filter from `ORCHESTRATOR_LOG` or `RUST_LOG` unless one is
    /// already set.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            self.filter = ["ORCHESTRATOR_LOG", "RUST_LOG"]
                .iter()
                .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()));
        }
        self
    }

    fn build_filter(&self) -> EnvFilter {
        let level = self.level.to_string().to_lowercase();
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using {}", filter, level);
                EnvFilter::new(level)
            }),
            None => EnvFilter::new(level),
        }
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Install the global subscriber.
///
/// Returns the guard of the non-blocking file writer when a log file is
/// configured; hold it until exit so buffered lines are flushed. A second
/// call installs nothing.
pub fn init(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_writer, guard) = match &config.file_path {
        Some(path) => {
            let appender = file_appender(path, config.rotation)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(config.build_filter())
        .with(fmt_layer(config.format, std::io::stderr, true))
        .with(file_writer.map(|writer| fmt_layer(config.format, writer, false)))
        .try_init();
    // Already initialised (tests, repeated calls)
    let _ = result;

    Ok(guard)
}

fn file_appender(path: &Path, rotation: LogRotation) -> Result<RollingFileAppender, InitError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("orchestrator.log");
    RollingFileAppender::builder()
        .rotation(rotation.into())
        .filename_prefix(file_name)
        .build(dir)
}

fn fmt_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(writer)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer().with_ansi(ansi).with_writer(writer).boxed(),
    }
}
