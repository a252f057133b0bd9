//! Session Orchestrator
//!
//! Runs the orchestrator (`serve`) and talks to a running one over HTTP.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::logging::{self, LogConfig};
use daemon::orchestrator::Orchestrator;
use daemon::pidfile::read_running_pid;
use daemon::protocol::{parse_session_data, SessionData, SessionRecord};
use daemon::OrchestratorClient;

/// Session Orchestrator - one browser worker per session, behind an HTTP API.
#[derive(Parser, Debug)]
#[command(name = "session-orchestrator")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Orchestrator API URL for client commands (default: from http.bind_addr)
    #[arg(long, global = true, value_name = "URL")]
    pub url: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the orchestrator in the foreground
    Serve,

    /// Show whether an orchestrator is running and healthy
    Status,

    /// Manage sessions on a running orchestrator
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all live sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Create a session and wait until its worker is ready
    Create {
        /// Session payload, a JSON object
        #[arg(long, short, value_name = "JSON")]
        data: Option<String>,
    },

    /// Show one session as JSON
    Get {
        /// Session ID
        session_id: String,
    },

    /// Delete a session and stop its worker
    Delete {
        /// Session ID
        session_id: String,
    },
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    let log_config = LogConfig::from_daemon_config(&config.daemon, cli.verbose).with_env_overrides();
    let _log_guard = logging::init(&log_config)?;
    tracing::debug!(path = %config_path.display(), "Configuration loaded");

    match cli.command {
        Commands::Serve => {
            config.validate()?;
            run_serve(config).await?;
        }
        Commands::Status => {
            let pid = read_running_pid(&config.pid_file_path());
            match pid {
                Some(pid) => println!("Orchestrator: running (PID {})", pid),
                None => println!("Orchestrator: not running"),
            }

            let client = api_client(&cli.url, &config)?;
            println!("  API:      {}", client.base_url());
            match client.health().await {
                Ok(body) => println!("  Health:   {}", body.trim()),
                Err(e) => {
                    println!("  Health:   unreachable ({})", e);
                    std::process::exit(1);
                }
            }
            match client.list_sessions().await {
                Ok(sessions) => println!("  Sessions: {}", sessions.len()),
                Err(e) => println!("  Sessions: unknown ({})", e),
            }
        }
        Commands::Sessions(cmd) => {
            let client = api_client(&cli.url, &config)?;
            if let Err(e) = run_sessions_command(&client, cmd).await {
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
            if let Err(e) = config.validate() {
                eprintln!("Warning: configuration is invalid: {}", e);
            }
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                eprintln!(
                    "Config file already exists: {} (use --force to overwrite)",
                    config_path.display()
                );
                std::process::exit(1);
            }
            Config::default().save(&config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }

    Ok(())
}

/// Run the orchestrator until SIGINT or SIGTERM.
async fn run_serve(config: Config) -> anyhow::Result<()> {
    let mut orchestrator = Orchestrator::new(config);
    orchestrator.start().await?;

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

async fn run_sessions_command(
    client: &OrchestratorClient,
    cmd: SessionsCommands,
) -> anyhow::Result<()> {
    match cmd {
        SessionsCommands::List { json } => {
            let sessions = client.list_sessions().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions_table(&sessions);
            }
        }
        SessionsCommands::Create { data } => {
            let data = match data {
                Some(json) => parse_session_data(&json).context("Invalid --data")?,
                None => SessionData::new(),
            };
            let session = client.create_session(&data).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        SessionsCommands::Get { session_id } => {
            let session = client.get_session(&session_id).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        SessionsCommands::Delete { session_id } => {
            client.delete_session(&session_id).await?;
            println!("Session {} deleted", session_id);
        }
    }
    Ok(())
}

/// Build the API client from `--url` or the configured bind address.
fn api_client(url: &Option<String>, config: &Config) -> anyhow::Result<OrchestratorClient> {
    let url = url
        .clone()
        .unwrap_or_else(|| default_api_url(&config.http.bind_addr));
    OrchestratorClient::new(url).context("Failed to build HTTP client")
}

/// API URL for a bind address. Wildcard binds are reached over loopback.
fn default_api_url(bind_addr: &str) -> String {
    let addr = bind_addr
        .strip_prefix("0.0.0.0:")
        .map(|port| format!("127.0.0.1:{}", port))
        .or_else(|| bind_addr.strip_prefix("[::]:").map(|port| format!("[::1]:{}", port)))
        .unwrap_or_else(|| bind_addr.to_string());
    format!("http://{}", addr)
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionRecord]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    let id_width = sessions
        .iter()
        .map(|s| s.id.len())
        .max()
        .unwrap_or(8)
        .max(8);

    println!(
        "{:<id_width$}  {:<8}  {:>10}  {:>10}",
        "ID",
        "STATUS",
        "CREATED",
        "EXPIRES",
        id_width = id_width
    );
    println!("{}", "-".repeat(id_width + 36));

    let now = unix_now();
    for session in sessions {
        let status = serde_json::to_value(session.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        println!(
            "{:<id_width$}  {:<8}  {:>10}  {:>10}",
            session.id,
            status,
            format_relative_time(now, session.created_at),
            format_remaining(now, session.expires_at),
            id_width = id_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(now: u64, timestamp: u64) -> String {
    format!("{} ago", format_span(now.saturating_sub(timestamp)))
}

/// Format time left until `deadline` (e.g., "in 45s").
fn format_remaining(now: u64, deadline: u64) -> String {
    if deadline <= now {
        "expired".to_string()
    } else {
        format!("in {}", format_span(deadline - now))
    }
}

fn format_span(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}
