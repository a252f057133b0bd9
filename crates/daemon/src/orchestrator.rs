//! Orchestrator wiring.
//!
//! [`Orchestrator`] owns the pieces of a running instance: the pid file, the
//! state store, the engine, the TTL reaper and the HTTP server. Startup
//! resumes journaled operations and reconciles recorded state before the API
//! accepts its first request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::{Engine, RecoveryReport};
use crate::http::{self, AppState};
use crate::pidfile::PidFile;
use crate::reaper::Reaper;
use crate::router::RequestRouter;
use crate::store::Store;
use crate::supervisor::Launcher;

/// How long `stop` waits for background tasks to wind down.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Orchestrator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Not started, or fully stopped.
    Stopped,
    /// Running recovery and binding the API.
    Starting,
    /// Serving requests.
    Running,
    /// Stopping background tasks.
    ShuttingDown,
}

/// A running (or startable) orchestrator instance.
pub struct Orchestrator {
    config: Config,
    state: OrchestratorState,
    shutdown: CancellationToken,
    pid_file: Option<PidFile>,
    engine: Option<Arc<Engine<Launcher>>>,
    local_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Create an orchestrator from a validated configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: OrchestratorState::Stopped,
            shutdown: CancellationToken::new(),
            pid_file: None,
            engine: None,
            local_addr: None,
            tasks: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Address the HTTP API is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The engine, once started.
    pub fn engine(&self) -> Option<&Arc<Engine<Launcher>>> {
        self.engine.as_ref()
    }

    /// Token cancelled when the orchestrator shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the orchestrator.
    ///
    /// Takes the pid file, opens the state store, resumes interrupted
    /// operations, reconciles workers, then starts the reaper and the API.
    /// Returns what recovery did.
    pub async fn start(&mut self) -> Result<RecoveryReport> {
        if self.state != OrchestratorState::Stopped {
            anyhow::bail!("Orchestrator is already running");
        }
        self.state = OrchestratorState::Starting;

        match self.start_inner().await {
            Ok(report) => {
                self.state = OrchestratorState::Running;
                Ok(report)
            }
            Err(e) => {
                self.shutdown.cancel();
                self.engine = None;
                self.pid_file = None;
                self.state = OrchestratorState::Stopped;
                self.shutdown = CancellationToken::new();
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self) -> Result<RecoveryReport> {
        let config = &self.config;
        info!(data_dir = %config.daemon.data_dir.display(), "Starting session orchestrator");

        std::fs::create_dir_all(&config.daemon.data_dir).with_context(|| {
            format!(
                "Failed to create data directory: {}",
                config.daemon.data_dir.display()
            )
        })?;
        let pid_file = PidFile::acquire(config.pid_file_path()).context("Failed to take pid file")?;

        let store = Store::open(config.state_db_path()).context("Failed to open state store")?;
        let engine = Arc::new(Engine::from_config(
            store.clone(),
            config,
            Launcher::from_config(&config.worker),
        ));

        let recovered = engine.recover().await.context("Failed to resume operations")?;
        let reconciled = engine.reconcile().await.context("Failed to reconcile workers")?;
        let report = RecoveryReport {
            sessions_reconciled: reconciled.sessions_reconciled,
            reservations_released: reconciled.reservations_released,
            ..recovered
        };
        if report != RecoveryReport::default() {
            info!(?report, "Recovered state from previous run");
        }

        let listener = TcpListener::bind(&config.http.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.http.bind_addr))?;
        let local_addr = listener.local_addr()?;

        let reaper = Reaper::new(Arc::clone(&engine), config.session.reap_interval());
        self.tasks.push(reaper.spawn(self.shutdown.child_token()));

        let state = AppState::new(
            Arc::clone(&engine),
            RequestRouter::new(store, config.worker.host.clone()),
            config.worker.health_path.clone(),
        );
        let token = self.shutdown.child_token();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = http::serve(listener, state, token).await {
                warn!(error = %e, "HTTP server exited with error");
            }
        }));

        info!(addr = %local_addr, mode = ?config.worker.mode, "Session orchestrator running");
        self.pid_file = Some(pid_file);
        self.engine = Some(engine);
        self.local_addr = Some(local_addr);
        Ok(report)
    }

    /// Stop the orchestrator gracefully.
    ///
    /// Stops the API and the reaper. Workers keep running unless
    /// `session.stop_workers_on_shutdown` is set; either way the next start
    /// reconciles them.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == OrchestratorState::Stopped {
            return Ok(());
        }
        self.state = OrchestratorState::ShuttingDown;
        info!("Stopping session orchestrator");

        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Background task failed"),
                Err(_) => warn!("Background task did not stop in time"),
            }
        }

        if let Some(engine) = self.engine.take() {
            if self.config.session.stop_workers_on_shutdown {
                let stopped = engine.stop_all_workers().await;
                info!(count = stopped, "Stopped workers");
            }
        }

        self.pid_file = None;
        self.local_addr = None;
        self.shutdown = CancellationToken::new();
        self.state = OrchestratorState::Stopped;
        info!("Session orchestrator stopped");
        Ok(())
    }
}
