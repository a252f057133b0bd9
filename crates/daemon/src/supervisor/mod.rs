//! Worker supervision.
//!
//! A [`WorkerLauncher`] is the raw capability to start, stop and probe one
//! worker bound to a port. [`WorkerSupervisor`] layers the readiness policy
//! on top: bounded start attempts with backoff, health polling until ready,
//! and best-effort cleanup of attempts that never became ready.
//!
//! A [`WorkerHandle`] carries nothing that is not also in the state store,
//! so a handle can be rebuilt from a [`Worker`] record after a restart.

mod embedded;
mod process;

pub use embedded::EmbeddedLauncher;
pub use process::{ProcessLauncher, WORKER_ID_ENV};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{WorkerConfig, WorkerMode};
use crate::store::Worker;

/// Per-request timeout for a single health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Worker supervision errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The worker never reported ready.
    #[error("worker {worker_id} on port {port} not ready after {attempts} attempt(s)")]
    StartFailure {
        worker_id: String,
        port: u16,
        attempts: u32,
    },

    /// The worker could not be launched at all.
    #[error("failed to launch worker: {0}")]
    Spawn(String),

    /// The worker could not be stopped cleanly.
    #[error("failed to stop worker {worker_id}: {reason}")]
    Stop { worker_id: String, reason: String },
}

/// Everything needed to reach and stop a running worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub port: u16,
    pub pid: Option<u32>,
}

impl From<&Worker> for WorkerHandle {
    fn from(worker: &Worker) -> Self {
        Self {
            worker_id: worker.id.clone(),
            port: worker.port,
            pid: worker.pid,
        }
    }
}

/// Capability to run workers. Implementations decide what a worker is
/// (an OS process, an in-process server) behind one contract.
pub trait WorkerLauncher: Send + Sync + 'static {
    /// Launch a worker bound to `port`. Does not wait for readiness.
    fn start(
        &self,
        worker_id: &str,
        port: u16,
    ) -> impl Future<Output = Result<WorkerHandle, SupervisorError>> + Send;

    /// Stop a worker. Stopping an already-stopped worker succeeds.
    fn stop(&self, handle: &WorkerHandle) -> impl Future<Output = Result<(), SupervisorError>> + Send;

    /// Whether the worker currently answers its health endpoint.
    fn health_check(&self, handle: &WorkerHandle) -> impl Future<Output = bool> + Send;
}

impl<L: WorkerLauncher> WorkerLauncher for Arc<L> {
    fn start(
        &self,
        worker_id: &str,
        port: u16,
    ) -> impl Future<Output = Result<WorkerHandle, SupervisorError>> + Send {
        (**self).start(worker_id, port)
    }

    fn stop(&self, handle: &WorkerHandle) -> impl Future<Output = Result<(), SupervisorError>> + Send {
        (**self).stop(handle)
    }

    fn health_check(&self, handle: &WorkerHandle) -> impl Future<Output = bool> + Send {
        (**self).health_check(handle)
    }
}

/// Launcher selected by `worker.mode`.
pub enum Launcher {
    Process(ProcessLauncher),
    Embedded(EmbeddedLauncher),
}

impl Launcher {
    pub fn from_config(config: &WorkerConfig) -> Self {
        match config.mode {
            WorkerMode::Process => Launcher::Process(ProcessLauncher::new(config)),
            WorkerMode::Embedded => Launcher::Embedded(EmbeddedLauncher::new(config)),
        }
    }
}

impl WorkerLauncher for Launcher {
    async fn start(&self, worker_id: &str, port: u16) -> Result<WorkerHandle, SupervisorError> {
        match self {
            Launcher::Process(l) => l.start(worker_id, port).await,
            Launcher::Embedded(l) => l.start(worker_id, port).await,
        }
    }

    async fn stop(&self, handle: &WorkerHandle) -> Result<(), SupervisorError> {
        match self {
            Launcher::Process(l) => l.stop(handle).await,
            Launcher::Embedded(l) => l.stop(handle).await,
        }
    }

    async fn health_check(&self, handle: &WorkerHandle) -> bool {
        match self {
            Launcher::Process(l) => l.health_check(handle).await,
            Launcher::Embedded(l) => l.health_check(handle).await,
        }
    }
}

/// HTTP health probe shared by the launchers.
#[derive(Clone)]
pub(crate) struct HealthProbe {
    client: reqwest::Client,
    host: String,
    path: String,
}

impl HealthProbe {
    pub(crate) fn new(host: &str, path: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: host.to_string(),
            path: path.to_string(),
        }
    }

    pub(crate) async fn check(&self, port: u16) -> bool {
        let url = format!("http://{}:{}{}", self.host, port, self.path);
        match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(port = port, error = %e, "health probe failed");
                false
            }
        }
    }
}

/// Starts workers and waits for them to become ready.
pub struct WorkerSupervisor<L> {
    launcher: L,
    config: WorkerConfig,
}

impl<L: WorkerLauncher> WorkerSupervisor<L> {
    pub fn new(launcher: L, config: &WorkerConfig) -> Self {
        Self {
            launcher,
            config: config.clone(),
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Launch a worker on `port` and poll it until ready.
    ///
    /// Each attempt gets `startup_timeout`. An attempt that does not become
    /// ready is stopped before the next one; a failed stop is logged only.
    pub async fn start(&self, worker_id: &str, port: u16) -> Result<WorkerHandle, SupervisorError> {
        self.start_observed(worker_id, port, |_| {}).await
    }

    /// Like [`start`](Self::start), calling `on_launch` with every freshly
    /// launched handle before its readiness wait begins.
    pub async fn start_observed<F>(
        &self,
        worker_id: &str,
        port: u16,
        on_launch: F,
    ) -> Result<WorkerHandle, SupervisorError>
    where
        F: Fn(&WorkerHandle) + Send + Sync,
    {
        let attempts = self.config.start_attempts.max(1);

        for attempt in 1..=attempts {
            match self.launcher.start(worker_id, port).await {
                Ok(handle) => {
                    on_launch(&handle);
                    if self.wait_ready(&handle).await {
                        info!(
                            worker_id = %worker_id,
                            port = port,
                            attempt = attempt,
                            "worker ready"
                        );
                        return Ok(handle);
                    }
                    warn!(
                        worker_id = %worker_id,
                        port = port,
                        attempt = attempt,
                        "worker not ready before timeout"
                    );
                    if let Err(e) = self.launcher.stop(&handle).await {
                        warn!(worker_id = %worker_id, error = %e, "cleanup of unready worker failed");
                    }
                }
                Err(e) => {
                    warn!(worker_id = %worker_id, port = port, attempt = attempt, error = %e, "worker launch failed");
                }
            }

            if attempt < attempts {
                let backoff = self.config.retry_backoff(attempt);
                debug!(worker_id = %worker_id, backoff_ms = backoff.as_millis() as u64, "retrying worker start");
                tokio::time::sleep(backoff).await;
            }
        }

        Err(SupervisorError::StartFailure {
            worker_id: worker_id.to_string(),
            port,
            attempts,
        })
    }

    /// Stop a worker. Idempotent.
    pub async fn stop(&self, handle: &WorkerHandle) -> Result<(), SupervisorError> {
        self.launcher.stop(handle).await
    }

    pub async fn health_check(&self, handle: &WorkerHandle) -> bool {
        self.launcher.health_check(handle).await
    }

    async fn wait_ready(&self, handle: &WorkerHandle) -> bool {
        let deadline = Instant::now() + self.config.startup_timeout();
        loop {
            if self.launcher.health_check(handle).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.health_poll_interval()).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory launcher for engine and reaper tests.

    use super::*;
    use dashmap::{DashMap, DashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Tracks "running" workers in memory. Shared through `Arc` it plays
    /// the role of the operating system across simulated restarts.
    #[derive(Default)]
    pub(crate) struct FakeLauncher {
        running: DashMap<String, u16>,
        unhealthy: DashSet<String>,
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail_next_starts: AtomicUsize,
        fail_stops: AtomicBool,
    }

    impl FakeLauncher {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// The next `n` launched workers never become healthy.
        pub(crate) fn fail_next_starts(&self, n: usize) {
            self.fail_next_starts.store(n, Ordering::SeqCst);
        }

        pub(crate) fn fail_stops(&self, fail: bool) {
            self.fail_stops.store(fail, Ordering::SeqCst);
        }

        /// Simulate every worker process dying.
        pub(crate) fn kill_all(&self) {
            self.running.clear();
        }

        pub(crate) fn running_count(&self) -> usize {
            self.running.len()
        }

        pub(crate) fn running_ports(&self) -> Vec<u16> {
            self.running.iter().map(|e| *e.value()).collect()
        }

        pub(crate) fn is_running(&self, worker_id: &str) -> bool {
            self.running.contains_key(worker_id)
        }

        pub(crate) fn start_count(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }

        pub(crate) fn stop_count(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    impl WorkerLauncher for FakeLauncher {
        async fn start(&self, worker_id: &str, port: u16) -> Result<WorkerHandle, SupervisorError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let unhealthy = self
                .fail_next_starts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if unhealthy {
                self.unhealthy.insert(worker_id.to_string());
            } else {
                self.unhealthy.remove(worker_id);
            }
            self.running.insert(worker_id.to_string(), port);
            Ok(WorkerHandle {
                worker_id: worker_id.to_string(),
                port,
                pid: Some(10_000 + port as u32),
            })
        }

        async fn stop(&self, handle: &WorkerHandle) -> Result<(), SupervisorError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail_stops.load(Ordering::SeqCst) {
                return Err(SupervisorError::Stop {
                    worker_id: handle.worker_id.clone(),
                    reason: "simulated".to_string(),
                });
            }
            self.running.remove(&handle.worker_id);
            Ok(())
        }

        async fn health_check(&self, handle: &WorkerHandle) -> bool {
            self.running.get(&handle.worker_id).map(|p| *p) == Some(handle.port)
                && !self.unhealthy.contains(&handle.worker_id)
        }
    }
}
