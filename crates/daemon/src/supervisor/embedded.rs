//! In-process workers.
//!
//! An embedded worker is a small axum server bound to the allocated port.
//! It answers the same health endpoint a real worker does, which makes it
//! suitable for development and for exercising the full lifecycle in tests
//! without an external binary.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use protocol::WorkerStatus;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{HealthProbe, SupervisorError, WorkerHandle, WorkerLauncher};
use crate::config::WorkerConfig;

struct EmbeddedWorker {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct EmbeddedState {
    port: u16,
    started: Instant,
}

/// Runs workers as tasks on the orchestrator's runtime.
pub struct EmbeddedLauncher {
    host: IpAddr,
    health_path: String,
    stop_grace: Duration,
    probe: HealthProbe,
    workers: DashMap<String, EmbeddedWorker>,
}

impl EmbeddedLauncher {
    pub fn new(config: &WorkerConfig) -> Self {
        let host = config
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Self {
            host,
            health_path: config.health_path.clone(),
            stop_grace: config.stop_grace(),
            probe: HealthProbe::new(&config.host, &config.health_path),
            workers: DashMap::new(),
        }
    }

    /// Number of embedded workers currently serving.
    pub fn running_count(&self) -> usize {
        self.workers.len()
    }
}

impl WorkerLauncher for EmbeddedLauncher {
    async fn start(&self, worker_id: &str, port: u16) -> Result<WorkerHandle, SupervisorError> {
        if let Some((_, old)) = self.workers.remove(worker_id) {
            old.shutdown.cancel();
            let _ = old.task.await;
        }

        let listener = TcpListener::bind(SocketAddr::new(self.host, port))
            .await
            .map_err(|e| SupervisorError::Spawn(format!("bind {}:{}: {}", self.host, port, e)))?;

        let app = worker_router(&self.health_path, port);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let id = worker_id.to_string();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = result {
                warn!(worker_id = %id, error = %e, "embedded worker stopped with error");
            }
        });

        self.workers
            .insert(worker_id.to_string(), EmbeddedWorker { shutdown, task });
        info!(worker_id = %worker_id, port = port, "embedded worker started");

        Ok(WorkerHandle {
            worker_id: worker_id.to_string(),
            port,
            pid: None,
        })
    }

    async fn stop(&self, handle: &WorkerHandle) -> Result<(), SupervisorError> {
        let Some((_, worker)) = self.workers.remove(&handle.worker_id) else {
            return Ok(());
        };
        worker.shutdown.cancel();
        match tokio::time::timeout(self.stop_grace, worker.task).await {
            Ok(_) => debug!(worker_id = %handle.worker_id, "embedded worker stopped"),
            Err(_) => warn!(worker_id = %handle.worker_id, "embedded worker did not drain in time"),
        }
        Ok(())
    }

    async fn health_check(&self, handle: &WorkerHandle) -> bool {
        self.probe.check(handle.port).await
    }
}

impl Drop for EmbeddedLauncher {
    fn drop(&mut self) {
        for entry in self.workers.iter() {
            entry.value().shutdown.cancel();
        }
    }
}

fn worker_router(health_path: &str, port: u16) -> Router {
    let state = EmbeddedState {
        port,
        started: Instant::now(),
    };
    Router::new()
        .route(health_path, get(|| async { "ok" }))
        .route("/status", get(status))
        .route("/echo", post(|body: String| async move { body }))
        .with_state(state)
}

async fn status(State(state): State<EmbeddedState>) -> Json<WorkerStatus> {
    Json(WorkerStatus {
        port: state.port,
        uptime_secs: state.started.elapsed().as_secs(),
    })
}
