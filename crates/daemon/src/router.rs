//! Request router for reaching a session's worker.
//!
//! [`RequestRouter::resolve`] maps a session id to the address of its ready
//! worker using the durable binding in the store; [`RequestRouter::forward`]
//! proxies an HTTP request to that address.

use std::time::Duration;

use reqwest::Method;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};
use crate::store::{now_millis, Store, WorkerState};
use protocol::SessionState;

/// Timeout for a proxied worker request.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a session's worker can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAddress {
    pub session_id: String,
    pub worker_id: String,
    pub host: String,
    pub port: u16,
}

impl WorkerAddress {
    /// URL of `path` on this worker. `path` must start with `/`.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

/// A worker's reply to a forwarded request.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Resolves sessions to workers and forwards requests to them.
#[derive(Clone)]
pub struct RequestRouter {
    store: Store,
    host: String,
    client: reqwest::Client,
}

impl RequestRouter {
    /// Workers are reached on `host`.
    pub fn new(store: Store, host: impl Into<String>) -> Self {
        Self {
            store,
            host: host.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Resolve a session to its worker.
    ///
    /// Fails with [`OrchestratorError::SessionNotRoutable`] unless the
    /// session is `Active`, within its TTL, and bound to a `Ready` worker.
    pub fn resolve(&self, session_id: &str) -> Result<WorkerAddress> {
        let not_routable = || OrchestratorError::SessionNotRoutable(session_id.to_string());

        let (session, worker) = self
            .store
            .get_worker_for_session(session_id)?
            .ok_or_else(not_routable)?;

        if session.status != SessionState::Active
            || worker.status != WorkerState::Ready
            || session.is_expired_at(now_millis())
        {
            return Err(not_routable());
        }

        Ok(WorkerAddress {
            session_id: session.id,
            worker_id: worker.id,
            host: self.host.clone(),
            port: worker.port,
        })
    }

    /// Forward a request to the session's worker.
    ///
    /// `path_and_query` is relative to the worker root and must start with `/`.
    pub async fn forward(
        &self,
        session_id: &str,
        method: Method,
        path_and_query: &str,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> Result<ProxyResponse> {
        let address = self.resolve(session_id)?;
        let url = address.url(path_and_query);
        debug!(session_id = %session_id, worker_id = %address.worker_id, url = %url, "forwarding to worker");

        let mut request = self
            .client
            .request(method, &url)
            .timeout(FORWARD_TIMEOUT)
            .body(body);
        if let Some(content_type) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }

        let unreachable = |e: reqwest::Error| {
            warn!(session_id = %session_id, port = address.port, error = %e, "worker unreachable");
            OrchestratorError::WorkerUnreachable(format!("{}: {}", address.worker_id, e))
        };

        let response = request.send().await.map_err(unreachable)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(unreachable)?.to_vec();

        Ok(ProxyResponse {
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::store::{Operation, OperationKind, OperationStep, Session, TerminationReason, Worker};
    use crate::supervisor::{EmbeddedLauncher, WorkerLauncher};
    use protocol::{SessionData, WorkerStatus};

    fn free_port() -> u16 {
        std::net::TcpListener::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Write an active binding for `session_id` on `port` straight into the store.
    fn bind(store: &Store, session_id: &str, port: u16, ttl_ms: u64) {
        let now = now_millis();
        let op_id = format!("op-{session_id}");
        let worker_id = format!("w-{session_id}");
        store
            .begin_create(
                &Operation {
                    id: op_id.clone(),
                    kind: OperationKind::Create,
                    session_id: session_id.to_string(),
                    step: OperationStep::Started,
                    worker_id: worker_id.clone(),
                    port: None,
                    pid: None,
                    reason: None,
                    created_at: now,
                },
                &Session {
                    id: session_id.to_string(),
                    created_at: now,
                    ttl_deadline: now + ttl_ms,
                    status: SessionState::Pending,
                    data: SessionData::new(),
                    worker_id: None,
                    termination_reason: None,
                },
            )
            .unwrap();
        store
            .record_worker_starting(&Worker {
                id: worker_id.clone(),
                session_id: session_id.to_string(),
                port,
                status: WorkerState::Starting,
                started_at: now,
                pid: None,
            })
            .unwrap();
        store.commit_binding(&op_id, session_id, &worker_id).unwrap();
    }

    #[test]
    fn test_resolve_active_session() {
        let store = Store::open_in_memory().unwrap();
        bind(&store, "s1", 4100, 60_000);
        let router = RequestRouter::new(store, "127.0.0.1");

        let address = router.resolve("s1").unwrap();
        assert_eq!(address.port, 4100);
        assert_eq!(address.worker_id, "w-s1");
        assert_eq!(address.url("/health"), "http://127.0.0.1:4100/health");
    }

    #[test]
    fn test_resolve_unknown_pending_terminated_expired() {
        let store = Store::open_in_memory().unwrap();
        let router = RequestRouter::new(store.clone(), "127.0.0.1");

        assert!(matches!(
            router.resolve("missing"),
            Err(OrchestratorError::SessionNotRoutable(_))
        ));

        bind(&store, "gone", 4101, 60_000);
        store
            .mark_terminated(None, "gone", TerminationReason::Deleted)
            .unwrap();
        assert!(matches!(
            router.resolve("gone"),
            Err(OrchestratorError::SessionNotRoutable(_))
        ));

        bind(&store, "old", 4102, 0);
        assert!(matches!(
            router.resolve("old"),
            Err(OrchestratorError::SessionNotRoutable(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_to_embedded_worker() {
        let store = Store::open_in_memory().unwrap();
        let port = free_port();
        let launcher = EmbeddedLauncher::new(&WorkerConfig::default());
        let handle = launcher.start("w-s1", port).await.unwrap();
        bind(&store, "s1", port, 60_000);
        let router = RequestRouter::new(store, "127.0.0.1");

        let health = router
            .forward("s1", Method::GET, "/health", None, Vec::new())
            .await
            .unwrap();
        assert_eq!(health.status, 200);
        assert_eq!(health.body, b"ok");

        let status = router
            .forward("s1", Method::GET, "/status", None, Vec::new())
            .await
            .unwrap();
        let status: WorkerStatus = serde_json::from_slice(&status.body).unwrap();
        assert_eq!(status.port, port);

        let echo = router
            .forward("s1", Method::POST, "/echo", Some("text/plain"), b"hi".to_vec())
            .await
            .unwrap();
        assert_eq!(echo.body, b"hi");

        launcher.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_to_dead_worker_is_unreachable() {
        let store = Store::open_in_memory().unwrap();
        bind(&store, "s1", free_port(), 60_000);
        let router = RequestRouter::new(store, "127.0.0.1");

        let err = router
            .forward("s1", Method::GET, "/health", None, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::WorkerUnreachable(_)));
    }
}
