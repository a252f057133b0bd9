//! HTTP boundary of the orchestrator.
//!
//! Routes:
//!
//! | Method | Path | Handler |
//! |---|---|---|
//! | GET | `/health` | orchestrator health |
//! | GET, POST | `/sessions` | list, create |
//! | GET, DELETE | `/sessions/{id}` | read, delete |
//! | GET | `/sessions/{id}/health` | worker health passthrough |
//! | GET | `/sessions/{id}/status` | worker status passthrough |
//! | GET, POST, DELETE | `/sessions/{id}/worker/{*path}` | generic worker passthrough |
//! | GET | `/docs` | API reference UI |
//! | GET | `/openapi.json` | OpenAPI document |
//!
//! Every non-2xx reply carries a [`protocol::ErrorBody`].

pub mod error;
pub mod handlers;
pub mod openapi;

pub use error::ApiError;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::engine::Engine;
use crate::router::RequestRouter;
use crate::supervisor::WorkerLauncher;

/// Shared state handed to every handler.
pub struct AppState<L> {
    pub engine: Arc<Engine<L>>,
    pub router: RequestRouter,
    /// Worker health endpoint, forwarded by `/sessions/{id}/health`.
    pub health_path: String,
}

impl<L> Clone for AppState<L> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            router: self.router.clone(),
            health_path: self.health_path.clone(),
        }
    }
}

impl<L: WorkerLauncher> AppState<L> {
    pub fn new(engine: Arc<Engine<L>>, router: RequestRouter, health_path: impl Into<String>) -> Self {
        Self {
            engine,
            router,
            health_path: health_path.into(),
        }
    }
}

/// Build the API router.
pub fn build_router<L: WorkerLauncher>(state: AppState<L>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::<L>))
        .route(
            "/sessions",
            get(handlers::list_sessions::<L>).post(handlers::create_session::<L>),
        )
        .route(
            "/sessions/{id}",
            get(handlers::get_session::<L>).delete(handlers::delete_session::<L>),
        )
        .route("/sessions/{id}/health", get(handlers::worker_health::<L>))
        .route("/sessions/{id}/status", get(handlers::worker_status::<L>))
        .route(
            "/sessions/{id}/worker/{*path}",
            get(handlers::worker_proxy::<L>)
                .post(handlers::worker_proxy::<L>)
                .delete(handlers::worker_proxy::<L>),
        )
        .merge(Scalar::with_url("/docs", openapi::ApiDoc::openapi()))
        .route(
            "/openapi.json",
            get(|| async { axum::Json(openapi::ApiDoc::openapi()) }),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` is cancelled.
pub async fn serve<L: WorkerLauncher>(
    listener: TcpListener,
    state: AppState<L>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "HTTP API listening");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortsConfig, WorkerConfig, WorkerMode};
    use crate::ports::PortAllocator;
    use crate::store::Store;
    use crate::supervisor::testing::FakeLauncher;
    use crate::supervisor::WorkerSupervisor;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use protocol::{ErrorBody, ErrorCode, SessionList, SessionRecord, SessionState};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(launcher: &Arc<FakeLauncher>, ports: (u16, u16)) -> Router {
        let store = Store::open_in_memory().unwrap();
        let allocator = PortAllocator::new(
            store.clone(),
            &PortsConfig {
                range_start: ports.0,
                range_end: ports.1,
                skip_bound: false,
            },
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        );
        let config = WorkerConfig {
            mode: WorkerMode::Embedded,
            startup_timeout_ms: 40,
            health_poll_interval_ms: 5,
            start_attempts: 1,
            ..WorkerConfig::default()
        };
        let supervisor = WorkerSupervisor::new(Arc::clone(launcher), &config);
        let engine = Arc::new(Engine::new(
            store.clone(),
            allocator,
            supervisor,
            Duration::from_secs(60),
        ));
        build_router(AppState::new(
            engine,
            RequestRouter::new(store, "127.0.0.1"),
            "/health",
        ))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn error_code(body: &[u8]) -> ErrorCode {
        serde_json::from_slice::<ErrorBody>(body).unwrap().code
    }

    #[tokio::test]
    async fn test_health() {
        let app = app(&FakeLauncher::new(), (43200, 43209));
        let (status, body) = send(&app, "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn test_openapi_document_lists_every_route() {
        let app = app(&FakeLauncher::new(), (43290, 43299));
        let (status, body) = send(&app, "GET", "/openapi.json", "").await;
        assert_eq!(status, StatusCode::OK);

        let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let paths = doc["paths"].as_object().unwrap();
        for path in [
            "/health",
            "/sessions",
            "/sessions/{id}",
            "/sessions/{id}/health",
            "/sessions/{id}/status",
            "/sessions/{id}/worker/{path}",
        ] {
            assert!(paths.contains_key(path), "missing {path}");
        }
        assert!(paths["/sessions"]["post"].is_object());
        assert!(paths["/sessions/{id}"]["delete"].is_object());
        assert!(paths["/sessions/{id}/worker/{path}"]["post"].is_object());
        assert!(doc["components"]["schemas"]["SessionRecord"].is_object());
        assert!(doc["components"]["schemas"]["ErrorBody"].is_object());
    }

    #[tokio::test]
    async fn test_docs_page_served() {
        let app = app(&FakeLauncher::new(), (43290, 43299));
        let (status, body) = send(&app, "GET", "/docs", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8_lossy(&body).contains("<html"));
    }

    #[tokio::test]
    async fn test_create_read_delete() {
        let app = app(&FakeLauncher::new(), (43210, 43219));

        let (status, body) = send(&app, "POST", "/sessions", r#"{"user":"alice"}"#).await;
        assert_eq!(status, StatusCode::CREATED);
        let created: SessionRecord = serde_json::from_slice(&body).unwrap();
        assert_eq!(created.status, SessionState::Active);
        assert_eq!(created.data["user"], "alice");
        assert!(created.expires_at > created.created_at);

        let uri = format!("/sessions/{}", created.id);
        let (status, body) = send(&app, "GET", &uri, "").await;
        assert_eq!(status, StatusCode::OK);
        let read: SessionRecord = serde_json::from_slice(&body).unwrap();
        assert_eq!(read, created);

        let (status, body) = send(&app, "DELETE", &uri, "").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());

        let (status, body) = send(&app, "GET", &uri, "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error_code(&body), ErrorCode::SessionNotFound);

        let (status, body) = send(&app, "DELETE", &uri, "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error_code(&body), ErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn test_create_with_empty_body() {
        let app = app(&FakeLauncher::new(), (43220, 43229));
        let (status, body) = send(&app, "POST", "/sessions", "").await;
        assert_eq!(status, StatusCode::CREATED);
        let created: SessionRecord = serde_json::from_slice(&body).unwrap();
        assert!(created.data.is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_non_object() {
        let launcher = FakeLauncher::new();
        let app = app(&launcher, (43230, 43239));
        let (status, body) = send(&app, "POST", "/sessions", "[1,2]").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), ErrorCode::BadRequest);
        assert_eq!(launcher.start_count(), 0);
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let app = app(&FakeLauncher::new(), (43240, 43249));
        send(&app, "POST", "/sessions", r#"{"n":1}"#).await;
        send(&app, "POST", "/sessions", r#"{"n":2}"#).await;

        let (status, body) = send(&app, "GET", "/sessions", "").await;
        assert_eq!(status, StatusCode::OK);
        let list: SessionList = serde_json::from_slice(&body).unwrap();
        assert_eq!(list.sessions.len(), 2);
    }

    #[tokio::test]
    async fn test_port_exhaustion_is_503_with_retry_after() {
        let app = app(&FakeLauncher::new(), (43250, 43250));
        let (status, _) = send(&app, "POST", "/sessions", "{}").await;
        assert_eq!(status, StatusCode::CREATED);

        let request = Request::builder()
            .method("POST")
            .uri("/sessions")
            .body(Body::from("{}"))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(error_code(&bytes), ErrorCode::PortExhausted);
    }

    #[tokio::test]
    async fn test_worker_start_failure_is_502() {
        let launcher = FakeLauncher::new();
        launcher.fail_next_starts(1);
        let app = app(&launcher, (43260, 43269));

        let (status, body) = send(&app, "POST", "/sessions", "{}").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(error_code(&body), ErrorCode::WorkerStartFailure);

        let (_, body) = send(&app, "GET", "/sessions", "").await;
        let list: SessionList = serde_json::from_slice(&body).unwrap();
        assert!(list.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_passthrough_unknown_session_is_not_routable() {
        let app = app(&FakeLauncher::new(), (43270, 43279));
        for uri in [
            "/sessions/nope/health",
            "/sessions/nope/status",
            "/sessions/nope/worker/echo",
        ] {
            let (status, body) = send(&app, "GET", uri, "").await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(error_code(&body), ErrorCode::SessionNotRoutable);
        }
    }

    #[tokio::test]
    async fn test_passthrough_without_listening_worker_is_502() {
        // The fake launcher binds nothing, so the port is unreachable.
        let app = app(&FakeLauncher::new(), (43280, 43289));
        let (_, body) = send(&app, "POST", "/sessions", "{}").await;
        let created: SessionRecord = serde_json::from_slice(&body).unwrap();

        let (status, body) = send(&app, "GET", &format!("/sessions/{}/status", created.id), "").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(error_code(&body), ErrorCode::WorkerUnreachable);
    }
}
