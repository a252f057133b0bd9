//! HTTP request handlers.

use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use protocol::{
    parse_session_data, ErrorBody, SessionData, SessionList, SessionRecord, WorkerStatus,
};
use tracing::info;

use super::error::ApiError;
use super::AppState;
use crate::error::OrchestratorError;
use crate::router::ProxyResponse;
use crate::supervisor::WorkerLauncher;

/// `GET /health`: `ok` once the state store answers.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Orchestrator is healthy", body = String, content_type = "text/plain"),
        (status = 500, description = "State store unavailable", body = ErrorBody),
    ),
    tag = "health"
)]
pub async fn health<L: WorkerLauncher>(State(state): State<AppState<L>>) -> Response {
    match state.engine.store().ping() {
        Ok(()) => "ok".into_response(),
        Err(e) => ApiError::new(protocol::ErrorCode::InternalError, e.to_string()).into_response(),
    }
}

/// `POST /sessions`: body is an arbitrary JSON object (empty body means `{}`).
#[utoipa::path(
    post,
    path = "/sessions",
    request_body(content = Object, description = "Opaque session payload", content_type = "application/json"),
    responses(
        (status = 201, description = "Session created with a ready worker", body = SessionRecord),
        (status = 400, description = "Body is not a JSON object", body = ErrorBody),
        (status = 502, description = "Worker never became ready", body = ErrorBody),
        (status = 503, description = "No free port, retry later", body = ErrorBody),
    ),
    tag = "sessions"
)]
pub async fn create_session<L: WorkerLauncher>(
    State(state): State<AppState<L>>,
    body: Bytes,
) -> Result<(StatusCode, Json<SessionRecord>), ApiError> {
    let data = parse_body(&body)?;
    let session = state.engine.create_session_detached(data).await?;
    info!(session_id = %session.id, "session created");
    Ok((StatusCode::CREATED, Json(session.to_record())))
}

/// `GET /sessions`
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "All readable sessions", body = SessionList),
    ),
    tag = "sessions"
)]
pub async fn list_sessions<L: WorkerLauncher>(
    State(state): State<AppState<L>>,
) -> Result<Json<SessionList>, ApiError> {
    let sessions = state
        .engine
        .list_sessions()?
        .iter()
        .map(|s| s.to_record())
        .collect();
    Ok(Json(SessionList { sessions }))
}

/// `GET /sessions/{id}`
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    params(
        ("id" = String, Path, description = "Session id"),
    ),
    responses(
        (status = 200, description = "Session", body = SessionRecord),
        (status = 404, description = "Unknown, expired or terminated", body = ErrorBody),
    ),
    tag = "sessions"
)]
pub async fn get_session<L: WorkerLauncher>(
    State(state): State<AppState<L>>,
    Path(id): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    let session = state.engine.get_session(&id)?;
    Ok(Json(session.to_record()))
}

/// `DELETE /sessions/{id}`
#[utoipa::path(
    delete,
    path = "/sessions/{id}",
    params(
        ("id" = String, Path, description = "Session id"),
    ),
    responses(
        (status = 204, description = "Session terminated"),
        (status = 404, description = "Unknown or already terminated", body = ErrorBody),
    ),
    tag = "sessions"
)]
pub async fn delete_session<L: WorkerLauncher>(
    State(state): State<AppState<L>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_session(&id).await?;
    info!(session_id = %id, "session deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /sessions/{id}/health`: the worker's own health endpoint.
#[utoipa::path(
    get,
    path = "/sessions/{id}/health",
    params(
        ("id" = String, Path, description = "Session id"),
    ),
    responses(
        (status = 200, description = "Worker health response, passed through"),
        (status = 404, description = "Session not routable", body = ErrorBody),
        (status = 502, description = "Worker unreachable", body = ErrorBody),
    ),
    tag = "workers"
)]
pub async fn worker_health<L: WorkerLauncher>(
    State(state): State<AppState<L>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let reply = state
        .router
        .forward(&id, reqwest::Method::GET, &state.health_path, None, Vec::new())
        .await?;
    Ok(proxy_response(reply))
}

/// `GET /sessions/{id}/status`: the worker's status report.
#[utoipa::path(
    get,
    path = "/sessions/{id}/status",
    params(
        ("id" = String, Path, description = "Session id"),
    ),
    responses(
        (status = 200, description = "Worker status report", body = WorkerStatus),
        (status = 404, description = "Session not routable", body = ErrorBody),
        (status = 502, description = "Worker unreachable", body = ErrorBody),
    ),
    tag = "workers"
)]
pub async fn worker_status<L: WorkerLauncher>(
    State(state): State<AppState<L>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let reply = state
        .router
        .forward(&id, reqwest::Method::GET, "/status", None, Vec::new())
        .await?;
    Ok(proxy_response(reply))
}

/// `GET|POST|DELETE /sessions/{id}/worker/{*path}`: passthrough to the worker.
#[utoipa::path(
    method(get, post, delete),
    path = "/sessions/{id}/worker/{path}",
    params(
        ("id" = String, Path, description = "Session id"),
        ("path" = String, Path, description = "Path on the worker"),
    ),
    responses(
        (status = 200, description = "Worker response, passed through"),
        (status = 404, description = "Session not routable", body = ErrorBody),
        (status = 502, description = "Worker unreachable", body = ErrorBody),
    ),
    tag = "workers"
)]
pub async fn worker_proxy<L: WorkerLauncher>(
    State(state): State<AppState<L>>,
    Path((id, path)): Path<(String, String)>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let mut target = format!("/{}", path.trim_start_matches('/'));
    if let Some(query) = query {
        target.push('?');
        target.push_str(&query);
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let reply = state
        .router
        .forward(&id, method, &target, content_type, body.to_vec())
        .await?;
    Ok(proxy_response(reply))
}

fn parse_body(body: &[u8]) -> Result<SessionData, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(SessionData::new());
    }
    let invalid = |msg: String| ApiError::from(OrchestratorError::InvalidRequest(msg));
    let text = std::str::from_utf8(body).map_err(|e| invalid(e.to_string()))?;
    parse_session_data(text).map_err(|e| invalid(e.to_string()))
}

fn proxy_response(reply: ProxyResponse) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = (status, Body::from(reply.body)).into_response();
    if let Some(content_type) = reply
        .content_type
        .and_then(|v| header::HeaderValue::from_str(&v).ok())
    {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    response
}
