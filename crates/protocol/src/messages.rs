//! Request and response bodies for the orchestrator HTTP API.
//!
//! All bodies are JSON. Session payloads are opaque to the orchestrator: they
//! are stored and echoed back verbatim, so they are carried as a raw JSON
//! object rather than a typed struct.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::error::{ProtocolError, Result};

/// Opaque client-supplied session payload.
pub type SessionData = Map<String, Value>;

/// Client-visible lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Worker is being started.
    Pending,
    /// Worker is ready and the session is routable.
    Active,
    /// Session has been torn down.
    Terminated,
}

/// A session as returned by `POST /sessions` and `GET /sessions/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SessionRecord {
    /// Server-generated session identifier.
    pub id: String,
    /// Unix timestamp (seconds) when the session was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) after which the session is reclaimed.
    pub expires_at: u64,
    /// Current lifecycle state.
    pub status: SessionState,
    /// Client payload, echoed verbatim.
    #[schema(value_type = Object)]
    pub data: SessionData,
}

/// Response body for `GET /sessions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SessionList {
    /// All readable sessions, newest first.
    pub sessions: Vec<SessionRecord>,
}

/// Report served by a worker's `/status` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct WorkerStatus {
    /// Port the worker is bound to.
    pub port: u16,
    /// Seconds since the worker started serving.
    pub uptime_secs: u64,
}

/// Error codes carried in every non-2xx response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Session does not exist or is already terminated.
    SessionNotFound,
    /// Session exists but has no ready worker to route to.
    SessionNotRoutable,
    /// No port is free for a new worker; retry later.
    PortExhausted,
    /// The worker never became ready.
    WorkerStartFailure,
    /// The worker could not be reached while proxying.
    WorkerUnreachable,
    /// Malformed request.
    BadRequest,
    /// Server-side error.
    InternalError,
}

impl ErrorCode {
    /// HTTP status code this error is reported with.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::SessionNotFound | ErrorCode::SessionNotRoutable => 404,
            ErrorCode::PortExhausted => 503,
            ErrorCode::WorkerStartFailure | ErrorCode::WorkerUnreachable => 502,
            ErrorCode::BadRequest => 400,
            ErrorCode::InternalError => 500,
        }
    }

    /// Whether a client may retry the same request unchanged.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::PortExhausted | ErrorCode::WorkerStartFailure | ErrorCode::WorkerUnreachable
        )
    }
}

/// Body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorBody {
    /// Create an error body.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Parse a session payload, rejecting anything that is not a JSON object.
pub fn parse_session_data(json: &str) -> Result<SessionData> {
    match serde_json::from_str::<Value>(json)? {
        Value::Object(map) => Ok(map),
        Value::Null => Err(ProtocolError::NotAnObject("null")),
        Value::Bool(_) => Err(ProtocolError::NotAnObject("boolean")),
        Value::Number(_) => Err(ProtocolError::NotAnObject("number")),
        Value::String(_) => Err(ProtocolError::NotAnObject("string")),
        Value::Array(_) => Err(ProtocolError::NotAnObject("array")),
    }
}
