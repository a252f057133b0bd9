//! Error taxonomy for session lifecycle operations.
//!
//! Lower layers carry their own error enums ([`StoreError`],
//! [`PortError`], [`SupervisorError`]); this module folds them into the
//! outcomes a caller of the engine or router can act on.

use protocol::ErrorCode;
use thiserror::Error;

use crate::ports::PortError;
use crate::store::StoreError;
use crate::supervisor::SupervisorError;

/// Errors surfaced by the engine, the router and the HTTP boundary.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The worker for a new session never became ready.
    #[error("worker failed to start: {0}")]
    WorkerStartFailure(String),

    /// A state transition kept losing races after internal retries.
    #[error("conflicting update on session {0}")]
    Conflict(String),

    /// Session does not exist or is already terminated.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Session exists but cannot be routed to a ready worker.
    #[error("session not routable: {0}")]
    SessionNotRoutable(String),

    /// No port is free in the configured range.
    #[error("no free worker port in {start}..={end}")]
    PortExhausted { start: u16, end: u16 },

    /// A worker process could not be stopped cleanly.
    #[error("worker supervision failed: {0}")]
    ProcessSupervision(String),

    /// A routed request could not reach the worker.
    #[error("worker unreachable: {0}")]
    WorkerUnreachable(String),

    /// Request payload was rejected.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// State store failure.
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Error code reported to HTTP clients.
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::WorkerStartFailure(_) => ErrorCode::WorkerStartFailure,
            OrchestratorError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            OrchestratorError::SessionNotRoutable(_) => ErrorCode::SessionNotRoutable,
            OrchestratorError::PortExhausted { .. } => ErrorCode::PortExhausted,
            OrchestratorError::WorkerUnreachable(_) => ErrorCode::WorkerUnreachable,
            OrchestratorError::InvalidRequest(_) => ErrorCode::BadRequest,
            OrchestratorError::Conflict(_)
            | OrchestratorError::ProcessSupervision(_)
            | OrchestratorError::Store(_)
            | OrchestratorError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether this is an expected, reportable outcome rather than a fault.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            OrchestratorError::SessionNotFound(_)
                | OrchestratorError::SessionNotRoutable(_)
                | OrchestratorError::InvalidRequest(_)
        )
    }
}

impl From<PortError> for OrchestratorError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Exhausted { start, end } => OrchestratorError::PortExhausted { start, end },
            PortError::Store(e) => OrchestratorError::Store(e),
        }
    }
}

impl From<SupervisorError> for OrchestratorError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::StartFailure { .. } => {
                OrchestratorError::WorkerStartFailure(err.to_string())
            }
            SupervisorError::Spawn(_) => OrchestratorError::WorkerStartFailure(err.to_string()),
            SupervisorError::Stop { .. } => OrchestratorError::ProcessSupervision(err.to_string()),
        }
    }
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
