//! API error handling.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use protocol::{ErrorBody, ErrorCode};
use tracing::{error, warn};

use crate::error::OrchestratorError;

/// Seconds a client should wait before retrying a capacity error.
const RETRY_AFTER_SECS: &str = "1";

/// API error type that converts to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    /// An error with the status its code maps to.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::from_u16(code.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code,
            message: message.into(),
        }
    }

    /// Constructs a 400 Bad Request.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }
}

impl IntoResponse for ApiError {
    /// JSON `{code, message}` body; capacity errors carry `Retry-After`.
    fn into_response(self) -> Response {
        let retry_after = self.code == ErrorCode::PortExhausted;
        let body = ErrorBody::new(self.code, self.message);
        let mut response = (self.status, Json(body)).into_response();
        if retry_after {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from_static(RETRY_AFTER_SECS),
            );
        }
        response
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let code = err.code();
        if code == ErrorCode::InternalError {
            error!(error = %err, "request failed");
        } else if !err.is_expected() {
            warn!(error = %err, "request failed");
        }
        Self::new(code, err.to_string())
    }
}
