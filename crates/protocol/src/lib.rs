//! # Session Orchestrator Protocol
//!
//! Wire types shared between the orchestrator's HTTP API and its clients.
//!
//! ## Overview
//!
//! The orchestrator exposes a small REST surface for managing browser
//! sessions. Every request and response body on that surface is one of the
//! types defined here, encoded as JSON:
//!
//! - **Session records**: what a client sees when it creates or reads a session
//! - **Error bodies**: a stable `{code, message}` shape for every non-2xx reply
//! - **Worker status**: the report served by an embedded worker's `/status`
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::messages::{parse_session_data, ErrorBody, ErrorCode};
//!
//! let data = parse_session_data(r#"{"user":"alice"}"#).unwrap();
//! assert_eq!(data["user"], "alice");
//!
//! let body = ErrorBody::new(ErrorCode::SessionNotFound, "no such session");
//! assert_eq!(body.code.http_status(), 404);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Request/response bodies and error codes
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    parse_session_data, ErrorBody, ErrorCode, SessionData, SessionList, SessionRecord,
    SessionState, WorkerStatus,
};
