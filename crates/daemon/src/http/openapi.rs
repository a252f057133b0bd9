//! OpenAPI description of the orchestrator API.

use protocol::{ErrorBody, ErrorCode, SessionList, SessionRecord, SessionState, WorkerStatus};
use utoipa::OpenApi;

use super::handlers;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Session Orchestrator API",
        description = "Create, read and delete sessions, each backed by its own worker, and reach a session's worker through the orchestrator.",
        license(name = "MIT OR Apache-2.0")
    ),
    servers(
        (url = "/", description = "Local server")
    ),
    paths(
        handlers::health,
        handlers::create_session,
        handlers::list_sessions,
        handlers::get_session,
        handlers::delete_session,
        handlers::worker_health,
        handlers::worker_status,
        handlers::worker_proxy,
    ),
    components(schemas(
        SessionRecord,
        SessionList,
        SessionState,
        WorkerStatus,
        ErrorBody,
        ErrorCode,
    )),
    tags(
        (name = "sessions", description = "Session lifecycle"),
        (name = "workers", description = "Passthrough to a session's worker"),
        (name = "health", description = "Health checks")
    )
)]
pub struct ApiDoc;
