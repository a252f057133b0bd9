//! HTTP client for a running orchestrator.
//!
//! Used by the CLI's client subcommands (`status`, `sessions ...`).

use std::time::Duration;

use protocol::{ErrorBody, SessionData, SessionList, SessionRecord};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Client-side request timeout. Covers a full worker startup on create.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors talking to the orchestrator.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The orchestrator could not be reached or the reply could not be read.
    #[error("cannot reach orchestrator: {0}")]
    Network(#[from] reqwest::Error),

    /// The orchestrator answered with an error body.
    #[error("orchestrator returned {status}: {}", .body.message)]
    Api { status: u16, body: ErrorBody },

    /// The orchestrator answered with something that is not an error body.
    #[error("unexpected response ({status}): {text}")]
    Unexpected { status: u16, text: String },
}

impl ClientError {
    /// Whether the error is a well-formed 404 from the orchestrator.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Api { status: 404, .. })
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// HTTP client for the orchestrator API.
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    base_url: String,
    client: reqwest::Client,
}

impl OrchestratorClient {
    /// Create a client for `base_url`, e.g. `http://127.0.0.1:3000`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /health`. Returns the body text on success.
    pub async fn health(&self) -> Result<String> {
        let response = self.client.get(self.url("/health")).send().await?;
        let response = check(response).await?;
        Ok(response.text().await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let list: SessionList = self.get_json("/sessions").await?;
        Ok(list.sessions)
    }

    pub async fn create_session(&self, data: &SessionData) -> Result<SessionRecord> {
        let response = self
            .client
            .post(self.url("/sessions"))
            .json(data)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn get_session(&self, id: &str) -> Result<SessionRecord> {
        self.get_json(&format!("/sessions/{id}")).await
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/sessions/{id}")))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.client.get(self.url(path)).send().await?;
        Ok(check(response).await?.json().await?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Pass 2xx responses through; turn everything else into a [`ClientError`].
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(status_error(status, &response.text().await?))
}

fn status_error(status: StatusCode, text: &str) -> ClientError {
    match serde_json::from_str::<ErrorBody>(text) {
        Ok(body) => ClientError::Api {
            status: status.as_u16(),
            body,
        },
        Err(_) => ClientError::Unexpected {
            status: status.as_u16(),
            text: text.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::ErrorCode;

    #[test]
    fn test_base_url_trailing_slash() {
        let client = OrchestratorClient::new("http://127.0.0.1:3000/").unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:3000");
        assert_eq!(client.url("/sessions"), "http://127.0.0.1:3000/sessions");
    }

    #[test]
    fn test_status_error_with_error_body() {
        let err = status_error(
            StatusCode::NOT_FOUND,
            r#"{"code":"SESSION_NOT_FOUND","message":"session not found: x"}"#,
        );
        assert!(err.is_not_found());
        match &err {
            ClientError::Api { body, .. } => assert_eq!(body.code, ErrorCode::SessionNotFound),
            other => panic!("expected Api error, got {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "orchestrator returned 404: session not found: x"
        );
    }

    #[test]
    fn test_status_error_without_error_body() {
        let err = status_error(StatusCode::BAD_GATEWAY, "upstream gone");
        assert!(!err.is_not_found());
        assert!(matches!(err, ClientError::Unexpected { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_orchestrator() {
        let port = std::net::TcpListener::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = OrchestratorClient::new(format!("http://127.0.0.1:{port}")).unwrap();
        let err = client.health().await.unwrap_err();
        assert!(matches!(err, ClientError::Network(_)));
    }
}
