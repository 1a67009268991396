//! HTTP client for the agent server.
//!
//! Every non-2xx answer becomes [`BackendError::Status`] with a sanitized,
//! length-capped body so diagnostics never carry raw server dumps.

use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_core::text::sanitize_diagnostic;
use tracing::{debug, instrument};

use crate::errors::{BackendError, BackendResult};
use crate::permissions::PermissionDecision;

use super::sse::{parse_sse_data, parse_sse_frames};
use super::types::{
    CreateSessionBody, MessageResponse, PermissionReply, PromptBody, ServerEvent, SessionInfo,
};

/// Thin typed wrapper over the server's REST surface.
#[derive(Clone, Debug)]
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl ServerClient {
    /// Client for the server at `base_url`.
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    /// Server base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Probe `path`. Returns the reported version, if the body has one.
    pub async fn health(&self, path: &str) -> BackendResult<Option<String>> {
        let response = self
            .http
            .get(self.url(path))
            .timeout(Duration::from_secs(2))
            .send()
            .await?;
        let response = check(response).await?;
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if body.get("healthy").and_then(Value::as_bool) == Some(false) {
            return Err(BackendError::unavailable("server reports itself unhealthy"));
        }
        Ok(body.get("version").and_then(Value::as_str).map(str::to_string))
    }

    /// Create a session.
    #[instrument(skip(self))]
    pub async fn create_session(&self, title: Option<&str>) -> BackendResult<SessionInfo> {
        let body = CreateSessionBody {
            title: title.map(str::to_string),
        };
        let response = self.http.post(self.url("/session")).json(&body).send().await?;
        let session: SessionInfo = json(response).await?;
        debug!(session_id = %session.id, "created server session");
        Ok(session)
    }

    /// Fetch one session; a missing session is a 404 [`BackendError::Status`].
    pub async fn get_session(&self, id: &str) -> BackendResult<SessionInfo> {
        let response = self
            .http
            .get(self.url(&format!("/session/{id}")))
            .send()
            .await?;
        json(response).await
    }

    /// Every session the server knows.
    pub async fn list_sessions(&self) -> BackendResult<Vec<SessionInfo>> {
        let response = self.http.get(self.url("/session")).send().await?;
        json(response).await
    }

    /// Delete a session.
    #[instrument(skip(self))]
    pub async fn delete_session(&self, id: &str) -> BackendResult<()> {
        let response = self
            .http
            .delete(self.url(&format!("/session/{id}")))
            .send()
            .await?;
        let _ = check(response).await?;
        Ok(())
    }

    /// Send a prompt and wait for the finished assistant message.
    pub async fn send_message(&self, session_id: &str, body: &PromptBody) -> BackendResult<MessageResponse> {
        let response = self
            .http
            .post(self.url(&format!("/session/{session_id}/message")))
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await?;
        json(response).await
    }

    /// Send a prompt without waiting; progress arrives on the event feed.
    pub async fn send_message_async(&self, session_id: &str, body: &PromptBody) -> BackendResult<()> {
        let response = self
            .http
            .post(self.url(&format!("/session/{session_id}/prompt_async")))
            .json(body)
            .send()
            .await?;
        let _ = check(response).await?;
        Ok(())
    }

    /// Ask the server to stop the session's current turn.
    #[instrument(skip(self))]
    pub async fn abort(&self, session_id: &str) -> BackendResult<()> {
        let response = self
            .http
            .post(self.url(&format!("/session/{session_id}/abort")))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        let _ = check(response).await?;
        Ok(())
    }

    /// Answer a pending permission request.
    #[instrument(skip(self))]
    pub async fn respond_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        decision: PermissionDecision,
    ) -> BackendResult<()> {
        let response = self
            .http
            .post(self.url(&format!(
                "/session/{session_id}/permissions/{permission_id}"
            )))
            .json(&PermissionReply { response: decision })
            .send()
            .await?;
        let _ = check(response).await?;
        Ok(())
    }

    /// Open the `/event` feed. Frames that are not valid JSON are skipped.
    pub async fn subscribe(&self) -> BackendResult<impl Stream<Item = ServerEvent> + Send + 'static> {
        let response = self
            .http
            .get(self.url("/event"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = check(response).await?;
        let frames = parse_sse_frames(response.bytes_stream());
        Ok(frames.filter_map(|frame| async move { parse_sse_data::<ServerEvent>(&frame) }))
    }
}

async fn check(response: Response) -> BackendResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        body: sanitize_diagnostic(&body),
    })
}

async fn json<T: DeserializeOwned>(response: Response) -> BackendResult<T> {
    let response = check(response).await?;
    if response.status() == StatusCode::NO_CONTENT {
        return Err(BackendError::protocol("expected a JSON body, got 204"));
    }
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;
    use tether_core::Mode;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer) -> ServerClient {
        ServerClient::new(reqwest::Client::new(), server.uri(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn health_reads_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"healthy": true, "version": "0.9.1"})),
            )
            .mount(&server)
            .await;

        let version = client(&server).health("/health").await.unwrap();
        assert_eq!(version.as_deref(), Some("0.9.1"));
    }

    #[tokio::test]
    async fn health_unhealthy_body_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"healthy": false})))
            .mount(&server)
            .await;

        let err = client(&server).health("/health").await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn create_and_get_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ses_1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/ses_1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "ses_1", "title": "t"})),
            )
            .mount(&server)
            .await;

        let client = client(&server);
        let created = client.create_session(None).await.unwrap();
        assert_eq!(created.id, "ses_1");
        let fetched = client.get_session("ses_1").await.unwrap();
        assert_eq!(fetched.title.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_string("session not found"))
            .mount(&server)
            .await;

        let err = client(&server).get_session("gone").await.unwrap_err();
        assert!(err.is_not_found());
        assert_matches!(err, BackendError::Status { ref body, .. } if body == "session not found");
    }

    #[tokio::test]
    async fn error_body_is_sanitized() {
        let server = MockServer::start().await;
        let noisy = format!("boom\n\t{}", "x".repeat(1000));
        Mock::given(method("DELETE"))
            .and(path("/session/s"))
            .respond_with(ResponseTemplate::new(500).set_body_string(noisy))
            .mount(&server)
            .await;

        let err = client(&server).delete_session("s").await.unwrap_err();
        assert_matches!(err, BackendError::Status { status: 500, ref body } => {
            assert!(body.starts_with("boom x"));
            assert!(body.len() <= tether_core::text::MAX_DIAGNOSTIC_LEN + 3);
        });
    }

    #[tokio::test]
    async fn send_message_posts_prompt_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/s/message"))
            .and(body_json(json!({"parts": [{"type": "text", "text": "hi"}]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "info": {"id": "m", "role": "assistant", "sessionID": "s"},
                "parts": [{"id": "p", "type": "text", "text": "hello"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let body = PromptBody::new("hi", &Mode::default(), "anthropic");
        let resp = client(&server).send_message("s", &body).await.unwrap();
        assert_eq!(resp.parts[0].text.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn async_prompt_accepts_no_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/s/prompt_async"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let body = PromptBody::new("hi", &Mode::default(), "anthropic");
        client(&server).send_message_async("s", &body).await.unwrap();
    }

    #[tokio::test]
    async fn permission_reply_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/s/permissions/perm_1"))
            .and(body_json(json!({"response": "always"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .respond_permission("s", "perm_1", PermissionDecision::Always)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn subscribe_parses_frames() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"type\":\"server.connected\",\"properties\":{}}\n\n",
            "data: not-json\n\n",
            "data: {\"type\":\"session.idle\",\"properties\":{\"sessionID\":\"s\"}}\n\n",
        );
        Mock::given(method("GET"))
            .and(path("/event"))
            .and(header("accept", "text/event-stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let events: Vec<ServerEvent> = client(&server).subscribe().await.unwrap().collect().await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["server.connected", "session.idle"]);
    }
}
