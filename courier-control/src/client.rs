//! Client for the admin API of a running relay

use std::time::Duration;

use courier_delivery::CircuitCommand;
use reqwest::{Method, RequestBuilder};
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::{ControlError, Result};

/// Client for communicating with a relay's admin routes
///
/// Responses are returned as JSON values; the CLI prints them as they come.
#[derive(Debug, Clone)]
pub struct ControlClient {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    http: reqwest::Client,
}

impl ControlClient {
    /// Create a client for the relay listening at `base_url`, e.g. `http://127.0.0.1:8080`
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            timeout: Duration::from_secs(10),
            http: reqwest::Client::new(),
        }
    }

    /// Authenticate every request with this plaintext bearer token
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn snapshot(&self) -> Result<Value> {
        Self::send(self.request(Method::GET, "/admin/snapshot")).await
    }

    pub async fn dead_letters(&self) -> Result<Value> {
        Self::send(self.request(Method::GET, "/admin/dead-letters"))
            .await
    }

    pub async fn set_circuit(&self, provider: &str, command: CircuitCommand) -> Result<Value> {
        let path = format!("/admin/providers/{provider}/circuit");
        Self::send(
            self.request(Method::POST, &path)
                .json(&json!({ "state": command })),
        )
        .await
    }

    pub async fn requeue(&self, id: &str) -> Result<Value> {
        let path = format!("/admin/dead-letters/{id}/requeue");
        Self::send(self.request(Method::POST, &path)).await
    }

    pub async fn requeue_all(&self) -> Result<Value> {
        Self::send(self.request(Method::POST, "/admin/dead-letters/requeue-all"))
            .await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        debug!("Admin request {method} {url}");

        let builder = self.http.request(method, url).timeout(self.timeout);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send a request and decode the JSON response
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Connection fails or times out
    /// - The relay answers with a non-success status
    /// - The body is not JSON
    async fn send(request: RequestBuilder) -> Result<Value> {
        let response = request.send().await?;
        let status = response.status();
        trace!(status = status.as_u16(), "Admin response");

        if status.is_success() {
            return Ok(response.json().await?);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| body["error"].as_str().map(ToString::to_string))
            .unwrap_or(text);

        Err(ControlError::ServerError {
            status: status.as_u16(),
            message,
        })
    }
}
