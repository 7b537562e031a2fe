//! Delivery through a provider's HTTP API.

use std::{fmt, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{OutboundMessage, Provider, mask_password};
use crate::error::{DeliveryError, PermanentError, SystemError, TemporaryError};

/// Longest response body quoted in an error
const MAX_ERROR_BODY: usize = 256;

const fn default_timeout_secs() -> u64 {
    30
}

#[derive(Clone, Deserialize)]
pub struct HttpProviderConfig {
    /// URL the message is POSTed to
    pub endpoint: String,

    /// Sent as a bearer token
    #[serde(default)]
    pub api_key: Option<String>,

    /// Default: 30 seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl fmt::Debug for HttpProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProviderConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_deref().map(mask_password))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Serialize)]
struct Payload<'a> {
    from: String,
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    subject: &'a str,
    /// Base64 of the signed message
    raw: String,
}

impl<'a> From<&'a OutboundMessage> for Payload<'a> {
    fn from(outbound: &'a OutboundMessage) -> Self {
        let message = &outbound.message;
        let addresses = |list: &[courier_common::Address]| -> Vec<String> {
            list.iter()
                .filter(|address| outbound.is_addressed_to(address))
                .map(ToString::to_string)
                .collect()
        };

        Self {
            from: message.from().to_string(),
            to: addresses(message.to()),
            cc: addresses(message.cc()),
            bcc: addresses(message.bcc()),
            subject: message.subject(),
            raw: STANDARD.encode(outbound.raw.as_bytes()),
        }
    }
}

#[derive(Debug)]
pub struct HttpProvider {
    name: String,
    config: HttpProviderConfig,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(name: String, config: HttpProviderConfig) -> Result<Self, DeliveryError> {
        let url = reqwest::Url::parse(&config.endpoint).map_err(|e| {
            SystemError::Configuration(format!("provider {name}: invalid endpoint: {e}"))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(SystemError::Configuration(format!(
                "provider {name}: endpoint must be http or https"
            ))
            .into());
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SystemError::Configuration(format!("provider {name}: {e}")))?;

        Ok(Self {
            name,
            config,
            client,
        })
    }
}

/// Map a non-2xx status to the failure taxonomy.
fn classify(status: StatusCode, body: &str) -> DeliveryError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        let body: String = body.chars().take(MAX_ERROR_BODY).collect();
        format!("{status}: {body}")
    };

    match status {
        StatusCode::TOO_MANY_REQUESTS => TemporaryError::RateLimited(detail).into(),
        StatusCode::REQUEST_TIMEOUT => TemporaryError::Timeout(detail).into(),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            PermanentError::AuthenticationFailed(detail).into()
        }
        StatusCode::PAYLOAD_TOO_LARGE => PermanentError::MessageTooLarge(detail).into(),
        s if s.is_server_error() => TemporaryError::Unavailable(detail).into(),
        s if s.is_client_error() => PermanentError::MessageRejected(detail).into(),
        _ => TemporaryError::Unavailable(format!("unexpected response {detail}")).into(),
    }
}

fn request_error(error: &reqwest::Error) -> DeliveryError {
    if error.is_timeout() {
        TemporaryError::Timeout(error.to_string()).into()
    } else if error.is_builder() {
        SystemError::Configuration(error.to_string()).into()
    } else {
        TemporaryError::ConnectionFailed(error.to_string()).into()
    }
}

#[async_trait::async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider = %self.name, message_id = %message.message.id()))]
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .json(&Payload::from(message));

        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| request_error(&e))?;
        let status = response.status();

        if status.is_success() {
            tracing::debug!(%status, "Provider accepted message");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }
}
