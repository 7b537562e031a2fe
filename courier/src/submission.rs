//! `POST /v1/messages`: the HTTP submission API
//!
//! | Outcome                        | Status |
//! |--------------------------------|--------|
//! | Queued                         | 202 `{ "id", "status": "queued" }` |
//! | Invalid JSON or message        | 400    |
//! | Sender over its rate limit     | 429 with `Retry-After` |
//! | Queue full or shutting down    | 503    |

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use courier_common::{MessageId, NewMessage, incoming};
use courier_delivery::{DeliveryService, SubmitError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Largest accepted request body. Attachments travel base64 encoded, so
    /// this sits above the rendered message size limit.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

const fn default_enabled() -> bool {
    true
}

const fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Body of a 202 response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Accepted {
    pub id: MessageId,
    pub status: &'static str,
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Invalid request body: {message}")]
    Payload { status: StatusCode, message: String },

    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Whole seconds, rounded up, never zero
fn retry_after_secs(wait: Duration) -> u64 {
    (wait.as_secs() + u64::from(wait.subsec_nanos() > 0)).max(1)
}

impl IntoResponse for SubmissionError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.to_string() }));

        match self {
            Self::Payload { status, .. } => (status, body).into_response(),
            Self::Submit(SubmitError::Malformed(_)) => (StatusCode::BAD_REQUEST, body).into_response(),
            Self::Submit(SubmitError::RateLimited(limited)) => (
                StatusCode::TOO_MANY_REQUESTS,
                [(
                    header::RETRY_AFTER,
                    retry_after_secs(limited.retry_after).to_string(),
                )],
                body,
            )
                .into_response(),
            Self::Submit(SubmitError::Queue(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
            }
        }
    }
}

pub fn router(service: DeliveryService, config: &SubmissionConfig) -> Router {
    Router::new()
        .route("/v1/messages", post(submit))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .with_state(service)
}

async fn submit(
    State(service): State<DeliveryService>,
    payload: Result<Json<NewMessage>, JsonRejection>,
) -> Result<(StatusCode, Json<Accepted>), SubmissionError> {
    let Json(draft) = payload.map_err(|rejection| {
        service.metrics().queue.record_submission("rejected");

        let status = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            StatusCode::PAYLOAD_TOO_LARGE
        } else {
            StatusCode::BAD_REQUEST
        };
        SubmissionError::Payload {
            status,
            message: rejection.body_text(),
        }
    })?;

    match service.submit(draft).await {
        Ok(entry) => Ok((
            StatusCode::ACCEPTED,
            Json(Accepted {
                id: entry.id(),
                status: "queued",
            }),
        )),
        Err(e) => {
            incoming!(level = DEBUG, "Submission refused: {e}");
            Err(e.into())
        }
    }
}
