//! Error types for admin operations

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use courier_delivery::{AdminError, QueueError};
use serde_json::json;
use thiserror::Error;

/// Errors that can occur during admin operations, on either side of the wire
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Authentication required but no token provided")]
    MissingToken,

    #[error("Invalid authentication token")]
    InvalidToken,

    #[error("Invalid message id: {0}")]
    InvalidId(String),

    #[error(transparent)]
    Admin(#[from] AdminError),

    /// Transport failure talking to a relay
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Relay answered with a non-success status
    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },
}

impl ControlError {
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::InvalidId(_) => StatusCode::BAD_REQUEST,
            Self::Admin(AdminError::UnknownProvider(_) | AdminError::Queue(QueueError::NotFound(_))) => {
                StatusCode::NOT_FOUND
            }
            Self::Admin(AdminError::Queue(QueueError::Full { .. } | QueueError::Closed)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Admin(AdminError::Queue(QueueError::Storage(_))) | Self::ServerError { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Http(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "error": self.to_string() }));

        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

/// Result type for admin operations
pub type Result<T> = std::result::Result<T, ControlError>;
