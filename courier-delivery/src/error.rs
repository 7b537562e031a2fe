//! Typed errors for delivery.
//!
//! Provider failures are split into [`PermanentError`] (retrying the same
//! provider will not help) and [`TemporaryError`] (retry later or fail over).
//! [`SystemError`] covers faults inside the relay itself; the dispatcher treats
//! them like temporary failures so a message is never lost to a local bug.

use courier_common::MessageId;
use courier_smtp::ClientError;
use courier_spool::SpoolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("System error: {0}")]
    System(#[from] SystemError),

    /// Some recipients were accepted before `source` ended the send
    #[error("{source} (after {} recipients were accepted)", .delivered.len())]
    Partial {
        delivered: Vec<String>,
        source: Box<DeliveryError>,
    },
}

#[derive(Debug, Error)]
pub enum PermanentError {
    /// Every recipient in a batch was refused
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Message rejected: {0}")]
    MessageRejected(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Message too large: {0}")]
    MessageTooLarge(String),

    #[error("TLS required: {0}")]
    TlsRequired(String),
}

#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Server busy: {0}")]
    ServerBusy(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Temporary SMTP error: {0}")]
    SmtpTemporary(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Spool error: {0}")]
    Spool(#[from] SpoolError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Delivery processor not initialised: {0}")]
    NotInitialized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Wrap `error` with the recipients accepted before it, unless there are
    /// none.
    #[must_use]
    pub fn partial(error: Self, delivered: Vec<String>) -> Self {
        if delivered.is_empty() {
            return error;
        }

        let (mut earlier, source) = match error {
            Self::Partial { delivered, source } => (delivered, source),
            other => (Vec::new(), Box::new(other)),
        };
        earlier.extend(delivered);

        Self::Partial {
            delivered: earlier,
            source,
        }
    }

    /// The failure underneath any partial delivery
    #[must_use]
    pub fn cause(&self) -> &Self {
        match self {
            Self::Partial { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Recipients accepted before the failure
    #[must_use]
    pub fn delivered(&self) -> &[String] {
        match self {
            Self::Partial { delivered, .. } => delivered,
            _ => &[],
        }
    }

    #[must_use]
    pub fn is_temporary(&self) -> bool {
        matches!(self.cause(), Self::Temporary(_))
    }

    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self.cause(), Self::Permanent(_))
    }

    #[must_use]
    pub fn is_system(&self) -> bool {
        matches!(self.cause(), Self::System(_))
    }
}

impl From<SpoolError> for DeliveryError {
    fn from(error: SpoolError) -> Self {
        Self::System(SystemError::Spool(error))
    }
}

/// 4xx replies and network failures are temporary, 5xx replies permanent.
impl From<ClientError> for DeliveryError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::SmtpError { code, message } if (400..500).contains(&code) => {
                Self::Temporary(TemporaryError::SmtpTemporary(format!("{code} {message}")))
            }

            ClientError::SmtpError { code: 535, message } => Self::Permanent(
                PermanentError::AuthenticationFailed(format!("535 {message}")),
            ),

            ClientError::SmtpError { code: 552, message } => {
                Self::Permanent(PermanentError::MessageTooLarge(format!("552 {message}")))
            }

            ClientError::SmtpError { code, message } if (500..600).contains(&code) => {
                Self::Permanent(PermanentError::MessageRejected(format!("{code} {message}")))
            }

            ClientError::SmtpError { code, message } => Self::System(SystemError::Internal(
                format!("Unexpected SMTP response: {code} {message}"),
            )),

            ClientError::Io(e) => {
                Self::Temporary(TemporaryError::ConnectionFailed(format!("I/O error: {e}")))
            }

            ClientError::ConnectionClosed => Self::Temporary(TemporaryError::ConnectionFailed(
                "Connection closed unexpectedly".to_string(),
            )),

            ClientError::TlsError(msg) => Self::Temporary(TemporaryError::TlsHandshakeFailed(msg)),

            ClientError::ParseError(msg) => Self::System(SystemError::Internal(format!(
                "SMTP protocol parse error: {msg}"
            ))),

            ClientError::Utf8Error(e) => {
                Self::System(SystemError::Internal(format!("UTF-8 decoding error: {e}")))
            }
        }
    }
}

/// Failures of queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Backpressure: the caller should retry later
    #[error("Queue is full ({capacity} messages)")]
    Full { capacity: usize },

    #[error("Queue is closed")]
    Closed,

    #[error("Message not found: {0}")]
    NotFound(MessageId),

    #[error("Queue storage error: {0}")]
    Storage(#[from] SpoolError),
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_categories() {
        let error = DeliveryError::Temporary(TemporaryError::ConnectionFailed(
            "Connection refused".to_string(),
        ));
        assert!(error.is_temporary());
        assert!(!error.is_permanent());

        let error = DeliveryError::Permanent(PermanentError::InvalidRecipient(
            "user@example.com".to_string(),
        ));
        assert!(error.is_permanent());
        assert!(!error.is_system());

        let error = DeliveryError::System(SystemError::Internal("bug".to_string()));
        assert!(error.is_system());
        assert!(!error.is_temporary());
    }

    #[test]
    fn test_client_error_4xx_is_temporary() {
        let error: DeliveryError = ClientError::SmtpError {
            code: 421,
            message: "Service not available".to_string(),
        }
        .into();

        assert!(error.is_temporary());
        assert_eq!(
            error.to_string(),
            "Temporary failure: Temporary SMTP error: 421 Service not available"
        );
    }

    #[test]
    fn test_client_error_5xx_is_permanent() {
        let error: DeliveryError = ClientError::SmtpError {
            code: 550,
            message: "User not found".to_string(),
        }
        .into();
        assert_eq!(
            error.to_string(),
            "Permanent failure: Message rejected: 550 User not found"
        );

        let error: DeliveryError = ClientError::SmtpError {
            code: 535,
            message: "Bad credentials".to_string(),
        }
        .into();
        assert!(matches!(
            error,
            DeliveryError::Permanent(PermanentError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_client_error_network_is_temporary() {
        let error: DeliveryError = ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ))
        .into();
        assert!(error.is_temporary());

        let error: DeliveryError = ClientError::ConnectionClosed.into();
        assert_eq!(
            error.to_string(),
            "Temporary failure: Connection failed: Connection closed unexpectedly"
        );

        let error: DeliveryError = ClientError::TlsError("Handshake failed".to_string()).into();
        assert!(error.is_temporary());
    }

    #[test]
    fn test_client_error_protocol_is_system() {
        let error: DeliveryError = ClientError::ParseError("garbage".to_string()).into();
        assert!(error.is_system());

        let error: DeliveryError = ClientError::SmtpError {
            code: 999,
            message: "Unknown code".to_string(),
        }
        .into();
        assert_eq!(
            error.to_string(),
            "System error: Internal error: Unexpected SMTP response: 999 Unknown code"
        );
    }

    #[test]
    fn test_partial_keeps_classification() {
        let refused: DeliveryError = TemporaryError::ServerBusy("421 busy".to_string()).into();
        assert!(DeliveryError::partial(refused, Vec::new()).delivered().is_empty());

        let busy: DeliveryError = TemporaryError::ServerBusy("421 busy".to_string()).into();
        let error = DeliveryError::partial(busy, vec!["a@example.org".to_string()]);
        assert!(error.is_temporary());
        assert!(!error.is_permanent());
        assert_eq!(error.delivered(), ["a@example.org"]);

        // nesting flattens the accepted recipients
        let error = DeliveryError::partial(error, vec!["b@example.org".to_string()]);
        assert_eq!(error.delivered(), ["a@example.org", "b@example.org"]);
        assert!(matches!(
            error.cause(),
            DeliveryError::Temporary(TemporaryError::ServerBusy(_))
        ));
        assert_eq!(
            error.to_string(),
            "Temporary failure: Server busy: 421 busy (after 2 recipients were accepted)"
        );
    }

    #[test]
    fn test_queue_error_display() {
        assert_eq!(
            QueueError::Full { capacity: 10 }.to_string(),
            "Queue is full (10 messages)"
        );
    }
}
