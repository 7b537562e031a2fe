//! Validation errors for the message model.

use thiserror::Error;

/// Syntax errors for a single mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Address is missing '@': {0:?}")]
    MissingAt(String),

    #[error("Invalid local part: {0:?}")]
    InvalidLocalPart(String),

    #[error("Invalid domain: {0:?}")]
    InvalidDomain(String),
}

/// A submitted message failed structural validation.
///
/// This is a caller error and is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedMessage {
    /// No to, cc or bcc recipients were supplied.
    #[error("Message has no recipients")]
    NoRecipients,

    /// Sender or recipient failed address validation.
    #[error("Invalid {field} address: {source}")]
    InvalidAddress {
        field: &'static str,
        #[source]
        source: AddressError,
    },

    /// Neither a body part nor an attachment was supplied.
    #[error("Message has no body or attachments")]
    EmptyBody,

    /// A custom header has an illegal name or value.
    #[error("Invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: &'static str },

    /// An attachment has no file name or an illegal content type.
    #[error("Invalid attachment {name:?}: {reason}")]
    InvalidAttachment { name: String, reason: &'static str },

    /// The subject contains line breaks.
    #[error("Subject must be a single line")]
    InvalidSubject,

    /// Rendered size exceeds the configured limit.
    #[error("Message is {size} bytes, exceeding the limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    /// Pre-rendered content has no usable header section.
    #[error("Invalid message content: {0}")]
    InvalidContent(&'static str),
}
