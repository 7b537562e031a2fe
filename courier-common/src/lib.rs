//! Shared building blocks for the courier mail relay.
//!
//! The [`message`] module holds the transport-independent representation of an
//! outbound email, [`status`] the delivery bookkeeping types that every other
//! crate records against, and [`audit`] / [`logging`] the ambient observability.

pub mod address;
pub mod audit;
pub mod error;
pub mod logging;
pub mod message;
pub mod status;

pub use address::Address;
pub use error::MalformedMessage;
pub use message::{
    Attachment, Header, Message, MessageId, MessageLimits, NewMessage, summarize_recipients,
};
pub use status::{AttemptOutcome, DeliveryAttempt, DeliveryStatus};
pub use tracing;

/// Lifecycle signal broadcast to every long-running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
