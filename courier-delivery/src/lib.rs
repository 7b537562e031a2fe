//! Provider failover and the delivery queue for courier
//!
//! This crate provides functionality to:
//! - Queue accepted messages durably until a terminal outcome
//! - Deliver through SMTP relays and HTTP provider APIs
//! - Fail over between providers by priority and observed latency
//! - Suspend failing providers with per-provider circuit breakers
//! - Retry with exponential backoff and dead-letter exhausted messages

pub mod circuit_breaker;
pub mod dispatcher;
mod error;
pub mod policy;
pub mod processor;
pub mod provider;
pub mod queue;
pub mod rate_limiter;
mod service;
pub mod stats;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
// Re-export common types
pub use courier_common::{DeliveryAttempt, DeliveryStatus};
pub use dispatcher::{CycleOutcome, Dispatcher, ProviderSnapshot};
// Re-export error types
pub use error::{DeliveryError, PermanentError, QueueError, SystemError, TemporaryError};
pub use policy::RetryPolicy;
// Re-export core types
pub use processor::{DeliveryProcessor, worker::EntryOutcome};
pub use provider::{OutboundMessage, Provider, ProviderConfig, ProviderKind};
pub use queue::{DeadLetter, DeliveryQueue, QueueEntry, RestoreSummary};
pub use rate_limiter::{RateLimitConfig, RateLimited, SenderRateLimiter};
pub use service::{
    AdminError, CircuitCommand, DeadLetterSummary, DeliveryAdmin, DeliveryService,
    DeliverySnapshot, RequeueSummary, SubmitError,
};
pub use stats::{RollingStats, WindowStats};
