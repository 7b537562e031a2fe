use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a queued message currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for its first dispatch
    Pending,
    /// Handed to a worker
    InFlight,
    /// Every provider failed transiently; waiting for the next cycle
    Retry { attempts: u32, last_error: String },
    /// Accepted by a provider
    Delivered { provider: String },
    /// Retry budget exhausted or permanently rejected
    DeadLettered { reason: String },
}

impl DeliveryStatus {
    /// Whether this message will see no further delivery attempts
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered { .. } | Self::DeadLettered { .. })
    }
}

impl Display for DeliveryStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::InFlight => f.write_str("in_flight"),
            Self::Retry { attempts, .. } => write!(f, "retry ({attempts} cycles)"),
            Self::Delivered { provider } => write!(f, "delivered via {provider}"),
            Self::DeadLettered { reason } => write!(f, "dead-lettered: {reason}"),
        }
    }
}

/// How a single provider attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Transient,
    Permanent,
}

impl AttemptOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

impl Display for AttemptOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one send through one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub provider: String,
    pub outcome: AttemptOutcome,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
    pub latency_ms: u64,
}

impl DeliveryAttempt {
    #[must_use]
    pub fn success(provider: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            provider: provider.into(),
            outcome: AttemptOutcome::Success,
            timestamp: Utc::now(),
            error: None,
            latency_ms,
        }
    }

    #[must_use]
    pub fn failure(
        provider: impl Into<String>,
        outcome: AttemptOutcome,
        error: impl Into<String>,
        latency_ms: u64,
    ) -> Self {
        Self {
            provider: provider.into(),
            outcome,
            timestamp: Utc::now(),
            error: Some(error.into()),
            latency_ms,
        }
    }
}
