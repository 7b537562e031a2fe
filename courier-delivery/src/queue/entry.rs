use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_common::{Address, DeliveryAttempt, DeliveryStatus, Message, MessageId};
use serde::{Deserialize, Serialize};

/// A message waiting in the delivery queue, with its delivery history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub message: Arc<Message>,
    pub status: DeliveryStatus,
    pub enqueued_at: DateTime<Utc>,
    /// The entry is not handed to a worker before this instant
    pub next_attempt_at: DateTime<Utc>,
    /// Completed delivery cycles
    pub cycles: u32,
    /// Every provider attempt, oldest first
    pub attempts: Vec<DeliveryAttempt>,
    /// Recipients some provider has already accepted
    #[serde(default)]
    pub delivered_to: Vec<String>,
    /// Providers that refused the message permanently since it was last
    /// queued. They are not tried again until an operator requeues it.
    #[serde(default)]
    pub refused_by: Vec<String>,
}

impl QueueEntry {
    #[must_use]
    pub fn new(message: Arc<Message>) -> Self {
        let now = Utc::now();
        Self {
            message,
            status: DeliveryStatus::Pending,
            enqueued_at: now,
            next_attempt_at: now,
            cycles: 0,
            attempts: Vec::new(),
            delivered_to: Vec::new(),
            refused_by: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> MessageId {
        self.message.id()
    }

    /// Whether a worker may pick this entry up at `now`
    #[must_use]
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !matches!(self.status, DeliveryStatus::InFlight) && self.next_attempt_at <= now
    }

    /// Envelope recipients no provider has accepted yet
    #[must_use]
    pub fn outstanding_recipients(&self) -> Vec<Address> {
        self.message
            .recipients()
            .filter(|recipient| {
                !self
                    .delivered_to
                    .iter()
                    .any(|done| done.eq_ignore_ascii_case(&recipient.to_string()))
            })
            .cloned()
            .collect()
    }

    /// The error of the most recent failed attempt
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find_map(|attempt| attempt.error.as_deref())
    }
}

/// A message that will not be retried without operator action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub entry: QueueEntry,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.entry.id()
    }
}
