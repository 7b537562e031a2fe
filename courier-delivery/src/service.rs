//! Operations exposed to the HTTP and SMTP surfaces
//!
//! [`DeliveryService`] is the shared runtime handle of a running relay: the
//! submission API and the SMTP listener push messages through it, the workers
//! pull from its queue and the admin API inspects and steers it. The admin
//! half is also exposed as the [`DeliveryAdmin`] trait so that the control
//! server can be exercised without a live queue.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use chrono::{DateTime, Utc};
use courier_common::{
    DeliveryAttempt, MalformedMessage, Message, MessageId, MessageLimits, NewMessage, audit,
    incoming, summarize_recipients,
};
use courier_dkim::DkimSigner;
use courier_metrics::Metrics;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    circuit_breaker::CircuitState,
    dispatcher::{Dispatcher, ProviderSnapshot},
    error::QueueError,
    policy::RetryPolicy,
    queue::{DeadLetter, DeliveryQueue, QueueEntry},
    rate_limiter::{RateLimited, SenderRateLimiter},
    stats::WindowStats,
};

/// Why a submission was refused
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Malformed(#[from] MalformedMessage),

    #[error("Sender rate limit exceeded, retry after {}s", .0.retry_after.as_secs())]
    RateLimited(RateLimited),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl SubmitError {
    /// Label used for the submissions metric
    #[must_use]
    pub const fn metric_label(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "rejected",
            Self::RateLimited(_) => "rate_limited",
            Self::Queue(_) => "unavailable",
        }
    }
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Requested circuit position for a forced transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitCommand {
    Open,
    Closed,
}

impl CircuitCommand {
    const fn action(self) -> &'static str {
        match self {
            Self::Open => "force_open_circuit",
            Self::Closed => "force_close_circuit",
        }
    }
}

/// Point-in-time view of the relay
#[derive(Debug, Clone, Serialize)]
pub struct DeliverySnapshot {
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub dead_letter_depth: usize,
    pub workers_running: bool,
    pub providers: Vec<ProviderSnapshot>,
    pub window: WindowStats,
    pub taken_at: DateTime<Utc>,
}

/// A dead letter without the message body
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterSummary {
    pub id: MessageId,
    pub from: String,
    pub recipients: String,
    pub subject: String,
    pub reason: String,
    pub cycles: u32,
    pub enqueued_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
    pub attempts: Vec<DeliveryAttempt>,
}

impl From<&DeadLetter> for DeadLetterSummary {
    fn from(dead: &DeadLetter) -> Self {
        let message = &dead.entry.message;
        let recipients: Vec<String> = message.recipients().map(ToString::to_string).collect();

        Self {
            id: dead.id(),
            from: message.from().to_string(),
            recipients: summarize_recipients(&recipients),
            subject: message.subject().to_string(),
            reason: dead.reason.clone(),
            cycles: dead.entry.cycles,
            enqueued_at: dead.entry.enqueued_at,
            dead_lettered_at: dead.dead_lettered_at,
            attempts: dead.entry.attempts.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequeueSummary {
    pub requeued: Vec<MessageId>,
    /// Dead letters left in place, with the reason
    pub failed: Vec<(MessageId, String)>,
}

/// Read and steer operations for the admin API.
///
/// Every mutating call takes the authenticated `actor`, which is recorded in
/// the audit trail together with the outcome.
#[async_trait::async_trait]
pub trait DeliveryAdmin: Send + Sync {
    fn snapshot(&self) -> DeliverySnapshot;

    fn dead_letters(&self) -> Vec<DeadLetterSummary>;

    /// Force a provider circuit open (until closed again) or closed.
    fn set_circuit(
        &self,
        actor: &str,
        provider: &str,
        command: CircuitCommand,
    ) -> Result<CircuitState, AdminError>;

    async fn requeue(&self, actor: &str, id: &MessageId) -> Result<QueueEntry, AdminError>;

    async fn requeue_all(&self, actor: &str) -> RequeueSummary;
}

#[derive(Debug)]
struct Inner {
    queue: DeliveryQueue,
    dispatcher: Dispatcher,
    signer: Option<DkimSigner>,
    retry: RetryPolicy,
    limits: MessageLimits,
    rate_limiter: SenderRateLimiter,
    metrics: Metrics,
    running: AtomicBool,
    active_workers: AtomicUsize,
}

/// Shared runtime state of a relay
#[derive(Debug, Clone)]
pub struct DeliveryService {
    inner: Arc<Inner>,
}

impl DeliveryService {
    pub fn new(
        queue: DeliveryQueue,
        dispatcher: Dispatcher,
        signer: Option<DkimSigner>,
        retry: RetryPolicy,
        limits: MessageLimits,
        rate_limiter: SenderRateLimiter,
        metrics: Metrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                dispatcher,
                signer,
                retry,
                limits,
                rate_limiter,
                metrics,
                running: AtomicBool::new(false),
                active_workers: AtomicUsize::new(0),
            }),
        }
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.inner.queue
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn signer(&self) -> Option<&DkimSigner> {
        self.inner.signer.as_ref()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub fn rate_limiter(&self) -> &SenderRateLimiter {
        &self.inner.rate_limiter
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.inner.running.store(running, Ordering::Release);
    }

    /// Whether the worker pool is serving the queue
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub(crate) fn worker_started(&self) {
        self.inner.active_workers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn worker_stopped(&self) {
        self.inner.active_workers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active_workers.load(Ordering::Acquire)
    }

    /// Running workers, queue depth below capacity, and at least one
    /// provider whose circuit lets traffic through.
    pub fn is_ready(&self) -> bool {
        self.is_running()
            && self.inner.queue.len() < self.inner.queue.capacity()
            && self.inner.dispatcher.any_available()
    }

    /// Validate, rate limit and enqueue a submission.
    pub async fn submit(&self, draft: NewMessage) -> Result<QueueEntry, SubmitError> {
        let result = match Message::new(draft, &self.inner.limits) {
            Ok(message) => self.admit(message).await,
            Err(e) => Err(e.into()),
        };
        self.recorded(result)
    }

    /// [`DeliveryService::submit`] for content that arrives already rendered,
    /// such as a message received over SMTP.
    pub async fn submit_raw(
        &self,
        from: &str,
        recipients: &[String],
        content: &str,
    ) -> Result<QueueEntry, SubmitError> {
        let result = match Message::from_raw(from, recipients, content, &self.inner.limits) {
            Ok(message) => self.admit(message).await,
            Err(e) => Err(e.into()),
        };
        self.recorded(result)
    }

    fn recorded(&self, result: Result<QueueEntry, SubmitError>) -> Result<QueueEntry, SubmitError> {
        let label = result.as_ref().map_or_else(SubmitError::metric_label, |_| "accepted");
        self.inner.metrics.queue.record_submission(label);
        self.inner.metrics.queue.set_depth(self.inner.queue.len());

        result
    }

    async fn admit(&self, message: Message) -> Result<QueueEntry, SubmitError> {
        self.inner
            .rate_limiter
            .check(message.from())
            .map_err(SubmitError::RateLimited)?;

        let id = message.id().to_string();
        let sender_address = message.from().clone();
        let sender = sender_address.to_string();
        let recipients: Vec<String> = message.recipients().map(ToString::to_string).collect();
        let size = message.render().len();

        let entry = match self.inner.queue.enqueue(message).await {
            Ok(entry) => entry,
            Err(e) => {
                // the submission was not taken, so neither is the allowance
                self.inner.rate_limiter.refund(&sender_address);
                return Err(e.into());
            }
        };

        audit::log_message_accepted(&id, &sender, &recipients, size);
        incoming!(
            level = INFO,
            "Accepted {id} from {sender} to {}",
            summarize_recipients(&recipients)
        );

        Ok(entry)
    }

    fn audited<T, E: std::fmt::Display>(
        actor: &str,
        action: &str,
        target: &str,
        result: Result<T, E>,
    ) -> Result<T, E> {
        match &result {
            Ok(_) => audit::log_admin_action(actor, action, target, Ok(())),
            Err(e) => audit::log_admin_action(actor, action, target, Err(&e.to_string())),
        }
        result
    }

    fn refresh_dead_letter_gauge(&self) {
        self.inner
            .metrics
            .queue
            .set_dead_letter_depth(self.inner.queue.dead_len());
        self.inner.metrics.queue.set_depth(self.inner.queue.len());
    }
}

#[async_trait::async_trait]
impl DeliveryAdmin for DeliveryService {
    fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            queue_depth: self.inner.queue.len(),
            queue_capacity: self.inner.queue.capacity(),
            dead_letter_depth: self.inner.queue.dead_len(),
            workers_running: self.is_running(),
            providers: self.inner.dispatcher.snapshot(),
            window: self.inner.dispatcher.stats().snapshot(),
            taken_at: Utc::now(),
        }
    }

    fn dead_letters(&self) -> Vec<DeadLetterSummary> {
        self.inner
            .queue
            .dead_letters()
            .iter()
            .map(DeadLetterSummary::from)
            .collect()
    }

    fn set_circuit(
        &self,
        actor: &str,
        provider: &str,
        command: CircuitCommand,
    ) -> Result<CircuitState, AdminError> {
        let result = if self.inner.dispatcher.has_provider(provider) {
            let breaker = self.inner.dispatcher.circuit_breaker();
            match command {
                CircuitCommand::Open => breaker.force_open(provider),
                CircuitCommand::Closed => breaker.force_close(provider),
            }
            self.inner.dispatcher.refresh_circuit_gauges();
            Ok(breaker.state(provider))
        } else {
            Err(AdminError::UnknownProvider(provider.to_string()))
        };

        Self::audited(actor, command.action(), provider, result)
    }

    async fn requeue(&self, actor: &str, id: &MessageId) -> Result<QueueEntry, AdminError> {
        let result = self
            .inner
            .queue
            .requeue_dead_letter(id)
            .await
            .map_err(AdminError::from);
        self.refresh_dead_letter_gauge();

        Self::audited(actor, "requeue_dead_letter", &id.to_string(), result)
    }

    async fn requeue_all(&self, actor: &str) -> RequeueSummary {
        let mut summary = RequeueSummary::default();

        for dead in self.inner.queue.dead_letters() {
            let id = dead.id();
            match self.inner.queue.requeue_dead_letter(&id).await {
                Ok(_) => summary.requeued.push(id),
                Err(e) => summary.failed.push((id, e.to_string())),
            }
        }
        self.refresh_dead_letter_gauge();

        let target = format!("{} dead letters", summary.requeued.len() + summary.failed.len());
        let failure = format!("{} could not be requeued", summary.failed.len());
        let outcome = if summary.failed.is_empty() {
            Ok(())
        } else {
            Err(failure.as_str())
        };
        audit::log_admin_action(actor, "requeue_all_dead_letters", &target, outcome);

        summary
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_metrics::MetricsConfig;

    use super::*;
    use crate::{
        circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
        rate_limiter::RateLimitConfig,
        stats::RollingStats,
    };

    fn service(capacity: usize, limits: RateLimitConfig) -> DeliveryService {
        let metrics = Metrics::new(&MetricsConfig::default()).expect("metrics");
        let dispatcher = Dispatcher::new(
            Vec::new(),
            Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
            Arc::new(RollingStats::new(Duration::from_secs(300))),
            metrics.clone(),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );

        DeliveryService::new(
            DeliveryQueue::in_memory(capacity),
            dispatcher,
            None,
            RetryPolicy::default(),
            MessageLimits::default(),
            SenderRateLimiter::new(limits),
            metrics,
        )
    }

    fn draft(from: &str) -> NewMessage {
        NewMessage {
            from: from.to_string(),
            to: vec!["user@example.org".to_string()],
            subject: "Hello".to_string(),
            text: Some("Hi".to_string()),
            ..NewMessage::default()
        }
    }

    #[tokio::test]
    async fn test_submit_outcomes() {
        let service = service(
            1,
            RateLimitConfig {
                per_hour: 1,
                per_day: 0,
            },
        );

        let entry = service.submit(draft("app@example.com")).await.expect("accepted");
        assert_eq!(service.queue().get(&entry.id()).map(|e| e.id()), Some(entry.id()));

        let malformed = NewMessage {
            to: Vec::new(),
            ..draft("app@example.com")
        };
        assert!(matches!(
            service.submit(malformed).await,
            Err(SubmitError::Malformed(MalformedMessage::NoRecipients))
        ));

        assert!(matches!(
            service.submit(draft("app@example.com")).await,
            Err(SubmitError::RateLimited(_))
        ));

        assert!(matches!(
            service.submit(draft("other@example.com")).await,
            Err(SubmitError::Queue(QueueError::Full { capacity: 1 }))
        ));

        let metrics = &service.metrics().queue;
        assert_eq!(metrics.submissions("accepted"), 1);
        assert_eq!(metrics.submissions("rejected"), 1);
        assert_eq!(metrics.submissions("rate_limited"), 1);
        assert_eq!(metrics.submissions("unavailable"), 1);
    }

    #[tokio::test]
    async fn test_full_queue_keeps_sender_allowance() {
        let service = service(
            1,
            RateLimitConfig {
                per_hour: 1,
                per_day: 0,
            },
        );

        let first = service.submit(draft("app@example.com")).await.expect("accepted");
        assert!(matches!(
            service.submit(draft("other@example.com")).await,
            Err(SubmitError::Queue(QueueError::Full { capacity: 1 }))
        ));

        let claimed = service.queue().dequeue().await.expect("entry");
        assert_eq!(claimed.id(), first.id());
        service.queue().complete(&claimed.id()).await.expect("completed");

        // the refused submission did not spend the sender's only token
        service
            .submit(draft("other@example.com"))
            .await
            .expect("accepted once space frees up");
    }

    #[tokio::test]
    async fn test_submit_raw() {
        let service = service(10, RateLimitConfig::default());

        let entry = service
            .submit_raw(
                "app@example.com",
                &["user@example.org".to_string()],
                "Subject: Relayed\r\n\r\nBody\r\n",
            )
            .await
            .expect("accepted");
        assert!(entry.message.is_raw());
        assert_eq!(entry.message.subject(), "Relayed");

        assert!(matches!(
            service
                .submit_raw("app@example.com", &["user@example.org".to_string()], "Body only")
                .await,
            Err(SubmitError::Malformed(MalformedMessage::InvalidContent(_)))
        ));

        let metrics = &service.metrics().queue;
        assert_eq!(metrics.submissions("accepted"), 1);
        assert_eq!(metrics.submissions("rejected"), 1);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let service = service(10, RateLimitConfig::default());
        assert!(matches!(
            service.set_circuit("ops", "missing", CircuitCommand::Open),
            Err(AdminError::UnknownProvider(name)) if name == "missing"
        ));
    }

    #[tokio::test]
    async fn test_requeue_dead_letters() {
        let service = service(10, RateLimitConfig::default());

        let first = service.submit(draft("app@example.com")).await.expect("accepted");
        let second = service.submit(draft("app@example.com")).await.expect("accepted");

        for entry in [first, second] {
            service
                .queue()
                .dead_letter(entry, "retry budget exhausted")
                .await
                .expect("dead-lettered");
        }
        assert_eq!(service.dead_letters().len(), 2);
        assert_eq!(service.snapshot().queue_depth, 0);

        let summary = service.requeue_all("ops").await;
        assert_eq!(summary.requeued.len(), 2);
        assert!(summary.failed.is_empty());
        assert_eq!(service.snapshot().queue_depth, 2);
        assert_eq!(service.snapshot().dead_letter_depth, 0);

        assert!(matches!(
            service.requeue("ops", &MessageId::generate()).await,
            Err(AdminError::Queue(QueueError::NotFound(_)))
        ));
    }

    #[test]
    fn test_not_ready_until_running() {
        let service = service(10, RateLimitConfig::default());
        assert!(!service.is_ready());
    }
}
