//! Failover across providers.
//!
//! One call to [`Dispatcher::dispatch`] is one delivery cycle: providers are
//! tried in ranked order until one accepts the message. Providers whose
//! circuit is open are skipped without a network call. A permanent failure
//! does not stop the cycle, since another provider may well accept what this
//! one refused, but that provider is not offered the same message again.
//!
//! When a provider accepts some recipients before failing, the rest of the
//! cycle only sends to the recipients still outstanding.
//!
//! Ranking is by ascending priority, then by the recently observed latency
//! of each provider, then by configuration order. The ranking is cached and
//! recomputed at most once per refresh interval.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use courier_common::{AttemptOutcome, DeliveryAttempt, audit, outgoing};
use courier_metrics::Metrics;
use serde::Serialize;

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitSnapshot},
    error::{DeliveryError, TemporaryError},
    provider::{OutboundMessage, Provider},
    stats::RollingStats,
};

/// Weight given to the newest latency sample
const LATENCY_ALPHA: f64 = 0.3;

#[derive(Debug)]
struct ProviderSlot {
    provider: Arc<dyn Provider>,
    priority: u32,
    /// Exponentially weighted moving average, in milliseconds
    latency_ms: parking_lot::Mutex<Option<f64>>,
}

impl ProviderSlot {
    fn name(&self) -> &str {
        self.provider.name()
    }

    fn observe(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        let mut latency = self.latency_ms.lock();
        *latency = Some(latency.map_or(sample, |average| {
            LATENCY_ALPHA.mul_add(sample, (1.0 - LATENCY_ALPHA) * average)
        }));
    }

    fn latency(&self) -> Option<f64> {
        *self.latency_ms.lock()
    }
}

#[derive(Debug)]
struct Ranking {
    order: Vec<usize>,
    computed_at: Option<Instant>,
}

/// Runtime view of one provider, for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    pub name: String,
    pub priority: u32,
    pub circuit: CircuitSnapshot,
    pub average_latency_ms: Option<f64>,
}

/// What happened during one cycle
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    /// The provider that accepted the message
    pub delivered_by: Option<String>,
    /// Attempts made in this cycle, in order
    pub attempts: Vec<DeliveryAttempt>,
    /// Recipients accepted by providers that then failed
    pub delivered_to: Vec<String>,
    /// Providers skipped because their circuit was open
    pub skipped_open: usize,
    /// Providers skipped because they already refused the message
    pub skipped_refused: usize,
}

impl CycleOutcome {
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        self.delivered_by.is_some()
    }

    /// Providers that refused the message permanently in this cycle
    pub fn refusals(&self) -> impl Iterator<Item = &str> {
        self.attempts
            .iter()
            .filter(|attempt| attempt.outcome == AttemptOutcome::Permanent)
            .map(|attempt| attempt.provider.as_str())
    }

    /// A short description of why the cycle failed
    #[must_use]
    pub fn failure_summary(&self) -> String {
        if self.attempts.is_empty() {
            let mut reasons = Vec::new();
            if self.skipped_open > 0 {
                reasons.push(format!("{} with an open circuit", self.skipped_open));
            }
            if self.skipped_refused > 0 {
                reasons.push(format!("{} already refused it", self.skipped_refused));
            }
            if reasons.is_empty() {
                return "no provider available".to_string();
            }
            return format!("no provider available: {}", reasons.join(", "));
        }

        self.attempts
            .iter()
            .filter_map(|attempt| {
                attempt
                    .error
                    .as_ref()
                    .map(|error| format!("{}: {error}", attempt.provider))
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug)]
pub struct Dispatcher {
    slots: Vec<ProviderSlot>,
    circuit_breaker: Arc<CircuitBreaker>,
    stats: Arc<RollingStats>,
    metrics: Metrics,
    send_timeout: Duration,
    refresh_interval: Duration,
    ranking: parking_lot::Mutex<Ranking>,
}

impl Dispatcher {
    /// `providers` pairs each provider with its priority, in configuration
    /// order.
    pub fn new(
        providers: Vec<(Arc<dyn Provider>, u32)>,
        circuit_breaker: Arc<CircuitBreaker>,
        stats: Arc<RollingStats>,
        metrics: Metrics,
        send_timeout: Duration,
        refresh_interval: Duration,
    ) -> Self {
        let slots: Vec<ProviderSlot> = providers
            .into_iter()
            .map(|(provider, priority)| ProviderSlot {
                provider,
                priority,
                latency_ms: parking_lot::Mutex::new(None),
            })
            .collect();

        for slot in &slots {
            metrics
                .delivery
                .set_circuit_state(slot.name(), circuit_breaker.state(slot.name()).into());
        }

        Self {
            slots,
            circuit_breaker,
            stats,
            metrics,
            send_timeout,
            refresh_interval,
            ranking: parking_lot::Mutex::new(Ranking {
                order: Vec::new(),
                computed_at: None,
            }),
        }
    }

    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(ProviderSlot::name)
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.slots.iter().any(|slot| slot.name() == name)
    }

    pub const fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    pub const fn stats(&self) -> &Arc<RollingStats> {
        &self.stats
    }

    /// Whether at least one provider would currently be attempted
    pub fn any_available(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| self.circuit_breaker.allows_traffic(slot.name()))
    }

    /// Providers in configuration order
    pub fn snapshot(&self) -> Vec<ProviderSnapshot> {
        self.slots
            .iter()
            .map(|slot| ProviderSnapshot {
                name: slot.name().to_string(),
                priority: slot.priority,
                circuit: self.circuit_breaker.snapshot(slot.name()),
                average_latency_ms: slot.latency(),
            })
            .collect()
    }

    /// Push every circuit state to the metrics gauge.
    pub fn refresh_circuit_gauges(&self) {
        for slot in &self.slots {
            self.metrics
                .delivery
                .set_circuit_state(slot.name(), self.circuit_breaker.state(slot.name()).into());
        }
    }

    fn compute_ranking(&self) -> Vec<usize> {
        let mut order: Vec<(u32, f64, usize)> = self
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (slot.priority, slot.latency().unwrap_or(0.0), index))
            .collect();

        order.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.total_cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        order.into_iter().map(|(_, _, index)| index).collect()
    }

    /// Provider indices in the order they should be tried
    fn ranked(&self) -> Vec<usize> {
        let mut ranking = self.ranking.lock();

        let stale = ranking
            .computed_at
            .is_none_or(|at| at.elapsed() >= self.refresh_interval);

        if stale {
            ranking.order = self.compute_ranking();
            ranking.computed_at = Some(Instant::now());
        }

        ranking.order.clone()
    }

    /// Provider names in the order the next cycle would try them
    pub fn ranked_names(&self) -> Vec<String> {
        self.ranked()
            .into_iter()
            .map(|index| self.slots[index].name().to_string())
            .collect()
    }

    async fn attempt(
        &self,
        provider: &dyn Provider,
        message: &OutboundMessage,
    ) -> Result<(), DeliveryError> {
        tokio::time::timeout(self.send_timeout, provider.send(message))
            .await
            .unwrap_or_else(|_| {
                Err(TemporaryError::Timeout(format!(
                    "{} did not respond within {:?}",
                    provider.name(),
                    self.send_timeout
                ))
                .into())
            })
    }

    /// Run one delivery cycle for `message` across every provider.
    ///
    /// `cycle` is 1-indexed and only used for logging.
    pub async fn dispatch(&self, message: &OutboundMessage, cycle: u32) -> CycleOutcome {
        self.dispatch_except(message, cycle, &[]).await
    }

    /// Run one delivery cycle, leaving out the providers in `refused_by`.
    #[tracing::instrument(level = "debug", skip_all, fields(message_id = %message.message.id(), cycle = cycle))]
    pub async fn dispatch_except(
        &self,
        message: &OutboundMessage,
        cycle: u32,
        refused_by: &[String],
    ) -> CycleOutcome {
        let id = message.message.id().to_string();
        let mut outbound = message.clone();
        let order = self.ranked();
        let names: Vec<String> = order
            .iter()
            .map(|&index| self.slots[index].name().to_string())
            .collect();

        audit::log_delivery_attempt(&id, cycle, &names);

        let mut outcome = CycleOutcome::default();

        for index in order {
            let slot = &self.slots[index];
            let name = slot.name();

            // checked first: a half-open circuit hands its trial to whoever asks
            if refused_by.iter().any(|refused| refused == name) {
                outgoing!(level = DEBUG, "Skipping {name} for {id}: refused it before");
                outcome.skipped_refused += 1;
                continue;
            }

            if !self.circuit_breaker.should_allow_delivery(name) {
                outgoing!(level = DEBUG, "Skipping {name} for {id}: circuit open");
                outcome.skipped_open += 1;
                continue;
            }

            let started = Instant::now();
            let result = self.attempt(slot.provider.as_ref(), &outbound).await;
            let elapsed = started.elapsed();
            let latency_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

            slot.observe(elapsed);

            match result {
                Ok(()) => {
                    self.circuit_breaker.record_success(name);
                    self.stats.record(true);
                    self.metrics
                        .delivery
                        .record_attempt(name, AttemptOutcome::Success.as_str(), elapsed);
                    self.metrics
                        .delivery
                        .set_circuit_state(name, self.circuit_breaker.state(name).into());

                    audit::log_delivery_success(&id, name, cycle, latency_ms);
                    outgoing!(level = INFO, "Delivered {id} via {name} in {latency_ms}ms");

                    outcome.attempts.push(DeliveryAttempt::success(name, latency_ms));
                    outcome.delivered_by = Some(name.to_string());
                    return outcome;
                }
                Err(error) => {
                    let kind = if error.is_permanent() {
                        AttemptOutcome::Permanent
                    } else {
                        AttemptOutcome::Transient
                    };

                    // a permanent refusal says nothing about the provider's health
                    if kind == AttemptOutcome::Permanent {
                        self.circuit_breaker.release_trial(name);
                    } else if self.circuit_breaker.record_failure(name) {
                        tracing::warn!(provider = name, "Provider circuit opened");
                    }

                    self.stats.record(false);
                    self.metrics.delivery.record_attempt(name, kind.as_str(), elapsed);
                    self.metrics
                        .delivery
                        .set_circuit_state(name, self.circuit_breaker.state(name).into());

                    let delivered = error.delivered();
                    if !delivered.is_empty() {
                        outbound.recipients.retain(|recipient| {
                            let recipient = recipient.to_string();
                            !delivered.iter().any(|done| done.eq_ignore_ascii_case(&recipient))
                        });
                        outcome.delivered_to.extend_from_slice(delivered);
                    }

                    let detail = error.to_string();
                    audit::log_delivery_failure(&id, name, &detail, kind.as_str());
                    outgoing!(level = WARN, "Delivery of {id} via {name} failed ({kind}): {detail}");

                    outcome
                        .attempts
                        .push(DeliveryAttempt::failure(name, kind, detail, latency_ms));
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use courier_common::{Message, MessageLimits, NewMessage};
    use courier_metrics::MetricsConfig;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        circuit_breaker::{CircuitBreakerConfig, CircuitState},
        error::PermanentError,
    };

    #[derive(Debug, Clone, Copy)]
    enum Behaviour {
        Accept,
        Transient,
        Permanent,
        Hang,
        /// Accepts the first recipient, then the server goes away
        AcceptFirstThenBusy,
    }

    #[derive(Debug)]
    struct StubProvider {
        name: String,
        behaviour: Behaviour,
        calls: AtomicUsize,
        delay: Duration,
        /// Recipients of every call
        seen: parking_lot::Mutex<Vec<Vec<String>>>,
    }

    impl StubProvider {
        fn new(name: &str, behaviour: Behaviour) -> Arc<Self> {
            Self::with_delay(name, behaviour, Duration::ZERO)
        }

        fn with_delay(name: &str, behaviour: Behaviour, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                behaviour,
                calls: AtomicUsize::new(0),
                delay,
                seen: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let recipients: Vec<String> =
                message.recipients.iter().map(ToString::to_string).collect();
            self.seen.lock().push(recipients.clone());
            tokio::time::sleep(self.delay).await;

            match self.behaviour {
                Behaviour::Accept => Ok(()),
                Behaviour::Transient => {
                    Err(TemporaryError::ServerBusy("421 try again later".to_string()).into())
                }
                Behaviour::Permanent => {
                    Err(PermanentError::MessageRejected("554 rejected".to_string()).into())
                }
                Behaviour::Hang => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                Behaviour::AcceptFirstThenBusy => Err(DeliveryError::partial(
                    TemporaryError::ConnectionFailed("connection reset".to_string()).into(),
                    recipients.into_iter().take(1).collect(),
                )),
            }
        }
    }

    fn outbound() -> OutboundMessage {
        addressed(&["recipient@example.org"])
    }

    fn addressed(to: &[&str]) -> OutboundMessage {
        let message = Message::new(
            NewMessage {
                from: "sender@example.com".to_string(),
                to: to.iter().map(ToString::to_string).collect(),
                subject: "Dispatch".to_string(),
                text: Some("Body".to_string()),
                ..NewMessage::default()
            },
            &MessageLimits::default(),
        )
        .expect("valid message");
        OutboundMessage::unsigned(Arc::new(message))
    }

    fn ranked(provider: &Arc<StubProvider>, priority: u32) -> (Arc<dyn Provider>, u32) {
        (provider.clone(), priority)
    }

    fn dispatcher(providers: Vec<(Arc<dyn Provider>, u32)>, threshold: u32) -> Dispatcher {
        Dispatcher::new(
            providers,
            Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: threshold,
                failure_window_secs: 60,
                timeout_secs: 300,
                success_threshold: 1,
            })),
            Arc::new(RollingStats::new(Duration::from_secs(300))),
            Metrics::new(&MetricsConfig::default()).expect("metrics"),
            Duration::from_millis(200),
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn test_failover_to_next_priority() {
        let primary = StubProvider::new("primary", Behaviour::Transient);
        let backup = StubProvider::new("backup", Behaviour::Accept);
        let dispatcher = dispatcher(vec![ranked(&backup, 2), ranked(&primary, 1)], 5);

        let outcome = dispatcher.dispatch(&outbound(), 1).await;

        assert_eq!(outcome.delivered_by.as_deref(), Some("backup"));
        let history: Vec<_> = outcome
            .attempts
            .iter()
            .map(|a| (a.provider.as_str(), a.outcome))
            .collect();
        assert_eq!(
            history,
            vec![
                ("primary", AttemptOutcome::Transient),
                ("backup", AttemptOutcome::Success)
            ]
        );
        assert!((dispatcher.metrics.delivery.attempts("primary", "transient") - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_permanent_failure_still_fails_over() {
        let primary = StubProvider::new("primary", Behaviour::Permanent);
        let backup = StubProvider::new("backup", Behaviour::Accept);
        let dispatcher = dispatcher(vec![ranked(&primary, 1), ranked(&backup, 2)], 1);

        let outcome = dispatcher.dispatch(&outbound(), 1).await;

        assert!(outcome.is_delivered());
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Permanent);
        // permanent failures leave the circuit alone, even with a threshold of 1
        assert_eq!(
            dispatcher.circuit_breaker().state("primary"),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_refusing_provider_is_not_offered_again() {
        let primary = StubProvider::new("primary", Behaviour::Permanent);
        let backup = StubProvider::new("backup", Behaviour::Transient);
        let dispatcher = dispatcher(vec![ranked(&primary, 1), ranked(&backup, 2)], 5);

        let first = dispatcher.dispatch(&outbound(), 1).await;
        let refused: Vec<String> = first.refusals().map(ToString::to_string).collect();
        assert_eq!(refused, vec!["primary"]);

        let second = dispatcher.dispatch_except(&outbound(), 2, &refused).await;
        assert_eq!(primary.calls(), 1);
        assert_eq!(backup.calls(), 2);
        assert_eq!(second.skipped_refused, 1);
        assert_eq!(second.attempts.len(), 1);
        assert_eq!(second.attempts[0].provider, "backup");

        // with nothing left to try the cycle makes no attempt at all
        let only = StubProvider::new("only", Behaviour::Permanent);
        let dispatcher = dispatcher_with(&only);
        let outcome = dispatcher
            .dispatch_except(&outbound(), 2, &["only".to_string()])
            .await;
        assert!(outcome.attempts.is_empty());
        assert_eq!(only.calls(), 0);
        assert_eq!(outcome.failure_summary(), "no provider available: 1 already refused it");
    }

    fn dispatcher_with(provider: &Arc<StubProvider>) -> Dispatcher {
        dispatcher(vec![ranked(provider, 1)], 5)
    }

    #[tokio::test]
    async fn test_partial_delivery_narrows_recipients() {
        let flaky = StubProvider::new("flaky", Behaviour::AcceptFirstThenBusy);
        let backup = StubProvider::new("backup", Behaviour::Accept);
        let dispatcher = dispatcher(vec![ranked(&flaky, 1), ranked(&backup, 2)], 5);

        let outcome = dispatcher
            .dispatch(&addressed(&["a@example.org", "b@example.org", "c@example.org"]), 1)
            .await;

        assert_eq!(outcome.delivered_by.as_deref(), Some("backup"));
        assert_eq!(outcome.delivered_to, vec!["a@example.org"]);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Transient);
        assert_eq!(
            backup.seen.lock().clone(),
            vec![vec!["b@example.org".to_string(), "c@example.org".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_open_circuit_is_skipped() {
        let primary = StubProvider::new("primary", Behaviour::Accept);
        let dispatcher = dispatcher(vec![ranked(&primary, 1)], 3);

        dispatcher.circuit_breaker().force_open("primary");
        assert!(!dispatcher.any_available());

        let outcome = dispatcher.dispatch(&outbound(), 1).await;
        assert!(!outcome.is_delivered());
        assert!(outcome.attempts.is_empty());
        assert_eq!(primary.calls(), 0);
        assert!(outcome.failure_summary().contains("circuit"));
    }

    #[tokio::test]
    async fn test_transient_failures_open_circuit() {
        let primary = StubProvider::new("primary", Behaviour::Transient);
        let dispatcher = dispatcher(vec![ranked(&primary, 1)], 3);

        for cycle in 1..=3 {
            dispatcher.dispatch(&outbound(), cycle).await;
        }
        assert_eq!(
            dispatcher.circuit_breaker().state("primary"),
            CircuitState::Open
        );

        dispatcher.dispatch(&outbound(), 4).await;
        assert_eq!(primary.calls(), 3);
    }

    #[tokio::test]
    async fn test_refusal_during_trial_frees_the_slot() {
        let primary = StubProvider::new("primary", Behaviour::Permanent);
        let dispatcher = Dispatcher::new(
            vec![ranked(&primary, 1)],
            Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: 1,
                failure_window_secs: 60,
                timeout_secs: 0,
                success_threshold: 1,
            })),
            Arc::new(RollingStats::new(Duration::from_secs(300))),
            Metrics::new(&MetricsConfig::default()).expect("metrics"),
            Duration::from_millis(200),
            Duration::ZERO,
        );
        dispatcher.circuit_breaker().record_failure("primary");

        dispatcher.dispatch(&outbound(), 1).await;
        dispatcher.dispatch(&outbound(), 1).await;

        assert_eq!(primary.calls(), 2);
        assert_eq!(
            dispatcher.circuit_breaker().state("primary"),
            CircuitState::HalfOpen
        );
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let primary = StubProvider::new("primary", Behaviour::Hang);
        let dispatcher = dispatcher(vec![ranked(&primary, 1)], 5);

        let outcome = dispatcher.dispatch(&outbound(), 1).await;
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Transient);
        assert!(outcome.failure_summary().contains("did not respond"));
        assert_eq!(dispatcher.circuit_breaker().snapshot("primary").failure_count, 1);
    }

    #[tokio::test]
    async fn test_equal_priority_prefers_lower_latency() {
        let slow = StubProvider::with_delay("slow", Behaviour::Accept, Duration::from_millis(60));
        let fast = StubProvider::with_delay("fast", Behaviour::Accept, Duration::from_millis(1));
        let dispatcher = dispatcher(vec![ranked(&slow, 1), ranked(&fast, 1)], 5);

        // with no latency observed, configuration order decides
        assert_eq!(dispatcher.ranked_names(), vec!["slow", "fast"]);

        dispatcher.slots[0].observe(Duration::from_millis(60));
        dispatcher.slots[1].observe(Duration::from_millis(1));

        assert_eq!(dispatcher.ranked_names(), vec!["fast", "slow"]);

        let outcome = dispatcher.dispatch(&outbound(), 1).await;
        assert_eq!(outcome.delivered_by.as_deref(), Some("fast"));
        assert_eq!(slow.calls(), 0);
    }

    #[test]
    fn test_latency_average() {
        let slot = ProviderSlot {
            provider: StubProvider::new("p", Behaviour::Accept),
            priority: 1,
            latency_ms: parking_lot::Mutex::new(None),
        };

        slot.observe(Duration::from_millis(100));
        assert!(slot.latency().is_some_and(|l| (l - 100.0).abs() < 1e-6));

        slot.observe(Duration::from_millis(200));
        assert!(slot.latency().is_some_and(|l| (l - 130.0).abs() < 1e-6));
    }
}
