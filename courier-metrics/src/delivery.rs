//! Provider-side delivery metrics
//!
//! - attempts by provider and outcome
//! - send latency per provider
//! - circuit state per provider
//! - delivered, dead-lettered and DKIM failure totals

use std::time::Duration;

use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry};

use crate::MetricsError;

/// Numeric encoding of a circuit for the `circuit_state` gauge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitGauge {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitGauge {
    const fn value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryMetrics {
    attempts: CounterVec,
    latency: HistogramVec,
    circuit_state: GaugeVec,
    delivered: IntCounter,
    dead_lettered: IntCounter,
    dkim_failures: IntCounter,
}

impl DeliveryMetrics {
    pub(crate) fn register(registry: &Registry, buckets: Vec<f64>) -> Result<Self, MetricsError> {
        let attempts = CounterVec::new(
            Opts::new(
                "courier_delivery_attempts_total",
                "Delivery attempts by provider and outcome",
            ),
            &["provider", "outcome"],
        )?;

        let latency = HistogramVec::new(
            HistogramOpts::new(
                "courier_delivery_latency_seconds",
                "Time taken by a provider to accept or reject a message",
            )
            .buckets(buckets),
            &["provider"],
        )?;

        let circuit_state = GaugeVec::new(
            Opts::new(
                "courier_circuit_state",
                "Circuit breaker state per provider (0 closed, 1 half-open, 2 open)",
            ),
            &["provider"],
        )?;

        let delivered = IntCounter::new(
            "courier_messages_delivered_total",
            "Messages accepted by a provider",
        )?;
        let dead_lettered = IntCounter::new(
            "courier_messages_dead_lettered_total",
            "Messages moved to the dead-letter set",
        )?;
        let dkim_failures = IntCounter::new(
            "courier_dkim_signing_failures_total",
            "Messages that could not be DKIM signed",
        )?;

        registry.register(Box::new(attempts.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(circuit_state.clone()))?;
        registry.register(Box::new(delivered.clone()))?;
        registry.register(Box::new(dead_lettered.clone()))?;
        registry.register(Box::new(dkim_failures.clone()))?;

        Ok(Self {
            attempts,
            latency,
            circuit_state,
            delivered,
            dead_lettered,
            dkim_failures,
        })
    }

    /// Record one provider attempt. `outcome` is `success`, `transient` or `permanent`.
    pub fn record_attempt(&self, provider: &str, outcome: &str, latency: Duration) {
        self.attempts.with_label_values(&[provider, outcome]).inc();
        self.latency
            .with_label_values(&[provider])
            .observe(latency.as_secs_f64());
    }

    pub fn set_circuit_state(&self, provider: &str, state: CircuitGauge) {
        self.circuit_state
            .with_label_values(&[provider])
            .set(state.value());
    }

    pub fn record_delivered(&self) {
        self.delivered.inc();
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.inc();
    }

    pub fn record_dkim_failure(&self) {
        self.dkim_failures.inc();
    }

    #[must_use]
    pub fn attempts(&self, provider: &str, outcome: &str) -> f64 {
        self.attempts.with_label_values(&[provider, outcome]).get()
    }

    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.get()
    }

    #[must_use]
    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.get()
    }

    #[must_use]
    pub fn dkim_failures(&self) -> u64 {
        self.dkim_failures.get()
    }
}
