//! Prometheus metrics for courier
//!
//! Every collector is registered against a [`Registry`] owned by [`Metrics`]
//! rather than the process-global default one, so independent relays (and
//! tests) never share counters. The health server renders the registry with
//! [`Metrics::encode`] on each scrape of `/metrics`.
//!
//! ```rust
//! use courier_metrics::{Metrics, MetricsConfig};
//!
//! let metrics = Metrics::new(&MetricsConfig::default()).unwrap();
//! metrics.queue.set_depth(3);
//! assert!(metrics.encode().unwrap().contains("courier_queue_depth 3"));
//! ```

mod config;
mod delivery;
mod error;
mod queue;

pub use config::MetricsConfig;
pub use delivery::{CircuitGauge, DeliveryMetrics};
pub use error::MetricsError;
use prometheus::{Encoder, Registry, TextEncoder};
pub use queue::QueueMetrics;

/// Root metrics container
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub delivery: DeliveryMetrics,
    pub queue: QueueMetrics,
}

impl Metrics {
    /// Create and register every collector.
    ///
    /// # Errors
    /// Fails if the latency buckets are not strictly increasing.
    pub fn new(config: &MetricsConfig) -> Result<Self, MetricsError> {
        let buckets = &config.latency_buckets;
        if buckets.is_empty()
            || buckets.iter().any(|b| !b.is_finite())
            || buckets.windows(2).any(|pair| pair[0] >= pair[1])
        {
            return Err(MetricsError::InvalidBuckets(buckets.clone()));
        }

        let registry = Registry::new();
        let delivery = DeliveryMetrics::register(&registry, config.latency_buckets.clone())?;
        let queue = QueueMetrics::register(&registry)?;

        tracing::debug!("Metrics registry initialised");

        Ok(Self {
            registry,
            delivery,
            queue,
        })
    }

    /// Render every metric in the Prometheus text exposition format.
    ///
    /// # Errors
    /// Fails if the encoder rejects a metric family.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|err| MetricsError::Encode(err.to_string()))?;

        String::from_utf8(buffer).map_err(|err| MetricsError::Encode(err.to_string()))
    }

    /// Content type of [`Metrics::encode`] output
    #[must_use]
    pub fn content_type() -> &'static str {
        prometheus::TEXT_FORMAT
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    fn metrics() -> Metrics {
        Metrics::new(&MetricsConfig::default()).unwrap()
    }

    #[test]
    fn test_encode_includes_recorded_series() {
        let metrics = metrics();
        metrics
            .delivery
            .record_attempt("primary", "success", Duration::from_millis(120));
        metrics
            .delivery
            .set_circuit_state("backup", CircuitGauge::Open);
        metrics.delivery.record_dkim_failure();
        metrics.queue.set_dead_letter_depth(2);
        metrics.queue.record_submission("accepted");

        let output = metrics.encode().unwrap();
        assert!(output.contains(
            r#"courier_delivery_attempts_total{outcome="success",provider="primary"} 1"#
        ));
        assert!(output.contains(r#"courier_circuit_state{provider="backup"} 2"#));
        assert!(output.contains("courier_dkim_signing_failures_total 1"));
        assert!(output.contains("courier_dead_letter_depth 2"));
        assert!(output.contains(r#"courier_submissions_total{result="accepted"} 1"#));
        assert!(output.contains("courier_delivery_latency_seconds_bucket"));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = metrics();
        let second = metrics();

        first.delivery.record_delivered();
        assert_eq!(first.delivery.delivered(), 1);
        assert_eq!(second.delivery.delivered(), 0);
    }

    #[test]
    fn test_unsorted_buckets_are_rejected() {
        let config = MetricsConfig {
            latency_buckets: vec![1.0, 0.5],
            ..MetricsConfig::default()
        };
        assert!(matches!(
            Metrics::new(&config),
            Err(MetricsError::InvalidBuckets(_))
        ));
    }

    #[test]
    fn test_config_defaults() {
        let config: MetricsConfig = ron::from_str("(enabled: false)").unwrap();
        assert!(!config.enabled);
        assert_eq!(config.latency_buckets, MetricsConfig::default().latency_buckets);
    }
}
