use serde::Deserialize;

/// Metrics configuration
///
/// ```ron
/// metrics: (
///     enabled: true,
///     latency_buckets: [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
/// ),
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MetricsConfig {
    /// When disabled `/metrics` is not served, though collectors still record.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Histogram buckets, in seconds, for provider send latency
    #[serde(default = "default_latency_buckets")]
    pub latency_buckets: Vec<f64>,
}

const fn default_enabled() -> bool {
    true
}

fn default_latency_buckets() -> Vec<f64> {
    vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            latency_buckets: default_latency_buckets(),
        }
    }
}
