//! Error types for metrics operations

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    /// A collector could not be created or registered
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// Histogram buckets must be finite and strictly increasing
    #[error("Invalid latency buckets: {0:?}")]
    InvalidBuckets(Vec<f64>),

    /// The text exposition could not be produced
    #[error("Failed to encode metrics: {0}")]
    Encode(String),
}
