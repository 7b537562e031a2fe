//! Queue depth and submission metrics

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

use crate::MetricsError;

#[derive(Debug, Clone)]
pub struct QueueMetrics {
    depth: IntGauge,
    dead_letter_depth: IntGauge,
    submissions: IntCounterVec,
}

impl QueueMetrics {
    pub(crate) fn register(registry: &Registry) -> Result<Self, MetricsError> {
        let depth = IntGauge::new("courier_queue_depth", "Messages waiting for delivery")?;
        let dead_letter_depth = IntGauge::new(
            "courier_dead_letter_depth",
            "Messages currently in the dead-letter set",
        )?;
        let submissions = IntCounterVec::new(
            Opts::new("courier_submissions_total", "Submissions by result"),
            &["result"],
        )?;

        registry.register(Box::new(depth.clone()))?;
        registry.register(Box::new(dead_letter_depth.clone()))?;
        registry.register(Box::new(submissions.clone()))?;

        Ok(Self {
            depth,
            dead_letter_depth,
            submissions,
        })
    }

    pub fn set_depth(&self, depth: usize) {
        self.depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    pub fn set_dead_letter_depth(&self, depth: usize) {
        self.dead_letter_depth
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// `result` is one of `accepted`, `rejected`, `rate_limited` or `unavailable`.
    pub fn record_submission(&self, result: &str) {
        self.submissions.with_label_values(&[result]).inc();
    }

    #[must_use]
    pub fn depth(&self) -> i64 {
        self.depth.get()
    }

    #[must_use]
    pub fn dead_letter_depth(&self) -> i64 {
        self.dead_letter_depth.get()
    }

    #[must_use]
    pub fn submissions(&self, result: &str) -> u64 {
        self.submissions.with_label_values(&[result]).get()
    }
}
