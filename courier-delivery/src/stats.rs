//! Success and failure counts over a sliding time window.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use serde::Serialize;

/// Attempt outcomes within the window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowStats {
    pub window_secs: u64,
    pub successes: u64,
    pub failures: u64,
    /// `None` when nothing happened in the window
    pub success_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// Whole seconds since the stats were created
    second: u64,
    successes: u64,
    failures: u64,
}

/// Outcome counters bucketed per second, so memory stays bounded by the
/// window length rather than by throughput.
#[derive(Debug)]
pub struct RollingStats {
    window: Duration,
    origin: Instant,
    buckets: parking_lot::Mutex<VecDeque<Bucket>>,
}

impl RollingStats {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_secs(1)),
            origin: Instant::now(),
            buckets: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    fn now_second(&self) -> u64 {
        self.origin.elapsed().as_secs()
    }

    fn prune(&self, buckets: &mut VecDeque<Bucket>, now: u64) {
        let oldest = now.saturating_sub(self.window.as_secs().saturating_sub(1));
        while buckets.front().is_some_and(|bucket| bucket.second < oldest) {
            buckets.pop_front();
        }
    }

    pub fn record(&self, success: bool) {
        let now = self.now_second();
        let mut buckets = self.buckets.lock();
        self.prune(&mut buckets, now);

        if buckets.back().is_none_or(|bucket| bucket.second != now) {
            buckets.push_back(Bucket {
                second: now,
                successes: 0,
                failures: 0,
            });
        }

        if let Some(bucket) = buckets.back_mut() {
            if success {
                bucket.successes += 1;
            } else {
                bucket.failures += 1;
            }
        }
    }

    pub fn snapshot(&self) -> WindowStats {
        let now = self.now_second();
        let mut buckets = self.buckets.lock();
        self.prune(&mut buckets, now);

        let (successes, failures) = buckets.iter().fold((0, 0), |(s, f), bucket| {
            (s + bucket.successes, f + bucket.failures)
        });
        drop(buckets);

        let total = successes + failures;
        #[allow(clippy::cast_precision_loss)]
        let success_rate = (total > 0).then(|| successes as f64 / total as f64);

        WindowStats {
            window_secs: self.window.as_secs(),
            successes,
            failures,
            success_rate,
        }
    }
}
