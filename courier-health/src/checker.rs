//! Readiness bookkeeping

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

/// Tracks the state readiness is judged on.
///
/// The delivery side pushes updates in; health checks only ever read. Every
/// field is an independent atomic, so a check may observe a mix of two
/// updates, which is harmless for a yes/no answer re-evaluated on the next
/// request.
#[derive(Debug)]
pub struct HealthChecker {
    /// Whether the delivery workers are running
    delivery_ready: AtomicBool,

    /// Whether at least one provider circuit lets traffic through
    providers_available: AtomicBool,

    /// Current number of queued messages
    queue_size: AtomicU64,

    /// Queue capacity; readiness requires `queue_size` to stay below it
    queue_capacity: AtomicU64,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    /// Create a checker that reports not-ready until told otherwise
    #[must_use]
    pub const fn new() -> Self {
        Self {
            delivery_ready: AtomicBool::new(false),
            providers_available: AtomicBool::new(false),
            queue_size: AtomicU64::new(0),
            queue_capacity: AtomicU64::new(0),
        }
    }

    pub fn set_delivery_ready(&self, ready: bool) {
        if self.delivery_ready.swap(ready, Ordering::Relaxed) != ready {
            tracing::debug!(ready, "Delivery readiness updated");
        }
    }

    pub fn set_providers_available(&self, available: bool) {
        if self.providers_available.swap(available, Ordering::Relaxed) != available {
            tracing::debug!(available, "Provider availability updated");
        }
    }

    /// Update the current queue depth and its capacity
    pub fn set_queue(&self, size: u64, capacity: u64) {
        self.queue_size.store(size, Ordering::Relaxed);
        self.queue_capacity.store(capacity, Ordering::Relaxed);
    }

    /// For liveness, responding at all is the signal. A dead server is
    /// detected by the caller's own timeout.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        true
    }

    /// Whether the relay can accept and deliver new mail
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.get_status().ready
    }

    /// Get detailed readiness status for debugging
    #[must_use]
    pub fn get_status(&self) -> HealthStatus {
        let delivery_ready = self.delivery_ready.load(Ordering::Relaxed);
        let providers_available = self.providers_available.load(Ordering::Relaxed);
        let queue_size = self.queue_size.load(Ordering::Relaxed);
        let queue_capacity = self.queue_capacity.load(Ordering::Relaxed);

        HealthStatus {
            alive: self.is_alive(),
            ready: delivery_ready && providers_available && queue_size < queue_capacity,
            delivery_ready,
            providers_available,
            queue_size,
            queue_capacity,
        }
    }
}

/// Detailed health status information
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[allow(
    clippy::struct_excessive_bools,
    reason = "Status struct intentionally has multiple boolean fields for clarity"
)]
pub struct HealthStatus {
    pub alive: bool,
    pub ready: bool,
    pub delivery_ready: bool,
    pub providers_available: bool,
    pub queue_size: u64,
    pub queue_capacity: u64,
}
