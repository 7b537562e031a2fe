//! Per-provider circuit breaker
//!
//! Stops the dispatcher from hammering a provider that keeps failing.
//!
//! ```text
//! ┌─────────┐  failure_threshold failures   ┌──────┐
//! │ Closed  │ ───── within the window ────> │ Open │ <── force_open (sticky)
//! └─────────┘                               └──────┘
//!     ^                                        │
//!     │                                        │ cooldown (timeout_secs) elapsed
//!     │  success_threshold successes           v
//!     └───────────────────────────────  ┌───────────┐
//!                                       │ Half-Open │ ── failure ──> Open
//!                                       └───────────┘
//! ```
//!
//! Only temporary failures count against a provider. A permanent rejection
//! says something about the message, not about the provider's health.
//!
//! A half-open circuit lets a single trial through at a time. Every other
//! caller is refused until that trial is recorded as a success or a failure.
//!
//! An operator can force a circuit open, in which case the cooldown does not
//! apply and it stays open until forced closed.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of failures required to open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Window over which failures are counted (seconds)
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,

    /// How long the circuit stays open before a trial attempt (seconds)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Successes needed in half-open state to close the circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            timeout_secs: default_timeout_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_failure_window_secs() -> u64 {
    60
}

const fn default_timeout_secs() -> u64 {
    300
}

const fn default_success_threshold() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Tripped: no attempts are made
    Open,
    /// Cooldown elapsed: the next attempt is a trial
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl From<CircuitState> for courier_metrics::CircuitGauge {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => Self::Closed,
            CircuitState::HalfOpen => Self::HalfOpen,
            CircuitState::Open => Self::Open,
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerData {
    state: CircuitState,
    failure_count: u32,
    first_failure_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    consecutive_successes: u32,
    /// A half-open circuit admits one attempt at a time
    trial_in_flight: bool,
    /// Set by an operator; suppresses the cooldown
    forced: bool,
}

impl CircuitBreakerData {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            first_failure_at: None,
            last_failure_at: None,
            opened_at: None,
            consecutive_successes: 0,
            trial_in_flight: false,
            forced: false,
        }
    }

    fn is_failure_window_expired(&self, config: &CircuitBreakerConfig) -> bool {
        self.first_failure_at.is_none_or(|first_failure| {
            first_failure.elapsed() > Duration::from_secs(config.failure_window_secs)
        })
    }

    fn is_timeout_expired(&self, config: &CircuitBreakerConfig) -> bool {
        !self.forced
            && self.opened_at.is_some_and(|opened_at| {
                opened_at.elapsed() >= Duration::from_secs(config.timeout_secs)
            })
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.consecutive_successes = 0;
        self.trial_in_flight = false;
    }

    fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.first_failure_at = None;
        self.opened_at = None;
        self.consecutive_successes = 0;
        self.trial_in_flight = false;
        self.forced = false;
    }

    /// Returns `true` if the circuit transitioned to Open
    fn record_failure(&mut self, provider: &str, config: &CircuitBreakerConfig) -> bool {
        self.last_failure_at = Some(Utc::now());

        match self.state {
            CircuitState::Closed => {
                if self.is_failure_window_expired(config) {
                    self.failure_count = 0;
                    self.first_failure_at = None;
                }

                if self.first_failure_at.is_none() {
                    self.first_failure_at = Some(Instant::now());
                }
                self.failure_count += 1;

                if self.failure_count >= config.failure_threshold {
                    self.open();
                    tracing::warn!(
                        provider,
                        failure_count = self.failure_count,
                        threshold = config.failure_threshold,
                        timeout_secs = config.timeout_secs,
                        "Circuit breaker OPENED - provider will be skipped"
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                self.failure_count += 1;
                self.open();
                tracing::warn!(provider, "Circuit breaker trial failed - reopening circuit");
                true
            }
            CircuitState::Open => false,
        }
    }

    /// Returns `true` if the circuit transitioned to Closed
    fn record_success(&mut self, provider: &str, config: &CircuitBreakerConfig) -> bool {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.first_failure_at = None;
                false
            }
            CircuitState::HalfOpen => {
                self.trial_in_flight = false;
                self.consecutive_successes += 1;

                if self.consecutive_successes >= config.success_threshold {
                    self.reset();
                    tracing::info!(provider, "Circuit breaker CLOSED - provider recovered");
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => {
                // an attempt started before the circuit opened can still land
                tracing::debug!(provider, "Success recorded while circuit is open");
                false
            }
        }
    }

    fn release_trial(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    fn should_allow_delivery(&mut self, provider: &str, config: &CircuitBreakerConfig) -> bool {
        match self.state {
            CircuitState::Open => {
                if self.is_timeout_expired(config) {
                    self.state = CircuitState::HalfOpen;
                    self.consecutive_successes = 0;
                    self.trial_in_flight = true;
                    tracing::info!(provider, "Circuit breaker HALF-OPEN - allowing trial attempt");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    return false;
                }
                self.trial_in_flight = true;
                true
            }
            CircuitState::Closed => true,
        }
    }
}

/// Point-in-time view of one provider's circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub forced: bool,
}

/// Circuit breakers for every provider, keyed by provider name
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<parking_lot::Mutex<CircuitBreakerData>>>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn get_breaker(&self, provider: &str) -> Arc<parking_lot::Mutex<CircuitBreakerData>> {
        if let Some(breaker) = self.breakers.get(provider) {
            return Arc::clone(breaker.value());
        }

        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(parking_lot::Mutex::new(CircuitBreakerData::new())))
            .clone()
    }

    /// Whether an attempt through `provider` may proceed.
    ///
    /// Moves an open circuit whose cooldown has elapsed to half-open. A `true`
    /// from a half-open circuit claims its trial, so the caller must follow up
    /// with [`CircuitBreaker::record_success`],
    /// [`CircuitBreaker::record_failure`] or [`CircuitBreaker::release_trial`].
    pub fn should_allow_delivery(&self, provider: &str) -> bool {
        self.get_breaker(provider)
            .lock()
            .should_allow_delivery(provider, &self.config)
    }

    /// Returns `true` if the circuit closed
    pub fn record_success(&self, provider: &str) -> bool {
        self.get_breaker(provider)
            .lock()
            .record_success(provider, &self.config)
    }

    /// Returns `true` if the circuit opened
    pub fn record_failure(&self, provider: &str) -> bool {
        self.get_breaker(provider)
            .lock()
            .record_failure(provider, &self.config)
    }

    /// Give back a half-open trial whose outcome says nothing about the
    /// provider's health, such as a refusal of the message itself.
    pub fn release_trial(&self, provider: &str) {
        self.get_breaker(provider).lock().release_trial();
    }

    /// Open the circuit until [`CircuitBreaker::force_close`] is called.
    pub fn force_open(&self, provider: &str) {
        let breaker = self.get_breaker(provider);
        let mut data = breaker.lock();
        data.open();
        data.forced = true;
        drop(data);
        tracing::warn!(provider, "Circuit breaker forced OPEN");
    }

    /// Close the circuit and clear its failure history.
    pub fn force_close(&self, provider: &str) {
        self.get_breaker(provider).lock().reset();
        tracing::info!(provider, "Circuit breaker forced CLOSED");
    }

    /// Whether the next attempt would be let through, without moving an
    /// expired circuit to half-open.
    pub fn allows_traffic(&self, provider: &str) -> bool {
        let breaker = self.get_breaker(provider);
        let data = breaker.lock();
        data.state != CircuitState::Open || data.is_timeout_expired(&self.config)
    }

    pub fn state(&self, provider: &str) -> CircuitState {
        self.get_breaker(provider).lock().state
    }

    pub fn snapshot(&self, provider: &str) -> CircuitSnapshot {
        let breaker = self.get_breaker(provider);
        let data = breaker.lock();
        CircuitSnapshot {
            state: data.state,
            failure_count: data.failure_count,
            last_failure_at: data.last_failure_at,
            forced: data.forced,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn breaker(failure_threshold: u32, failure_window_secs: u64, timeout_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            failure_window_secs,
            timeout_secs,
            success_threshold: 1,
        })
    }

    #[test]
    fn test_closed_to_open() {
        let breaker = breaker(3, 60, 5);

        assert_eq!(breaker.state("primary"), CircuitState::Closed);
        assert!(breaker.should_allow_delivery("primary"));

        assert!(!breaker.record_failure("primary"));
        assert!(!breaker.record_failure("primary"));
        assert_eq!(breaker.state("primary"), CircuitState::Closed);

        assert!(breaker.record_failure("primary"));
        assert_eq!(breaker.state("primary"), CircuitState::Open);
        assert!(!breaker.should_allow_delivery("primary"));

        // circuits are independent
        assert!(breaker.should_allow_delivery("backup"));
    }

    #[test]
    fn test_half_open_success_closes() {
        let breaker = breaker(2, 60, 0);

        breaker.record_failure("primary");
        breaker.record_failure("primary");
        assert_eq!(breaker.state("primary"), CircuitState::Open);

        assert!(breaker.should_allow_delivery("primary"));
        assert_eq!(breaker.state("primary"), CircuitState::HalfOpen);

        assert!(breaker.record_success("primary"));
        assert_eq!(breaker.state("primary"), CircuitState::Closed);
        assert_eq!(breaker.snapshot("primary").failure_count, 0);
    }

    #[test]
    fn test_half_open_admits_one_trial() {
        let breaker = breaker(1, 60, 0);

        breaker.record_failure("primary");
        assert_eq!(breaker.state("primary"), CircuitState::Open);

        let admitted = (0..5)
            .filter(|_| breaker.should_allow_delivery("primary"))
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(breaker.state("primary"), CircuitState::HalfOpen);
        // readiness still counts a half-open provider as usable
        assert!(breaker.allows_traffic("primary"));
    }

    #[test]
    fn test_half_open_trial_slot_freed_by_outcome() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            failure_window_secs: 60,
            timeout_secs: 0,
            success_threshold: 2,
        });

        breaker.record_failure("primary");
        assert!(breaker.should_allow_delivery("primary"));
        assert!(!breaker.should_allow_delivery("primary"));

        // one success is not enough to close, but frees the slot for the next trial
        assert!(!breaker.record_success("primary"));
        assert_eq!(breaker.state("primary"), CircuitState::HalfOpen);
        assert!(breaker.should_allow_delivery("primary"));
        assert!(!breaker.should_allow_delivery("primary"));

        assert!(breaker.record_success("primary"));
        assert_eq!(breaker.state("primary"), CircuitState::Closed);
        assert!(breaker.should_allow_delivery("primary"));
        assert!(breaker.should_allow_delivery("primary"));
    }

    #[test]
    fn test_released_trial_stays_half_open() {
        let breaker = breaker(1, 60, 0);

        breaker.record_failure("primary");
        assert!(breaker.should_allow_delivery("primary"));
        assert!(!breaker.should_allow_delivery("primary"));

        breaker.release_trial("primary");
        assert_eq!(breaker.state("primary"), CircuitState::HalfOpen);
        assert!(breaker.should_allow_delivery("primary"));

        // no effect outside half-open
        breaker.force_close("primary");
        breaker.release_trial("primary");
        assert_eq!(breaker.state("primary"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker(2, 60, 0);

        breaker.record_failure("primary");
        breaker.record_failure("primary");
        assert!(breaker.should_allow_delivery("primary"));

        assert!(breaker.record_failure("primary"));
        assert_eq!(breaker.state("primary"), CircuitState::Open);
    }

    #[test]
    fn test_failure_window_expiry() {
        let breaker = breaker(3, 1, 5);

        breaker.record_failure("primary");
        breaker.record_failure("primary");

        std::thread::sleep(Duration::from_millis(1100));

        breaker.record_failure("primary");
        assert_eq!(breaker.state("primary"), CircuitState::Closed);

        breaker.record_failure("primary");
        breaker.record_failure("primary");
        assert_eq!(breaker.state("primary"), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_failures() {
        let breaker = breaker(3, 60, 5);

        breaker.record_failure("primary");
        breaker.record_failure("primary");
        breaker.record_success("primary");

        breaker.record_failure("primary");
        breaker.record_failure("primary");
        assert_eq!(breaker.state("primary"), CircuitState::Closed);
    }

    #[test]
    fn test_forced_open_ignores_cooldown() {
        let breaker = breaker(3, 60, 0);

        breaker.force_open("primary");
        assert!(!breaker.allows_traffic("primary"));
        assert!(!breaker.should_allow_delivery("primary"));
        assert_eq!(breaker.state("primary"), CircuitState::Open);
        assert!(breaker.snapshot("primary").forced);

        breaker.force_close("primary");
        assert!(breaker.allows_traffic("primary"));
        assert!(breaker.should_allow_delivery("primary"));
        assert_eq!(
            breaker.snapshot("primary"),
            CircuitSnapshot {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                forced: false,
            }
        );
    }

    #[test]
    fn test_last_failure_recorded() {
        let breaker = breaker(5, 60, 5);
        let before = Utc::now();

        breaker.record_failure("primary");

        let snapshot = breaker.snapshot("primary");
        assert_eq!(snapshot.failure_count, 1);
        assert!(snapshot.last_failure_at.is_some_and(|at| at >= before));
    }
}
