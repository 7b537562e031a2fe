//! Retry logic with exponential backoff

use std::time::Duration;

use rand::Rng;

/// Delay before the next delivery cycle, using exponential backoff with jitter
///
/// # Formula
/// `delay = min(base * 2^(cycle - 1), max_delay) * (1 ± jitter)`
///
/// `cycle` is 1-indexed: the delay after the first failed cycle is `base`.
pub fn calculate_retry_delay(
    cycle: u32,
    base_delay_secs: u64,
    max_delay_secs: u64,
    jitter_factor: f64,
) -> Duration {
    let exponent = cycle.saturating_sub(1);
    let delay = if exponent >= 63 {
        max_delay_secs
    } else {
        base_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(max_delay_secs)
    };

    let jitter_factor = jitter_factor.clamp(0.0, 1.0);
    if jitter_factor.is_nan() || jitter_factor <= 0.0 || delay == 0 {
        return Duration::from_secs(delay);
    }

    #[allow(clippy::cast_precision_loss)]
    let delay = delay as f64;
    let jitter_range = delay * jitter_factor;
    let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((delay + jitter).max(0.0))
}
