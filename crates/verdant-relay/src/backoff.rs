//! Retry delay computation.

use std::time::Duration;

use rand::Rng;

/// Exponential ceiling for the given attempt, capped at `max`.
pub fn backoff_ceiling(attempt: u32, base: Duration, max: Duration) -> Duration {
    // Saturate instead of overflowing for large attempt numbers
    let factor = 2u64.saturating_pow(attempt.min(32));
    let millis = (base.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis).min(max)
}

/// Full-jitter retry delay: uniform over `(0, ceiling]`.
///
/// Jitter spreads redeliveries from many queued items so they do not
/// hammer a recovering upstream in lockstep.
pub fn retry_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let ceiling = backoff_ceiling(attempt, base, max).as_millis() as u64;
    if ceiling == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(1..=ceiling))
}
