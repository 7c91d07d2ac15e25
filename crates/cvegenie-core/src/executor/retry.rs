//! Retry backoff and the injectable sleep used between attempts.

use std::time::Duration;

use crate::plan::RetryPolicy;

/// Blocking pause between retry attempts.
pub trait Sleeper: Send {
    fn sleep(&self, delay: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// Delay before retry number `retry` (1-based):
/// `min(delay * backoff_factor^(retry - 1), max_delay)`.
///
/// Overflow saturates at `max_delay`. A non-positive `delay` or `max_delay`
/// means no wait.
pub fn delay_for(policy: &RetryPolicy, retry: u32) -> Duration {
    let cap = policy.max_delay;
    let waits = cap > 0.0 && policy.delay > 0.0;
    if !waits {
        return Duration::ZERO;
    }
    let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
    let raw = policy.delay * policy.backoff_factor.powi(exponent);
    let secs = if raw.is_nan() { cap } else { raw.min(cap) };
    if secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
