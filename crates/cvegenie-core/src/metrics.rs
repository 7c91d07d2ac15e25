//! Global atomic counters for executor observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a plan).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    steps_executed: AtomicU64,
    steps_skipped: AtomicU64,
    steps_retried: AtomicU64,
    steps_failed: AtomicU64,
    plans_completed: AtomicU64,
    plans_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            steps_executed: AtomicU64::new(0),
            steps_skipped: AtomicU64::new(0),
            steps_retried: AtomicU64::new(0),
            steps_failed: AtomicU64::new(0),
            plans_completed: AtomicU64::new(0),
            plans_failed: AtomicU64::new(0),
        }
    }

    /// A step completed (including after retries).
    pub fn inc_steps_executed(&self) {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "steps_executed", "counter incremented");
    }

    pub fn inc_steps_skipped(&self) {
        self.steps_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "steps_skipped", "counter incremented");
    }

    /// One retry attempt was scheduled.
    pub fn inc_steps_retried(&self) {
        self.steps_retried.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "steps_retried", "counter incremented");
    }

    pub fn inc_steps_failed(&self) {
        self.steps_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "steps_failed", "counter incremented");
    }

    pub fn inc_plans_completed(&self) {
        self.plans_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "plans_completed", "counter incremented");
    }

    pub fn inc_plans_failed(&self) {
        self.plans_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "plans_failed", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            steps_executed = self.steps_executed(),
            steps_skipped = self.steps_skipped(),
            steps_retried = self.steps_retried(),
            steps_failed = self.steps_failed(),
            plans_completed = self.plans_completed(),
            plans_failed = self.plans_failed(),
        );
    }

    pub fn steps_executed(&self) -> u64 {
        self.steps_executed.load(Ordering::Relaxed)
    }

    pub fn steps_skipped(&self) -> u64 {
        self.steps_skipped.load(Ordering::Relaxed)
    }

    pub fn steps_retried(&self) -> u64 {
        self.steps_retried.load(Ordering::Relaxed)
    }

    pub fn steps_failed(&self) -> u64 {
        self.steps_failed.load(Ordering::Relaxed)
    }

    pub fn plans_completed(&self) -> u64 {
        self.plans_completed.load(Ordering::Relaxed)
    }

    pub fn plans_failed(&self) -> u64 {
        self.plans_failed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.steps_executed,
            &self.steps_skipped,
            &self.steps_retried,
            &self.steps_failed,
            &self.plans_completed,
            &self.plans_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_steps_executed();
        m.inc_steps_executed();
        m.inc_steps_retried();
        m.inc_plans_failed();
        assert_eq!(m.steps_executed(), 2);
        assert_eq!(m.steps_retried(), 1);
        assert_eq!(m.plans_failed(), 1);
        assert_eq!(m.steps_skipped(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_steps_skipped();
        m.inc_steps_failed();
        m.inc_plans_completed();
        m.reset();
        assert_eq!(m.steps_skipped(), 0);
        assert_eq!(m.steps_failed(), 0);
        assert_eq!(m.plans_completed(), 0);
    }
}
