//! Structured observability hooks for plan execution.
//!
//! This module provides:
//! - Plan-scoped tracing spans via `PlanSpan` RAII guard
//! - Emission functions for lifecycle events: plan start/finish, step
//!   finish, retry and skip
//!
//! Events are emitted at `info!` level; degraded paths at `warn!`.
//! Filtering follows `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use std::time::Duration;

use tracing::{info, warn};

/// RAII guard that enters a plan-scoped span for the duration of a run.
///
/// # Example
///
/// ```ignore
/// let _span = PlanSpan::enter("4f1c...", "CVE-2024-1234");
/// // every tracing call now carries run_id and cve_id
/// ```
pub struct PlanSpan {
    _span: tracing::span::EnteredSpan,
}

impl PlanSpan {
    pub fn enter(run_id: &str, cve_id: &str) -> Self {
        let span = tracing::info_span!("cvegenie.plan", run_id = %run_id, cve_id = %cve_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: plan execution started.
pub fn emit_plan_started(run_id: &str, profile: &str, steps: usize, digest: &str) {
    info!(
        event = "plan.started",
        run_id = %run_id,
        profile = %profile,
        steps = steps,
        digest = %digest,
    );
}

/// Emit event: plan finished, successfully or not.
pub fn emit_plan_finished(run_id: &str, duration_ms: u64, steps_run: usize, success: bool) {
    info!(
        event = "plan.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        steps_run = steps_run,
        success = success,
    );
}

/// Emit event: a step reached a terminal state.
pub fn emit_step_finished(
    step_id: &str,
    implementation: &str,
    attempts: u32,
    duration_ms: u64,
    success: bool,
) {
    info!(
        event = "step.finished",
        step_id = %step_id,
        implementation = %implementation,
        attempts = attempts,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: a step is about to be retried.
pub fn emit_step_retry(step_id: &str, retry: u32, max: u32, delay: Duration, error: &str) {
    warn!(
        event = "step.retry",
        step_id = %step_id,
        retry = retry,
        max = max,
        delay_ms = saturating_millis(delay),
        error = %error,
    );
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Emit event: a step's guard prevented it from running.
pub fn emit_step_skipped(step_id: &str, reason: &str) {
    info!(event = "step.skipped", step_id = %step_id, reason = %reason);
}

/// Emit event: an auto-switch replaced the step's implementation.
pub fn emit_implementation_switched(step_id: &str, from: &str, to: &str) {
    info!(event = "step.implementation_switched", step_id = %step_id, from = %from, to = %to);
}
