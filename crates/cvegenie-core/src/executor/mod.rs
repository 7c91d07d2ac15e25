//! DAG executor: runs an [`ExecutionPlan`] step by step against a
//! [`CapabilityRegistry`], writing every trace through a [`ResultBus`].
//!
//! One executor handles one plan and one `execute()` call:
//!
//! 1. Topologically sort the steps (duplicates, unknown requirements and
//!    cycles abort before any capability runs).
//! 2. For each step in order: evaluate the `!artifacts.NAME` guard, resolve
//!    the implementation, gather inputs, invoke, persist declared outputs,
//!    handle an `execution_analysis` signal, check the success condition.
//! 3. Failures are retried with exponential backoff when the step declares a
//!    retry policy; otherwise (or once retries are exhausted) the plan aborts.
//!
//! Execution is sequential and synchronous. Sleeping between retries goes
//! through an injectable [`Sleeper`].

pub mod condition;
pub mod error;
pub mod retry;
pub mod schedule;

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use cvegenie_bus::{ArtifactContent, EventType, ResultBus};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::{Artifacts, CapabilityFactory, CapabilityRegistry};
use crate::metrics::METRICS;
use crate::obs::{self, PlanSpan};
use crate::plan::{ExecutionPlan, PlanStep};

pub use error::{ExecutorError, ExecutorResult, StepError, StepErrorKind};
pub use retry::{delay_for, Sleeper, ThreadSleeper};

/// Name of the side artifact and event carrying a capability's self-analysis.
pub const EXECUTION_ANALYSIS: &str = "execution_analysis";

/// Terminal state of a processed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Skipped,
    Failed,
}

/// What happened to one step during `execute()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step_id: String,
    pub status: StepStatus,
    /// Implementation that produced the final outcome (after any switch).
    pub implementation: String,
    pub attempts: u32,
    pub duration_ms: u64,
    /// Declared outputs present in the runtime map after the step.
    pub outputs: Vec<String>,
    pub error: Option<String>,
}

/// Successful outcome of the step logic.
struct StepSuccess {
    implementation: String,
    attempts: u32,
}

/// Sequential plan executor.
pub struct DagExecutor {
    plan: ExecutionPlan,
    bus: Arc<dyn ResultBus>,
    registry: CapabilityRegistry,
    sleeper: Box<dyn Sleeper>,
    artifacts: Artifacts,
    records: Vec<StepRecord>,
    run_id: Uuid,
    executed: bool,
}

impl DagExecutor {
    pub fn new(plan: ExecutionPlan, bus: Arc<dyn ResultBus>, registry: CapabilityRegistry) -> Self {
        Self {
            plan,
            bus,
            registry,
            sleeper: Box::new(ThreadSleeper),
            artifacts: Artifacts::new(),
            records: Vec::new(),
            run_id: Uuid::new_v4(),
            executed: false,
        }
    }

    /// Load a persisted plan and build an executor for it.
    pub fn from_plan_file(
        path: impl AsRef<Path>,
        bus: Arc<dyn ResultBus>,
        registry: CapabilityRegistry,
    ) -> ExecutorResult<Self> {
        let plan = ExecutionPlan::load(path)?;
        Ok(Self::new(plan, bus, registry))
    }

    /// Pre-populate the runtime artifact map (e.g. `cve_id`, `cve_entry`).
    pub fn with_seed_artifacts(mut self, seeds: Artifacts) -> Self {
        self.artifacts.extend(seeds);
        self
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Runtime artifact map, including anything produced before a failure.
    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    /// One record per processed step, in execution order.
    pub fn step_records(&self) -> &[StepRecord] {
        &self.records
    }

    /// Run the plan to completion or to the first non-recoverable failure.
    pub fn execute(&mut self) -> ExecutorResult<Artifacts> {
        if self.executed {
            return Err(ExecutorError::AlreadyExecuted);
        }
        self.executed = true;

        let run_id = self.run_id.to_string();
        let _span = PlanSpan::enter(&run_id, &self.plan.cve_id);
        let started = Instant::now();

        let order = match schedule::topological_order(&self.plan.steps) {
            Ok(order) => order,
            Err(e) => {
                let err = ExecutorError::from(e);
                self.fail_plan(&run_id, started, None, &err);
                return Err(err);
            }
        };

        let digest = self.plan.digest().unwrap_or_else(|e| {
            warn!(error = %e, "could not compute plan digest");
            String::new()
        });
        self.bus.publish_event(
            EventType::PlanStart,
            None,
            json!({
                "profile": self.plan.profile.as_str(),
                "run_id": run_id,
                "digest": digest,
                "steps": self.plan.step_ids(),
            }),
        );
        obs::emit_plan_started(&run_id, self.plan.profile.as_str(), order.len(), &digest);

        for idx in order {
            let step = self.plan.steps[idx].clone();

            if let Some(reason) = self.skip_reason(&step) {
                self.bus
                    .publish_event(EventType::StepSkipped, Some(&step.id), json!({ "reason": reason }));
                METRICS.inc_steps_skipped();
                obs::emit_step_skipped(&step.id, &reason);
                self.records.push(StepRecord {
                    step_id: step.id.clone(),
                    status: StepStatus::Skipped,
                    implementation: step.implementation.clone(),
                    attempts: 0,
                    duration_ms: 0,
                    outputs: Vec::new(),
                    error: None,
                });
                continue;
            }

            let step_started = Instant::now();
            let outcome = self.run_step(&step, true);
            let duration_ms = elapsed_ms(step_started);
            let outputs = self.present_outputs(&step);

            match outcome {
                Ok(success) => {
                    METRICS.inc_steps_executed();
                    obs::emit_step_finished(
                        &step.id,
                        &success.implementation,
                        success.attempts,
                        duration_ms,
                        true,
                    );
                    self.records.push(StepRecord {
                        step_id: step.id.clone(),
                        status: StepStatus::Completed,
                        implementation: success.implementation,
                        attempts: success.attempts,
                        duration_ms,
                        outputs,
                        error: None,
                    });
                }
                Err(step_err) => {
                    METRICS.inc_steps_failed();
                    obs::emit_step_finished(
                        &step.id,
                        &step.implementation,
                        step_err.attempts,
                        duration_ms,
                        false,
                    );
                    self.records.push(StepRecord {
                        step_id: step.id.clone(),
                        status: StepStatus::Failed,
                        implementation: step.implementation.clone(),
                        attempts: step_err.attempts,
                        duration_ms,
                        outputs,
                        error: Some(step_err.message.clone()),
                    });
                    let err = ExecutorError::from(step_err);
                    self.fail_plan(&run_id, started, Some(&step.id), &err);
                    return Err(err);
                }
            }
        }

        let names: Vec<&str> = self.artifacts.keys().map(String::as_str).collect();
        self.bus
            .publish_event(EventType::PlanComplete, None, json!({ "artifacts": names }));
        METRICS.inc_plans_completed();
        obs::emit_plan_finished(&run_id, elapsed_ms(started), self.records.len(), true);
        METRICS.flush();
        info!(cve_id = %self.plan.cve_id, artifacts = self.artifacts.len(), "plan completed");

        Ok(self.artifacts.clone())
    }

    fn fail_plan(&self, run_id: &str, started: Instant, step_id: Option<&str>, err: &ExecutorError) {
        let diagnosis = err.diagnosis();
        self.bus.publish_event(
            EventType::PlanFailed,
            step_id,
            json!({
                "error": err.to_string(),
                "failure_code": diagnosis.failure_code,
                "recoverable": diagnosis.recoverable,
            }),
        );
        METRICS.inc_plans_failed();
        obs::emit_plan_finished(run_id, elapsed_ms(started), self.records.len(), false);
        METRICS.flush();
        warn!(
            cve_id = %self.plan.cve_id,
            failure_code = %diagnosis.failure_code,
            error = %err,
            "plan failed"
        );
    }

    /// Reason to skip `step`, if its guard says so.
    fn skip_reason(&self, step: &PlanStep) -> Option<String> {
        let guard = step.condition.as_deref()?;
        match step.absent_artifact_guard() {
            Some(name) if self.artifacts.contains_key(name) => {
                Some(format!("artifact {name} already present"))
            }
            Some(_) => None,
            None => {
                warn!(step_id = %step.id, guard = %guard, "unsupported step guard, proceeding");
                None
            }
        }
    }

    fn present_outputs(&self, step: &PlanStep) -> Vec<String> {
        step.outputs
            .iter()
            .filter(|name| self.artifacts.contains_key(name.as_str()))
            .cloned()
            .collect()
    }

    /// Step logic plus the retry loop. Nested calls pass `allow_retry = false`
    /// so a retry never starts another retry loop.
    fn run_step(&mut self, step: &PlanStep, allow_retry: bool) -> Result<StepSuccess, StepError> {
        let failure = match self.attempt(step) {
            Ok(success) => return Ok(success),
            Err(failure) => failure,
        };

        self.bus.publish_event(
            EventType::StepFailed,
            Some(&step.id),
            json!({ "error": failure.message, "kind": failure.kind }),
        );

        let policy = match step.retry.as_ref() {
            Some(policy) if policy.retries() > 0 => policy,
            _ => return Err(failure),
        };
        if !allow_retry || failure.kind == StepErrorKind::ImplementationNotFound {
            return Err(failure);
        }

        let max = policy.retries();
        let mut last = failure;
        for retry in 1..=max {
            let delay = delay_for(policy, retry);
            self.bus.publish_event(
                EventType::StepRetry,
                Some(&step.id),
                json!({
                    "attempt": retry,
                    "max": max,
                    "delay": delay.as_secs_f64(),
                    "error": last.message,
                }),
            );
            METRICS.inc_steps_retried();
            obs::emit_step_retry(&step.id, retry, max, delay, &last.message);
            self.sleeper.sleep(delay);

            match self.run_step(step, false) {
                Ok(success) => {
                    return Ok(StepSuccess {
                        attempts: retry + 1,
                        ..success
                    })
                }
                Err(e) => last = e,
            }
        }

        Err(StepError::new(&step.id, last.kind, last.message, max + 1))
    }

    /// One invocation of a step, no retries.
    fn attempt(&mut self, step: &PlanStep) -> Result<StepSuccess, StepError> {
        self.bus.publish_event(
            EventType::StepStart,
            Some(&step.id),
            json!({ "capability": step.capability, "implementation": step.implementation }),
        );

        let factory = self.registry.get(&step.implementation).ok_or_else(|| {
            StepError::new(
                &step.id,
                StepErrorKind::ImplementationNotFound,
                format!(
                    "implementation {} for capability {} is not registered",
                    step.implementation, step.capability
                ),
                1,
            )
        })?;

        let inputs: Artifacts = step
            .inputs
            .iter()
            .map(|name| {
                let value = self.artifacts.get(name).cloned().unwrap_or(Value::Null);
                (name.clone(), value)
            })
            .collect();

        let mut implementation = step.implementation.clone();
        let mut outputs = self.invoke(&factory, step, &inputs)?;
        self.persist_outputs(step, &outputs)?;

        if let Some(analysis) = find_execution_analysis(step, &outputs) {
            self.publish_analysis(step, &analysis);
            if let Some(target) = self.switch_target(step, &analysis) {
                info!(step_id = %step.id, from = %implementation, to = %target, "switching implementation");
                self.bus.publish_event(
                    EventType::ImplementationSwitched,
                    Some(&step.id),
                    json!({ "from": implementation, "to": target }),
                );
                obs::emit_implementation_switched(&step.id, &implementation, &target);

                let factory = self.registry.get(&target).ok_or_else(|| {
                    StepError::new(
                        &step.id,
                        StepErrorKind::ImplementationNotFound,
                        format!("implementation {target} is not registered"),
                        1,
                    )
                })?;
                for name in &step.outputs {
                    self.artifacts.remove(name);
                }
                outputs = self.invoke(&factory, step, &inputs)?;
                self.persist_outputs(step, &outputs)?;
                implementation = target;
            }
        }

        if let Some(expr) = step.success_condition.as_deref() {
            if !condition::is_satisfied(expr, &outputs) {
                return Err(StepError::new(
                    &step.id,
                    StepErrorKind::SuccessConditionFailed,
                    format!("success condition not met: {expr}"),
                    1,
                ));
            }
        }

        let stored: Vec<&str> = step
            .outputs
            .iter()
            .filter(|name| outputs.contains_key(name.as_str()))
            .map(String::as_str)
            .collect();
        self.bus.publish_event(
            EventType::StepComplete,
            Some(&step.id),
            json!({ "outputs": stored, "implementation": implementation }),
        );
        debug!(step_id = %step.id, outputs = ?stored, "step complete");

        Ok(StepSuccess {
            implementation,
            attempts: 1,
        })
    }

    fn invoke(
        &self,
        factory: &CapabilityFactory,
        step: &PlanStep,
        inputs: &Artifacts,
    ) -> Result<Artifacts, StepError> {
        let bus = Arc::clone(&self.bus);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut capability = factory(bus, &step.config);
            capability.execute(inputs)
        }));
        let message = match result {
            Ok(Ok(outputs)) => return Ok(outputs),
            Ok(Err(e)) => format!("{e:#}"),
            Err(payload) => format!("capability panicked: {}", panic_message(payload.as_ref())),
        };
        Err(StepError::new(&step.id, StepErrorKind::CapabilityFailed, message, 1))
    }

    /// Store each declared output present in `outputs` in the runtime map and
    /// on the bus.
    fn persist_outputs(&mut self, step: &PlanStep, outputs: &Artifacts) -> Result<(), StepError> {
        for name in &step.outputs {
            let Some(value) = outputs.get(name) else {
                debug!(step_id = %step.id, artifact = %name, "declared output not produced");
                continue;
            };
            self.artifacts.insert(name.clone(), value.clone());
            self.bus
                .store_artifact(&step.id, name, &ArtifactContent::Json(value.clone()))
                .map_err(|e| {
                    StepError::new(
                        &step.id,
                        StepErrorKind::CapabilityFailed,
                        format!("failed to persist artifact {name}: {e}"),
                        1,
                    )
                })?;
        }
        Ok(())
    }

    fn publish_analysis(&self, step: &PlanStep, analysis: &Value) {
        if let Err(e) = self.bus.store_artifact(
            &step.id,
            EXECUTION_ANALYSIS,
            &ArtifactContent::Json(analysis.clone()),
        ) {
            warn!(step_id = %step.id, error = %e, "could not store execution analysis");
        }
        self.bus
            .publish_event(EventType::ExecutionAnalysis, Some(&step.id), analysis.clone());
    }

    /// Implementation to switch to, when the step opted in and the analysis
    /// names a different registered one.
    fn switch_target(&self, step: &PlanStep, analysis: &Value) -> Option<String> {
        if step.config.get("auto_switch") != Some(&Value::Bool(true)) {
            return None;
        }
        let suggested = analysis
            .get("suggested_implementation")
            .or_else(|| analysis.get("suggested_agent"))
            .and_then(Value::as_str)?;
        if suggested == step.implementation {
            return None;
        }
        if !self.registry.contains(suggested) {
            warn!(step_id = %step.id, suggested = %suggested, "suggested implementation is not registered");
            return None;
        }
        Some(suggested.to_string())
    }
}

/// `execution_analysis` object at the top level of the outputs, or embedded
/// in one of the step's declared outputs.
fn find_execution_analysis(step: &PlanStep, outputs: &Artifacts) -> Option<Value> {
    if let Some(analysis) = outputs.get(EXECUTION_ANALYSIS).filter(|v| v.is_object()) {
        return Some(analysis.clone());
    }
    step.outputs
        .iter()
        .filter_map(|name| outputs.get(name))
        .filter_map(|value| value.get(EXECUTION_ANALYSIS))
        .find(|v| v.is_object())
        .cloned()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    obs::saturating_millis(started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Profile, RetryPolicy};
    use cvegenie_bus::MemoryResultBus;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct RecordingSleeper(Arc<Mutex<Vec<Duration>>>);

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, delay: Duration) {
            self.0.lock().unwrap().push(delay);
        }
    }

    fn single_step_plan(step: PlanStep) -> ExecutionPlan {
        let mut plan = ExecutionPlan::new("CVE-2024-0001", Profile::NativeLocal);
        plan.add_step(step);
        plan
    }

    #[test]
    fn test_execute_twice_is_rejected() {
        let bus = Arc::new(MemoryResultBus::new("CVE-2024-0001"));
        let plan = ExecutionPlan::new("CVE-2024-0001", Profile::NativeLocal);
        let mut executor = DagExecutor::new(plan, bus, CapabilityRegistry::new());
        assert!(executor.execute().unwrap().is_empty());
        assert!(matches!(
            executor.execute(),
            Err(ExecutorError::AlreadyExecuted)
        ));
    }

    #[test]
    fn test_missing_implementation_is_not_retried() {
        let bus = Arc::new(MemoryResultBus::new("CVE-2024-0001"));
        let sleeper = RecordingSleeper::default();
        let plan = single_step_plan(
            PlanStep::new("build", "EnvironmentProvisioner", "Missing").retry(RetryPolicy::new(3)),
        );
        let mut executor = DagExecutor::new(plan, bus.clone(), CapabilityRegistry::new())
            .with_sleeper(sleeper.clone());

        let err = executor.execute().unwrap_err();
        let step = err.step_error().unwrap();
        assert_eq!(step.kind, StepErrorKind::ImplementationNotFound);
        assert_eq!(step.attempts, 1);
        assert!(!step.retryable);
        assert!(sleeper.0.lock().unwrap().is_empty());
        assert!(bus.events_of(&EventType::StepRetry).is_empty());
        assert_eq!(bus.events_of(&EventType::PlanFailed).len(), 1);
    }

    #[test]
    fn test_retry_succeeds_after_failures() {
        let bus = Arc::new(MemoryResultBus::new("CVE-2024-0001"));
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        let mut registry = CapabilityRegistry::new();
        registry.register_fn("Flaky", move |_inputs: &Artifacts| -> anyhow::Result<Artifacts> {
            let mut n = counter.lock().unwrap();
            *n += 1;
            if *n < 3 {
                anyhow::bail!("connection refused");
            }
            Ok(Artifacts::from([("out".to_string(), json!(true))]))
        });
        let sleeper = RecordingSleeper::default();
        let plan = single_step_plan(
            PlanStep::new("s", "Cap", "Flaky")
                .outputs(["out"])
                .retry(RetryPolicy::new(4).with_backoff(0.5, 2.0, 10.0)),
        );
        let mut executor =
            DagExecutor::new(plan, bus.clone(), registry).with_sleeper(sleeper.clone());

        let artifacts = executor.execute().unwrap();
        assert_eq!(artifacts["out"], json!(true));
        assert_eq!(*calls.lock().unwrap(), 3);
        assert_eq!(
            *sleeper.0.lock().unwrap(),
            vec![Duration::from_millis(500), Duration::from_secs(1)]
        );
        let record = &executor.step_records()[0];
        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.attempts, 3);
        assert_eq!(bus.events_of(&EventType::StepRetry).len(), 2);
        assert_eq!(bus.events_of(&EventType::StepFailed).len(), 2);
    }

    #[test]
    fn test_panicking_capability_becomes_step_error() {
        let bus = Arc::new(MemoryResultBus::new("CVE-2024-0001"));
        let mut registry = CapabilityRegistry::new();
        registry.register_fn("Boom", |_inputs: &Artifacts| -> anyhow::Result<Artifacts> {
            panic!("exploded");
        });
        let plan = single_step_plan(PlanStep::new("s", "Cap", "Boom"));
        let mut executor = DagExecutor::new(plan, bus, registry);

        let err = executor.execute().unwrap_err();
        let step = err.step_error().unwrap();
        assert_eq!(step.kind, StepErrorKind::CapabilityFailed);
        assert!(step.message.contains("exploded"));
    }

    #[test]
    fn test_unsupported_guard_proceeds() {
        let bus = Arc::new(MemoryResultBus::new("CVE-2024-0001"));
        let mut registry = CapabilityRegistry::new();
        registry.register_fn("Impl", |_inputs: &Artifacts| -> anyhow::Result<Artifacts> {
            Ok(Artifacts::from([("x".to_string(), json!(1))]))
        });
        let plan = single_step_plan(
            PlanStep::new("s", "Cap", "Impl")
                .outputs(["x"])
                .condition("artifacts.x is None"),
        );
        let mut executor = DagExecutor::new(plan, bus.clone(), registry);
        executor.execute().unwrap();
        assert!(bus.events_of(&EventType::StepSkipped).is_empty());
        assert_eq!(bus.events_of(&EventType::StepComplete).len(), 1);
    }

    #[test]
    fn test_analysis_embedded_in_declared_output() {
        let outputs = Artifacts::from([(
            "report".to_string(),
            json!({ "ok": true, "execution_analysis": { "suggested_agent": "B" } }),
        )]);
        let step = PlanStep::new("s", "Cap", "A").outputs(["report"]);
        let found = find_execution_analysis(&step, &outputs).unwrap();
        assert_eq!(found["suggested_agent"], "B");

        let undeclared = PlanStep::new("s", "Cap", "A").outputs(["other"]);
        assert!(find_execution_analysis(&undeclared, &outputs).is_none());
    }
}
