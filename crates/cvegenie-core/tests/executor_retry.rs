//! Retry and backoff behaviour of the executor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cvegenie_core::{
    Artifacts, CapabilityRegistry, DagExecutor, EventType, ExecutionPlan, MemoryResultBus,
    PlanStep, Profile, RetryPolicy, Sleeper, StepErrorKind, StepStatus,
};
use serde_json::json;

const CVE: &str = "CVE-2024-5678";

#[derive(Clone, Default)]
struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, delay: Duration) {
        self.delays.lock().unwrap().push(delay);
    }
}

/// Registry with one implementation that fails its first `failures` calls.
fn flaky(failures: u32) -> (CapabilityRegistry, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let mut registry = CapabilityRegistry::new();
    registry.register_fn("Flaky", move |_inputs: &Artifacts| -> anyhow::Result<Artifacts> {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= failures {
            anyhow::bail!("attempt {n}: service unavailable");
        }
        Ok(Artifacts::from([("out".to_string(), json!(n))]))
    });
    (registry, calls)
}

fn plan_with(policy: Option<RetryPolicy>) -> ExecutionPlan {
    let mut step = PlanStep::new("flaky", "Cap", "Flaky").outputs(["out"]);
    step.retry = policy;
    let mut plan = ExecutionPlan::new(CVE, Profile::NativeLocal);
    plan.add_step(step);
    plan
}

#[test]
fn backoff_delays_follow_the_policy() {
    let bus = Arc::new(MemoryResultBus::new(CVE));
    let (registry, calls) = flaky(4);
    let sleeper = RecordingSleeper::default();
    let policy = RetryPolicy::new(5).with_backoff(1.0, 3.0, 10.0);

    let mut executor = DagExecutor::new(plan_with(Some(policy)), bus.clone(), registry)
        .with_sleeper(sleeper.clone());
    let result = executor.execute().unwrap();

    assert_eq!(result["out"], json!(5));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(
        *sleeper.delays.lock().unwrap(),
        vec![
            Duration::from_secs(1),
            Duration::from_secs(3),
            Duration::from_secs(9),
            Duration::from_secs(10),
        ]
    );

    let retries = bus.events_of(&EventType::StepRetry);
    assert_eq!(retries.len(), 4);
    assert_eq!(retries[0].data["attempt"], 1);
    assert_eq!(retries[0].data["max"], 5);
    assert_eq!(retries[2].data["delay"], 9.0);
    assert_eq!(executor.step_records()[0].attempts, 5);
}

#[test]
fn step_retry_precedes_each_reinvocation() {
    let bus = Arc::new(MemoryResultBus::new(CVE));
    let (registry, _calls) = flaky(1);
    let policy = RetryPolicy::new(2).with_backoff(0.0, 2.0, 1.0);

    DagExecutor::new(plan_with(Some(policy)), bus.clone(), registry)
        .with_sleeper(RecordingSleeper::default())
        .execute()
        .unwrap();

    let step_events: Vec<EventType> = bus
        .event_types()
        .into_iter()
        .filter(|t| {
            matches!(
                t,
                EventType::StepStart
                    | EventType::StepFailed
                    | EventType::StepRetry
                    | EventType::StepComplete
            )
        })
        .collect();
    assert_eq!(
        step_events,
        vec![
            EventType::StepStart,
            EventType::StepFailed,
            EventType::StepRetry,
            EventType::StepStart,
            EventType::StepComplete,
        ]
    );
}

#[test]
fn exhaustion_invokes_n_plus_one_times() {
    let bus = Arc::new(MemoryResultBus::new(CVE));
    let (registry, calls) = flaky(u32::MAX);
    let sleeper = RecordingSleeper::default();

    let mut executor = DagExecutor::new(
        plan_with(Some(RetryPolicy::new(3).with_backoff(0.5, 2.0, 60.0))),
        bus.clone(),
        registry,
    )
    .with_sleeper(sleeper.clone());
    let err = executor.execute().unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let step = err.step_error().unwrap();
    assert_eq!(step.attempts, 4);
    assert_eq!(step.kind, StepErrorKind::CapabilityFailed);
    assert!(!step.retryable);
    assert!(step.message.contains("attempt 4"));
    assert_eq!(sleeper.delays.lock().unwrap().len(), 3);
    assert_eq!(bus.events_of(&EventType::StepFailed).len(), 4);
    assert_eq!(bus.events_of(&EventType::PlanFailed).len(), 1);
    assert_eq!(executor.step_records()[0].status, StepStatus::Failed);
}

#[test]
fn disabled_policies_never_retry() {
    for policy in [None, Some(RetryPolicy::new(0)), Some(RetryPolicy::new(-2))] {
        let bus = Arc::new(MemoryResultBus::new(CVE));
        let (registry, calls) = flaky(1);
        let sleeper = RecordingSleeper::default();

        let err = DagExecutor::new(plan_with(policy), bus.clone(), registry)
            .with_sleeper(sleeper.clone())
            .execute()
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.step_error().unwrap().attempts, 1);
        assert!(sleeper.delays.lock().unwrap().is_empty());
        assert!(bus.events_of(&EventType::StepRetry).is_empty());
    }
}

#[test]
fn failed_success_condition_is_retried() {
    let bus = Arc::new(MemoryResultBus::new(CVE));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let mut registry = CapabilityRegistry::new();
    registry.register_fn("Verifier", move |_inputs: &Artifacts| -> anyhow::Result<Artifacts> {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Artifacts::from([(
            "verification".to_string(),
            json!({"passed": n >= 2}),
        )]))
    });
    let mut plan = ExecutionPlan::new(CVE, Profile::Freestyle);
    plan.add_step(
        PlanStep::new("verify", "Verifier", "Verifier")
            .outputs(["verification"])
            .success_condition("verification.passed == true")
            .retry(RetryPolicy::new(2).with_backoff(0.0, 1.0, 0.0)),
    );

    let result = DagExecutor::new(plan, bus, registry)
        .with_sleeper(RecordingSleeper::default())
        .execute()
        .unwrap();
    assert_eq!(result["verification"], json!({"passed": true}));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn real_sleeper_waits_between_attempts() {
    let bus = Arc::new(MemoryResultBus::new(CVE));
    let (registry, calls) = flaky(2);
    let policy = RetryPolicy::new(2).with_backoff(0.05, 2.0, 1.0);

    let started = Instant::now();
    DagExecutor::new(plan_with(Some(policy)), bus, registry)
        .execute()
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 0.05s + 0.10s of backoff.
    assert!(elapsed >= Duration::from_millis(150), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "elapsed {elapsed:?}");
}
