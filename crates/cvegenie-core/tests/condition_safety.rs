//! Success conditions come from plan files, so they are untrusted input.
//! Anything outside the comparison grammar must fail the step, never run.

use std::sync::Arc;

use cvegenie_core::executor::condition::{evaluate, is_satisfied};
use cvegenie_core::{
    Artifacts, CapabilityRegistry, Condition, ConditionError, DagExecutor, EventType,
    ExecutionPlan, ExecutorResult, MemoryResultBus, PlanStep, Profile, StepErrorKind,
};
use serde_json::json;

const CVE: &str = "CVE-2023-9999";

fn verification_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register_fn("Verifier", |_inputs: &Artifacts| -> anyhow::Result<Artifacts> {
        Ok(Artifacts::from([(
            "verification".to_string(),
            json!({"passed": true, "http_code": 200, "body": "uid=0(root)"}),
        )]))
    });
    registry
}

fn run_with_condition(expr: &str) -> (Arc<MemoryResultBus>, ExecutorResult<Artifacts>) {
    let bus = Arc::new(MemoryResultBus::new(CVE));
    let mut plan = ExecutionPlan::new(CVE, Profile::WebBasic);
    plan.add_step(
        PlanStep::new("verify", "ExploitVerifier", "Verifier")
            .outputs(["verification"])
            .success_condition(expr),
    );
    let result = DagExecutor::new(plan, bus.clone(), verification_registry()).execute();
    (bus, result)
}

#[test]
fn injection_attempts_fail_the_step() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("pwned");
    let touch = format!("__import__('os').system('touch {}')", marker.display());

    for expr in [
        touch.as_str(),
        "open('/etc/passwd').read() != ''",
        "verification.__class__ == 1",
        "(verification).passed",
        "\"s\".upper == 'S'",
        "(lambda: True)",
        "verification.http_code + 0 == 200",
        "verification is not None",
        "[c for c in verification]",
        "globals()['x']",
        "exec('1')",
    ] {
        let (bus, result) = run_with_condition(expr);
        let err = result.unwrap_err();
        let step = err.step_error().unwrap_or_else(|| panic!("{expr}: {err}"));
        assert_eq!(step.kind, StepErrorKind::SuccessConditionFailed, "{expr}");
        assert!(bus.events_of(&EventType::StepComplete).is_empty(), "{expr}");
        assert_eq!(bus.events_of(&EventType::PlanFailed).len(), 1, "{expr}");
    }

    assert!(!marker.exists());
}

#[test]
fn dunder_names_are_plain_lookups() {
    // Not disallowed syntactically, just an unknown name.
    let out = Artifacts::from([("x".to_string(), json!(1))]);
    assert!(matches!(
        evaluate("__builtins__ == 1", &out),
        Err(ConditionError::Eval { .. })
    ));
    assert!(!is_satisfied("__builtins__ == 1", &out));
}

#[test]
fn grammar_violations_are_reported_by_family() {
    let cases: [(&str, fn(&ConditionError) -> bool); 6] = [
        ("len(x)", |e| matches!(e, ConditionError::Disallowed { .. })),
        ("x * 2", |e| matches!(e, ConditionError::Disallowed { .. })),
        ("x if y else z", |e| matches!(e, ConditionError::Disallowed { .. })),
        ("x == ", |e| matches!(e, ConditionError::Parse { .. })),
        ("x $ y", |e| matches!(e, ConditionError::Lex { .. })),
        ("\"unterminated", |e| matches!(e, ConditionError::Lex { .. })),
    ];
    for (expr, expected) in cases {
        let err = Condition::parse(expr).unwrap_err();
        assert!(expected(&err), "{expr}: {err:?}");
    }
}

#[test]
fn well_formed_conditions_pass_the_step() {
    for expr in [
        "verification.passed == true",
        "verification.passed == True and verification.http_code == 200",
        "verification.http_code in [200, 301, 302]",
        "'root' in verification.body",
        "not verification.http_code >= 500",
        "verification['passed']",
        "200 <= verification.http_code < 300",
    ] {
        let (bus, result) = run_with_condition(expr);
        assert!(result.is_ok(), "{expr}: {:?}", result.err());
        assert_eq!(bus.events_of(&EventType::PlanComplete).len(), 1, "{expr}");
    }
}

#[test]
fn evaluation_errors_fail_closed() {
    for expr in [
        "verification.missing == true",
        "verification.body > 3",
        "verification.http_code.0 == 2",
        "nothing",
    ] {
        let (_bus, result) = run_with_condition(expr);
        let err = result.unwrap_err();
        assert_eq!(
            err.step_error().map(|s| s.kind),
            Some(StepErrorKind::SuccessConditionFailed),
            "{expr}"
        );
    }
}
