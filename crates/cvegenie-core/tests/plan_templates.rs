//! Shipped YAML templates against the programmatic builder, and the persisted
//! plan format.

use cvegenie_core::{
    ArtifactKind, ClassifierDecision, ExecutionPlan, PlanBuilder, PlanError, PlanIssue,
    PlanSource, PlanStep, Profile, RetryPolicy, TemplatePlanSource,
};
use serde_json::{json, Value};

const TEMPLATE_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../templates");

fn decision(profile: Profile) -> ClassifierDecision {
    ClassifierDecision {
        cve_id: "CVE-2024-4577".into(),
        profile,
        confidence: 0.9,
        required_capabilities: vec![],
        resource_hints: Default::default(),
    }
}

#[test]
fn shipped_templates_match_builder() {
    let templates = TemplatePlanSource::from_path(TEMPLATE_DIR).unwrap();
    let builder = PlanBuilder::new();

    for profile in Profile::KNOWN {
        let d = decision(profile.clone());
        let from_template = templates.plan_for(&d).unwrap();
        let built = builder.build(&d);

        assert_eq!(from_template.step_ids(), built.step_ids(), "{profile}");
        for (t, b) in from_template.steps.iter().zip(&built.steps) {
            assert_eq!(t, b, "{profile}/{}", b.id);
        }
        let kinds = |plan: &ExecutionPlan| -> Vec<(String, ArtifactKind)> {
            plan.artifacts
                .values()
                .map(|a| (a.name.clone(), a.kind))
                .collect()
        };
        assert_eq!(kinds(&from_template), kinds(&built), "{profile}");
        assert_eq!(from_template, built, "{profile}");
        assert_eq!(
            from_template.digest().unwrap(),
            built.digest().unwrap(),
            "{profile}"
        );
    }
}

#[test]
fn template_directory_lists_profiles() {
    let templates = TemplatePlanSource::from_path(TEMPLATE_DIR).unwrap();
    assert_eq!(
        templates.profiles().unwrap(),
        vec!["cloud-config", "freestyle", "iot-firmware", "native-local", "web-basic"]
    );

    let err = templates
        .plan_for(&decision(Profile::Custom("kernel".into())))
        .unwrap_err();
    assert!(matches!(err, PlanError::SourceNotFound { ref profile, .. } if profile == "kernel"));
}

#[test]
fn shipped_templates_validate_cleanly() {
    let templates = TemplatePlanSource::from_path(TEMPLATE_DIR).unwrap();
    for profile in Profile::KNOWN {
        let plan = templates.plan_for(&decision(profile.clone())).unwrap();
        let issues = plan.validate();
        assert!(issues.is_empty(), "{profile}: {issues:?}");
    }
}

#[test]
fn persisted_plan_uses_documented_keys() {
    let mut plan = PlanBuilder::new().build(&decision(Profile::NativeLocal));
    plan.add_step(
        PlanStep::new("bonus", "ExploitExecutor", "Exploiter")
            .inputs(["cve_info"])
            .outputs(["exploit_log"])
            .requires(["verify"])
            .condition("!artifacts.exploit_log")
            .retry(RetryPolicy::new(2).with_backoff(0.5, 2.0, 4.0)),
    );

    let doc: Value = serde_json::from_str(&plan.to_json_pretty().unwrap()).unwrap();
    assert_eq!(doc["cve_id"], "CVE-2024-4577");
    assert_eq!(doc["profile"], "native-local");
    assert_eq!(doc["artifacts"]["repo_state"]["type"], "dir");
    assert_eq!(doc["steps"][0]["id"], "collect-info");

    let bonus = &doc["steps"][4];
    assert_eq!(bonus["if"], "!artifacts.exploit_log");
    assert_eq!(bonus["requires"], json!(["verify"]));
    assert_eq!(
        bonus["retry"],
        json!({"max": 2, "delay": 0.5, "backoff_factor": 2.0, "max_delay": 4.0})
    );

    let restored = ExecutionPlan::from_json(&doc.to_string()).unwrap();
    assert_eq!(restored, plan);
    assert_eq!(restored.artifacts["repo_state"].name, "repo_state");
    assert_eq!(restored.digest().unwrap(), plan.digest().unwrap());
}

#[test]
fn plan_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plans").join("CVE-2024-4577.json");
    let plan = PlanBuilder::new().build(&decision(Profile::WebBasic));

    plan.save(&path).unwrap();
    assert_eq!(ExecutionPlan::load(&path).unwrap(), plan);
}

#[test]
fn hand_written_plan_reports_issues() {
    let raw = json!({
        "cve_id": "CVE-2024-0002",
        "profile": "native-local",
        "artifacts": {"a": {"type": "json"}},
        "steps": [
            {"id": "one", "capability": "C", "implementation": "I",
             "outputs": ["a", "b"], "if": "artifacts.a is None",
             "success_condition": "len(a) > 0"},
            {"id": "two", "capability": "C", "implementation": "I", "requires": ["ghost"]}
        ]
    });
    let plan = ExecutionPlan::from_json(&raw.to_string()).unwrap();
    let issues = plan.validate();

    assert!(issues.contains(&PlanIssue::UnknownDependency {
        step: "two".into(),
        requires: "ghost".into()
    }));
    assert!(issues.contains(&PlanIssue::UnregisteredArtifact {
        step: "one".into(),
        artifact: "b".into()
    }));
    assert!(issues
        .iter()
        .any(|i| matches!(i, PlanIssue::UnsupportedGuard { step, .. } if step == "one")));
    assert!(issues
        .iter()
        .any(|i| matches!(i, PlanIssue::InvalidSuccessCondition { step, .. } if step == "one")));
    assert_eq!(issues.iter().filter(|i| i.is_fatal()).count(), 1);
}
