//! Plan construction: `ClassifierDecision -> ExecutionPlan`.
//!
//! Two [`PlanSource`]s produce the same plan type:
//! - [`PlanBuilder`]: hardcoded per-profile step sequences with
//!   per-profile implementation overrides
//! - [`template::TemplatePlanSource`]: declarative YAML profiles

pub mod template;

use std::collections::BTreeMap;

use tracing::debug;

use crate::plan::{
    ArtifactKind, ClassifierDecision, ExecutionPlan, PlanArtifact, PlanResult, PlanStep, Profile,
};

pub use template::TemplatePlanSource;

/// Anything that can turn a classification into a plan.
pub trait PlanSource {
    fn plan_for(&self, decision: &ClassifierDecision) -> PlanResult<ExecutionPlan>;
}

/// profile key -> capability -> implementation.
pub type ImplementationOverrides = BTreeMap<String, BTreeMap<String, String>>;

/// Artifacts seeded by the driver before execution.
const SEED_ARTIFACTS: [(&str, ArtifactKind, &str); 2] = [
    ("cve_id", ArtifactKind::Text, "CVE identifier"),
    ("cve_entry", ArtifactKind::Json, "Raw CVE record"),
];

const NATIVE_ARTIFACTS: &[(&str, ArtifactKind, &str)] = &[
    ("cve_info", ArtifactKind::Json, "Summary of the CVE entry"),
    ("repo_state", ArtifactKind::Dir, "Prepared vulnerable environment"),
    ("exploit_log", ArtifactKind::Text, "Exploit output"),
    ("verification", ArtifactKind::Json, "Verifier metadata"),
];

const WEB_ARTIFACTS: &[(&str, ArtifactKind, &str)] = &[
    ("cve_knowledge", ArtifactKind::Json, "Structured knowledge about the CVE"),
    ("prerequisites", ArtifactKind::Json, "Deployment prerequisites"),
    ("build_result", ArtifactKind::Json, "Deployed web application"),
    ("health_result", ArtifactKind::Json, "Health check of the deployment"),
    ("browser_config", ArtifactKind::Json, "Provisioned browser session"),
    ("web_exploit_result", ArtifactKind::Json, "Browser-driven exploit output"),
    ("verification_result", ArtifactKind::Json, "Verifier metadata"),
];

const CLOUD_ARTIFACTS: &[(&str, ArtifactKind, &str)] = &[
    ("cve_info", ArtifactKind::Json, "Summary of the CVE entry"),
    ("repo_state", ArtifactKind::Dir, "Provisioned cloud environment"),
    ("exploit_log", ArtifactKind::Text, "API exploit output"),
    ("verification", ArtifactKind::Json, "Log verifier metadata"),
];

const IOT_ARTIFACTS: &[(&str, ArtifactKind, &str)] = &[
    ("cve_info", ArtifactKind::Json, "Summary of the CVE entry"),
    ("firmware_state", ArtifactKind::Dir, "Emulated firmware image"),
    ("exploit_log", ArtifactKind::Text, "Exploit output"),
    ("verification", ArtifactKind::Json, "Telemetry verifier metadata"),
];

const FREESTYLE_ARTIFACTS: &[(&str, ArtifactKind, &str)] = &[
    ("cve_knowledge", ArtifactKind::Json, "Structured knowledge about the CVE"),
    ("deployment_strategy", ArtifactKind::Json, "Suggested deployment approach"),
    ("freestyle_result", ArtifactKind::Json, "Exploration transcript"),
    ("verification_result", ArtifactKind::Json, "Verifier metadata"),
];

/// Programmatic plan generator.
#[derive(Debug, Clone, Default)]
pub struct PlanBuilder {
    overrides: ImplementationOverrides,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overrides(overrides: ImplementationOverrides) -> Self {
        Self { overrides }
    }

    /// Use `implementation` for `capability` in plans for `profile`.
    pub fn override_implementation(
        &mut self,
        profile: impl Into<String>,
        capability: impl Into<String>,
        implementation: impl Into<String>,
    ) -> &mut Self {
        self.overrides
            .entry(profile.into())
            .or_default()
            .insert(capability.into(), implementation.into());
        self
    }

    /// Build the plan for `decision`. Unknown profiles get the native-local
    /// sequence under their own profile key.
    pub fn build(&self, decision: &ClassifierDecision) -> ExecutionPlan {
        let mut plan = ExecutionPlan::new(decision.cve_id.clone(), decision.profile.clone());
        let steps = StepFactory {
            overrides: self.overrides.get(decision.profile.as_str()),
        };

        let (artifacts, sequence) = match decision.profile {
            Profile::WebBasic => (WEB_ARTIFACTS, steps.web_basic()),
            Profile::CloudConfig => (CLOUD_ARTIFACTS, steps.cloud_config()),
            Profile::IotFirmware => (IOT_ARTIFACTS, steps.iot_firmware()),
            Profile::Freestyle => (FREESTYLE_ARTIFACTS, steps.freestyle()),
            Profile::NativeLocal | Profile::Custom(_) => (NATIVE_ARTIFACTS, steps.native_local()),
        };

        for (name, kind, description) in SEED_ARTIFACTS.iter().chain(artifacts) {
            plan.register_artifact(PlanArtifact::new(*name, *kind, *description));
        }
        for step in sequence {
            plan.add_step(step);
        }
        debug!(cve_id = %plan.cve_id, profile = %plan.profile, steps = plan.steps.len(), "built plan");
        plan
    }
}

impl PlanSource for PlanBuilder {
    fn plan_for(&self, decision: &ClassifierDecision) -> PlanResult<ExecutionPlan> {
        Ok(self.build(decision))
    }
}

struct StepFactory<'a> {
    overrides: Option<&'a BTreeMap<String, String>>,
}

impl StepFactory<'_> {
    fn step(&self, id: &str, capability: &str, default_impl: &str) -> PlanStep {
        let implementation = self
            .overrides
            .and_then(|o| o.get(capability))
            .map(String::as_str)
            .unwrap_or(default_impl);
        PlanStep::new(id, capability, implementation)
    }

    fn native_local(&self) -> Vec<PlanStep> {
        vec![
            self.step("collect-info", "InfoGenerator", "CVEInfoGenerator")
                .inputs(["cve_id"])
                .outputs(["cve_info"])
                .environment("control"),
            self.step("prepare-env", "EnvironmentProvisioner", "RepoBuilder")
                .inputs(["cve_info"])
                .outputs(["repo_state"])
                .requires(["collect-info"])
                .environment("builder"),
            self.step("exploit", "ExploitExecutor", "Exploiter")
                .inputs(["repo_state", "cve_info"])
                .outputs(["exploit_log"])
                .requires(["prepare-env"])
                .environment("target"),
            self.step("verify", "FlagVerifier", "CTFVerifier")
                .inputs(["exploit_log"])
                .outputs(["verification"])
                .requires(["exploit"])
                .environment("target")
                .success_condition("verification.flag_found == true"),
        ]
    }

    fn web_basic(&self) -> Vec<PlanStep> {
        vec![
            self.step("collect-info", "InfoGenerator", "KnowledgeBuilder")
                .inputs(["cve_id", "cve_entry"])
                .outputs(["cve_knowledge"])
                .environment("control"),
            self.step("analyze-prereqs", "PreReqAnalyzer", "PreReqBuilder")
                .inputs(["cve_knowledge", "cve_entry"])
                .outputs(["prerequisites"])
                .requires(["collect-info"])
                .environment("builder"),
            self.step("deploy-env", "EnvironmentDeployer", "WebAppDeployer")
                .inputs(["cve_id", "cve_knowledge", "cve_entry", "prerequisites"])
                .outputs(["build_result"])
                .requires(["analyze-prereqs"])
                .environment("builder"),
            self.step("health-check", "HealthCheck", "HealthCheck")
                .inputs(["build_result"])
                .outputs(["health_result"])
                .requires(["deploy-env"])
                .environment("builder")
                .success_condition(
                    "health_result.http_code in [200, 301, 302, 307, 404] or health_result.healthy == True",
                ),
            self.step("browser-provision", "BrowserProvisioner", "BrowserEnvironmentProvider")
                .inputs(["build_result"])
                .outputs(["browser_config"])
                .requires(["health-check"])
                .environment("browser"),
            self.step("exploit-web", "WebExploiter", "WebDriverAgent")
                .inputs(["browser_config", "cve_knowledge", "cve_id"])
                .outputs(["web_exploit_result"])
                .requires(["browser-provision"])
                .environment("browser"),
            self.step("verify-web", "WebVerifier", "CombinedVerifier")
                .inputs(["web_exploit_result"])
                .outputs(["verification_result"])
                .requires(["exploit-web"])
                .environment("browser")
                .success_condition("verification_result.success == True"),
        ]
    }

    fn cloud_config(&self) -> Vec<PlanStep> {
        vec![
            self.step("collect-info", "InfoGenerator", "CVEInfoGenerator")
                .inputs(["cve_id"])
                .outputs(["cve_info"]),
            self.step("provision-cloud", "CloudEnvProvisioner", "RepoBuilder")
                .inputs(["cve_info"])
                .outputs(["repo_state"])
                .requires(["collect-info"])
                .environment("cloud"),
            self.step("exploit-api", "ApiExploiter", "Exploiter")
                .inputs(["repo_state", "cve_info"])
                .outputs(["exploit_log"])
                .requires(["provision-cloud"])
                .environment("cloud"),
            self.step("verify-log", "LogVerifier", "SanityGuy")
                .inputs(["exploit_log"])
                .outputs(["verification"])
                .requires(["exploit-api"])
                .environment("cloud")
                .success_condition("verification.anomaly_detected == true"),
        ]
    }

    fn iot_firmware(&self) -> Vec<PlanStep> {
        vec![
            self.step("collect-info", "InfoGenerator", "CVEInfoGenerator")
                .inputs(["cve_id"])
                .outputs(["cve_info"])
                .environment("control"),
            self.step("provision-firmware", "FirmwareProvisioner", "FirmwareEmulator")
                .inputs(["cve_info"])
                .outputs(["firmware_state"])
                .requires(["collect-info"])
                .environment("emulator"),
            self.step("exploit", "ExploitExecutor", "Exploiter")
                .inputs(["firmware_state", "cve_info"])
                .outputs(["exploit_log"])
                .requires(["provision-firmware"])
                .environment("emulator"),
            self.step("verify-telemetry", "TelemetryVerifier", "TelemetryVerifier")
                .inputs(["exploit_log"])
                .outputs(["verification"])
                .requires(["exploit"])
                .environment("emulator")
                .success_condition("verification.triggered == true"),
        ]
    }

    fn freestyle(&self) -> Vec<PlanStep> {
        vec![
            self.step("collect-info", "InfoGenerator", "KnowledgeBuilder")
                .inputs(["cve_id", "cve_entry"])
                .outputs(["cve_knowledge", "deployment_strategy"])
                .environment("control"),
            self.step("freestyle-explore", "FreestyleExplorer", "FreestyleAgent")
                .inputs(["cve_id", "cve_entry", "cve_knowledge", "deployment_strategy"])
                .outputs(["freestyle_result", "verification_result"])
                .requires(["collect-info"])
                .environment("target")
                .success_condition("verification_result.passed == true"),
        ]
    }
}
