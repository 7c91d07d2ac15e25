//! Plan data model.
//!
//! A plan is the static artifact catalogue plus the ordered list of steps
//! produced for one classified CVE. It is built once, persisted as JSON, and
//! handed to exactly one executor.

pub mod error;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::executor::condition::Condition;
use crate::executor::schedule;
pub use error::{PlanError, PlanResult};

/// Schema tag written into every persisted plan.
pub const PLAN_SCHEMA: &str = "cvegenie/plan@v0";

/// Opaque per-step configuration handed to the capability factory.
pub type StepConfig = Map<String, Value>;

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// Workload category selecting the step sequence.
///
/// Unknown keys survive as [`Profile::Custom`] so templates can define
/// profiles the builder has never heard of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Profile {
    NativeLocal,
    WebBasic,
    CloudConfig,
    IotFirmware,
    Freestyle,
    Custom(String),
}

impl Profile {
    pub const KNOWN: [Profile; 5] = [
        Profile::NativeLocal,
        Profile::WebBasic,
        Profile::CloudConfig,
        Profile::IotFirmware,
        Profile::Freestyle,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Profile::NativeLocal => "native-local",
            Profile::WebBasic => "web-basic",
            Profile::CloudConfig => "cloud-config",
            Profile::IotFirmware => "iot-firmware",
            Profile::Freestyle => "freestyle",
            Profile::Custom(key) => key,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Profile::Custom(_))
    }
}

impl Default for Profile {
    fn default() -> Self {
        Profile::NativeLocal
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Profile {
    fn from(key: &str) -> Self {
        match key {
            "native-local" => Profile::NativeLocal,
            "web-basic" => Profile::WebBasic,
            "cloud-config" => Profile::CloudConfig,
            "iot-firmware" => Profile::IotFirmware,
            "freestyle" => Profile::Freestyle,
            other => Profile::Custom(other.to_string()),
        }
    }
}

impl From<String> for Profile {
    fn from(key: String) -> Self {
        match Profile::from(key.as_str()) {
            Profile::Custom(_) => Profile::Custom(key),
            known => known,
        }
    }
}

impl From<Profile> for String {
    fn from(p: Profile) -> Self {
        match p {
            Profile::Custom(key) => key,
            known => known.as_str().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Classifier decision
// ---------------------------------------------------------------------------

/// Scalar value of a resource hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HintValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl HintValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HintValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HintValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<bool> for HintValue {
    fn from(b: bool) -> Self {
        HintValue::Bool(b)
    }
}

impl From<i64> for HintValue {
    fn from(n: i64) -> Self {
        HintValue::Int(n)
    }
}

impl From<&str> for HintValue {
    fn from(s: &str) -> Self {
        HintValue::Text(s.to_string())
    }
}

/// Open key -> value map of resource requirements.
pub type ResourceHints = BTreeMap<String, HintValue>;

/// Output of a classifier: the vulnerability portrait a plan is built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierDecision {
    pub cve_id: String,
    pub profile: Profile,
    /// In `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub resource_hints: ResourceHints,
}

impl ClassifierDecision {
    pub fn hint_flag(&self, key: &str) -> bool {
        self.resource_hints
            .get(key)
            .and_then(HintValue::as_bool)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Artifacts and steps
// ---------------------------------------------------------------------------

/// Informative type tag of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Json,
    Dir,
    Text,
    Binary,
    #[default]
    #[serde(other)]
    Auto,
}

/// Entry of the plan's artifact catalogue.
///
/// Persisted as `{type, description}` under its name; the name is restored
/// from the map key on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanArtifact {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ArtifactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PlanArtifact {
    pub fn new(name: impl Into<String>, kind: ArtifactKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: Some(description.into()),
        }
    }
}

/// Bounded retry with exponential backoff. Delays are seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `<= 0` disables retrying.
    #[serde(default)]
    pub max: i32,
    #[serde(default = "default_delay")]
    pub delay: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
}

fn default_delay() -> f64 {
    1.0
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay() -> f64 {
    60.0
}

impl RetryPolicy {
    pub fn new(max: i32) -> Self {
        Self {
            max,
            delay: default_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay: default_max_delay(),
        }
    }

    pub fn with_backoff(mut self, delay: f64, backoff_factor: f64, max_delay: f64) -> Self {
        self.delay = delay;
        self.backoff_factor = backoff_factor;
        self.max_delay = max_delay;
        self
    }

    /// Number of retries this policy allows, zero when disabled.
    pub fn retries(&self) -> u32 {
        self.max.max(0) as u32
    }
}

/// One node of the plan graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub capability: String,
    pub implementation: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Pre-guard; only `!artifacts.NAME` is understood.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: StepConfig,
}

impl PlanStep {
    pub fn new(
        id: impl Into<String>,
        capability: impl Into<String>,
        implementation: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            implementation: implementation.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            requires: Vec::new(),
            environment: None,
            retry: None,
            condition: None,
            success_condition: None,
            config: StepConfig::new(),
        }
    }

    pub fn inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn requires<I, S>(mut self, step_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = step_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn condition(mut self, guard: impl Into<String>) -> Self {
        self.condition = Some(guard.into());
        self
    }

    pub fn success_condition(mut self, expression: impl Into<String>) -> Self {
        self.success_condition = Some(expression.into());
        self
    }

    pub fn config(mut self, config: StepConfig) -> Self {
        self.config = config;
        self
    }

    /// Artifact named by a `!artifacts.NAME` guard, if the guard has that form.
    pub fn absent_artifact_guard(&self) -> Option<&str> {
        self.condition
            .as_deref()
            .and_then(|c| c.trim().strip_prefix("!artifacts."))
            .filter(|name| !name.is_empty())
    }
}

// ---------------------------------------------------------------------------
// ExecutionPlan
// ---------------------------------------------------------------------------

/// Acyclic step graph plus artifact catalogue for one CVE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PlanDocument")]
pub struct ExecutionPlan {
    pub schema: String,
    pub cve_id: String,
    pub profile: Profile,
    pub artifacts: BTreeMap<String, PlanArtifact>,
    /// Declaration order.
    pub steps: Vec<PlanStep>,
}

#[derive(Deserialize)]
struct PlanDocument {
    #[serde(default = "default_schema")]
    schema: String,
    cve_id: String,
    profile: Profile,
    #[serde(default)]
    artifacts: BTreeMap<String, PlanArtifact>,
    #[serde(default)]
    steps: Vec<PlanStep>,
}

fn default_schema() -> String {
    PLAN_SCHEMA.to_string()
}

impl From<PlanDocument> for ExecutionPlan {
    fn from(doc: PlanDocument) -> Self {
        let artifacts = doc
            .artifacts
            .into_iter()
            .map(|(name, mut artifact)| {
                artifact.name = name.clone();
                (name, artifact)
            })
            .collect();
        Self {
            schema: doc.schema,
            cve_id: doc.cve_id,
            profile: doc.profile,
            artifacts,
            steps: doc.steps,
        }
    }
}

impl ExecutionPlan {
    pub fn new(cve_id: impl Into<String>, profile: Profile) -> Self {
        Self {
            schema: default_schema(),
            cve_id: cve_id.into(),
            profile,
            artifacts: BTreeMap::new(),
            steps: Vec::new(),
        }
    }

    /// Register (or replace) a catalogue entry.
    pub fn register_artifact(&mut self, artifact: PlanArtifact) {
        self.artifacts.insert(artifact.name.clone(), artifact);
    }

    pub fn add_step(&mut self, step: PlanStep) {
        self.steps.push(step);
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn from_json(raw: &str) -> PlanResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> PlanResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn to_json_pretty(&self) -> PlanResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the plan as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> PlanResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }

    /// Hex SHA-256 of the compact persisted JSON.
    ///
    /// Artifact keys are ordered and step order is significant, so two plans
    /// hash equal exactly when they persist equal.
    pub fn digest(&self) -> PlanResult<String> {
        let canonical = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    /// Structure and catalogue checks for tooling.
    ///
    /// Returns every issue found; an empty list means the plan is clean.
    /// Fatal issues are the ones the executor would reject.
    pub fn validate(&self) -> Vec<PlanIssue> {
        let mut issues = Vec::new();

        match schedule::topological_order(&self.steps) {
            Ok(_) => {}
            Err(PlanError::DuplicateStep { step }) => issues.push(PlanIssue::DuplicateStep { step }),
            Err(PlanError::UnknownDependency { step, requires }) => {
                issues.push(PlanIssue::UnknownDependency { step, requires })
            }
            Err(PlanError::DependencyCycle { steps }) => {
                issues.push(PlanIssue::DependencyCycle { steps })
            }
            Err(PlanError::UnsafePath { step, name }) => {
                issues.push(PlanIssue::UnsafePath { step, name })
            }
            Err(other) => issues.push(PlanIssue::Structure {
                message: other.to_string(),
            }),
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            for name in step.inputs.iter().chain(&step.outputs) {
                if !self.artifacts.contains_key(name) && seen.insert((step.id.as_str(), name.as_str())) {
                    issues.push(PlanIssue::UnregisteredArtifact {
                        step: step.id.clone(),
                        artifact: name.clone(),
                    });
                }
            }

            if let Some(guard) = &step.condition {
                if step.absent_artifact_guard().is_none() {
                    issues.push(PlanIssue::UnsupportedGuard {
                        step: step.id.clone(),
                        guard: guard.clone(),
                    });
                }
            }

            if let Some(expr) = &step.success_condition {
                if let Err(e) = Condition::parse(expr) {
                    issues.push(PlanIssue::InvalidSuccessCondition {
                        step: step.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        issues
    }
}

/// Finding reported by [`ExecutionPlan::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum PlanIssue {
    DuplicateStep { step: String },
    UnknownDependency { step: String, requires: String },
    DependencyCycle { steps: Vec<String> },
    UnsafePath { step: String, name: String },
    Structure { message: String },
    UnregisteredArtifact { step: String, artifact: String },
    UnsupportedGuard { step: String, guard: String },
    InvalidSuccessCondition { step: String, reason: String },
}

impl PlanIssue {
    /// Whether the executor refuses to run a plan with this issue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlanIssue::DuplicateStep { .. }
                | PlanIssue::UnknownDependency { .. }
                | PlanIssue::DependencyCycle { .. }
                | PlanIssue::UnsafePath { .. }
                | PlanIssue::Structure { .. }
        )
    }
}

impl fmt::Display for PlanIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanIssue::DuplicateStep { step } => write!(f, "duplicate step id {step}"),
            PlanIssue::UnknownDependency { step, requires } => {
                write!(f, "step {step} requires unknown step {requires}")
            }
            PlanIssue::DependencyCycle { steps } => {
                write!(f, "dependency cycle through {}", steps.join(", "))
            }
            PlanIssue::UnsafePath { step, name } => {
                write!(f, "step {step} names {name:?}, which would leave its artifact directory")
            }
            PlanIssue::Structure { message } => f.write_str(message),
            PlanIssue::UnregisteredArtifact { step, artifact } => {
                write!(f, "step {step} uses unregistered artifact {artifact}")
            }
            PlanIssue::UnsupportedGuard { step, guard } => {
                write!(f, "step {step} has unsupported guard {guard:?}; it will always run")
            }
            PlanIssue::InvalidSuccessCondition { step, reason } => {
                write!(f, "step {step} success condition never holds: {reason}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_plan() -> ExecutionPlan {
        let mut plan = ExecutionPlan::new("CVE-2024-0001", Profile::NativeLocal);
        plan.register_artifact(PlanArtifact::new("cve_id", ArtifactKind::Text, "seed"));
        plan.register_artifact(PlanArtifact::new("cve_info", ArtifactKind::Json, "summary"));
        plan.add_step(
            PlanStep::new("collect-info", "InfoGenerator", "CVEInfoGenerator")
                .inputs(["cve_id"])
                .outputs(["cve_info"])
                .environment("control"),
        );
        plan.add_step(
            PlanStep::new("verify", "FlagVerifier", "CTFVerifier")
                .inputs(["cve_info"])
                .outputs(["cve_info"])
                .requires(["collect-info"])
                .condition("!artifacts.verification")
                .success_condition("cve_info.ok == true")
                .retry(RetryPolicy::new(2)),
        );
        plan
    }

    #[test]
    fn profile_keys_round_trip() {
        for p in Profile::KNOWN {
            assert_eq!(Profile::from(p.as_str()), p);
        }
        let custom = Profile::from("mobile-app");
        assert_eq!(custom, Profile::Custom("mobile-app".into()));
        assert_eq!(serde_json::to_value(&custom).unwrap(), json!("mobile-app"));
    }

    #[test]
    fn hint_values_serialize_untagged() {
        let mut hints = ResourceHints::new();
        hints.insert("needs_browser".into(), true.into());
        hints.insert("timeout".into(), 3600i64.into());
        hints.insert("arch".into(), "arm".into());
        assert_eq!(
            serde_json::to_value(&hints).unwrap(),
            json!({"arch": "arm", "needs_browser": true, "timeout": 3600})
        );
        let back: ResourceHints =
            serde_json::from_value(json!({"needs_browser": false, "timeout": 10})).unwrap();
        assert_eq!(back["timeout"], HintValue::Int(10));
    }

    #[test]
    fn persisted_plan_uses_if_key_and_omits_empty_fields() {
        let plan = sample_plan();
        let value = serde_json::to_value(&plan).unwrap();
        assert_eq!(value["schema"], PLAN_SCHEMA);
        assert_eq!(value["steps"][1]["if"], "!artifacts.verification");
        assert!(value["steps"][0].get("requires").is_none());
        assert!(value["steps"][0].get("if").is_none());
        assert!(value["steps"][0].get("config").is_none());
        assert_eq!(value["artifacts"]["cve_info"], json!({"type": "json", "description": "summary"}));
    }

    #[test]
    fn json_round_trip_restores_artifact_names() {
        let plan = sample_plan();
        let back = ExecutionPlan::from_json(&plan.to_json_pretty().unwrap()).unwrap();
        assert_eq!(back, plan);
        assert_eq!(back.artifacts["cve_info"].name, "cve_info");
    }

    #[test]
    fn minimal_document_gets_defaults() {
        let plan = ExecutionPlan::from_json(
            r#"{"cve_id": "CVE-1", "profile": "freestyle",
                "artifacts": {"x": {"type": "weird"}},
                "steps": [{"id": "a", "capability": "C", "implementation": "I"}]}"#,
        )
        .unwrap();
        assert_eq!(plan.schema, PLAN_SCHEMA);
        assert_eq!(plan.profile, Profile::Freestyle);
        assert_eq!(plan.artifacts["x"].kind, ArtifactKind::Auto);
        assert!(plan.steps[0].inputs.is_empty());
    }

    #[test]
    fn retry_policy_defaults() {
        let policy: RetryPolicy = serde_json::from_value(json!({"max": 3})).unwrap();
        assert_eq!(policy, RetryPolicy::new(3));
        let disabled: RetryPolicy = serde_json::from_value(json!({"max": -1})).unwrap();
        assert_eq!(disabled.retries(), 0);
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let plan = sample_plan();
        let d1 = plan.digest().unwrap();
        assert_eq!(d1.len(), 64);
        assert_eq!(d1, sample_plan().digest().unwrap());

        let mut changed = sample_plan();
        changed.steps[0].implementation = "Other".into();
        assert_ne!(d1, changed.digest().unwrap());
    }

    #[test]
    fn validate_reports_unregistered_artifacts_and_guards() {
        let mut plan = sample_plan();
        plan.steps[0].outputs.push("ghost".into());
        plan.steps[1].condition = Some("artifacts.exists('x')".into());
        plan.steps[1].success_condition = Some("len(x) > 0".into());

        let issues = plan.validate();
        assert!(issues.contains(&PlanIssue::UnregisteredArtifact {
            step: "collect-info".into(),
            artifact: "ghost".into()
        }));
        assert!(issues
            .iter()
            .any(|i| matches!(i, PlanIssue::UnsupportedGuard { step, .. } if step == "verify")));
        assert!(issues
            .iter()
            .any(|i| matches!(i, PlanIssue::InvalidSuccessCondition { .. })));
        assert!(issues.iter().all(|i| !i.is_fatal()));
    }

    #[test]
    fn validate_reports_cycles_as_fatal() {
        let mut plan = sample_plan();
        plan.steps[0].requires = vec!["verify".into()];
        let issues = plan.validate();
        assert!(issues.iter().any(PlanIssue::is_fatal));
    }

    #[test]
    fn validate_flags_outputs_that_would_leave_the_step_directory() {
        let mut plan = sample_plan();
        plan.steps[1].outputs.push("../../results".into());
        let issues = plan.validate();
        let unsafe_path = PlanIssue::UnsafePath {
            step: plan.steps[1].id.clone(),
            name: "../../results".into(),
        };
        assert!(issues.contains(&unsafe_path));
        assert!(unsafe_path.is_fatal());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/plan.json");
        let plan = sample_plan();
        plan.save(&path).unwrap();
        assert_eq!(ExecutionPlan::load(&path).unwrap(), plan);
    }

    #[test]
    fn absent_artifact_guard_parsing() {
        let step = PlanStep::new("s", "C", "I").condition(" !artifacts.cve_info ");
        assert_eq!(step.absent_artifact_guard(), Some("cve_info"));
        let bare = PlanStep::new("s", "C", "I").condition("!artifacts.");
        assert_eq!(bare.absent_artifact_guard(), None);
    }
}
