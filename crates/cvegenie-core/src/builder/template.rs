//! Declarative plan templates.
//!
//! A template source is either one YAML document keyed by profile name:
//!
//! ```yaml
//! native-local:
//!   artifacts:
//!     - cve_id
//!     - { name: cve_info, type: json, description: Summary of the CVE entry }
//!   steps:
//!     - step_id: collect-info
//!       capability: InfoGenerator
//!       implementation: CVEInfoGenerator
//!       inputs: [cve_id]
//!       outputs: [cve_info]
//!     - step_id: prepare-env
//!       capability: EnvironmentProvisioner
//!       dependencies: [collect-info]   # inputs default to [cve_info]
//!       outputs: [repo_state]
//! ```
//!
//! or a directory holding one `<profile>.yaml` (or `.yml`) body per profile.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use super::PlanSource;
use crate::plan::{
    ArtifactKind, ClassifierDecision, ExecutionPlan, PlanArtifact, PlanError, PlanResult,
    PlanStep, RetryPolicy, StepConfig,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProfileTemplate {
    #[serde(default)]
    artifacts: Vec<ArtifactTemplate>,
    #[serde(default)]
    steps: Vec<StepTemplate>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ArtifactTemplate {
    Name(String),
    Full {
        name: String,
        #[serde(rename = "type", default)]
        kind: ArtifactKind,
        #[serde(default)]
        description: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepTemplate {
    step_id: String,
    capability: String,
    #[serde(default)]
    implementation: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    inputs: Option<Vec<String>>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    config: StepConfig,
    #[serde(default)]
    environment: Option<String>,
    #[serde(default)]
    retry: Option<RetryPolicy>,
    #[serde(rename = "if", default)]
    condition: Option<String>,
    #[serde(default)]
    success_condition: Option<String>,
}

#[derive(Debug, Clone)]
enum Templates {
    Document(BTreeMap<String, ProfileTemplate>),
    Directory(PathBuf),
}

/// [`PlanSource`] backed by YAML profile templates.
#[derive(Debug, Clone)]
pub struct TemplatePlanSource {
    templates: Templates,
    location: String,
}

impl TemplatePlanSource {
    /// Load a template file, or point at a directory of per-profile files.
    /// Directory entries are read lazily, per profile.
    pub fn from_path(path: impl AsRef<Path>) -> PlanResult<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            return Ok(Self {
                templates: Templates::Directory(path.to_path_buf()),
                location: path.display().to_string(),
            });
        }
        let raw = fs::read_to_string(path)?;
        let templates = parse_document(&raw).map_err(|e| with_location(e, path))?;
        Ok(Self {
            templates: Templates::Document(templates),
            location: path.display().to_string(),
        })
    }

    pub fn from_yaml_str(raw: &str) -> PlanResult<Self> {
        Ok(Self {
            templates: Templates::Document(parse_document(raw)?),
            location: "<inline>".to_string(),
        })
    }

    /// Profile keys this source can serve.
    pub fn profiles(&self) -> PlanResult<Vec<String>> {
        match &self.templates {
            Templates::Document(map) => Ok(map.keys().cloned().collect()),
            Templates::Directory(dir) => {
                let mut names = Vec::new();
                for entry in fs::read_dir(dir)? {
                    let path = entry?.path();
                    let is_yaml = matches!(
                        path.extension().and_then(|e| e.to_str()),
                        Some("yaml" | "yml")
                    );
                    if let (true, Some(stem)) = (is_yaml, path.file_stem().and_then(|s| s.to_str())) {
                        names.push(stem.to_string());
                    }
                }
                names.sort();
                names.dedup();
                Ok(names)
            }
        }
    }

    fn template_for(&self, profile: &str) -> PlanResult<ProfileTemplate> {
        let not_found = || PlanError::SourceNotFound {
            profile: profile.to_string(),
            location: self.location.clone(),
        };
        match &self.templates {
            Templates::Document(map) => map.get(profile).cloned().ok_or_else(not_found),
            Templates::Directory(dir) => {
                if Path::new(profile).file_name().and_then(|n| n.to_str()) != Some(profile) {
                    return Err(PlanError::Template(format!(
                        "profile {profile:?} is not a plain file name under {}",
                        dir.display()
                    )));
                }
                let path = ["yaml", "yml"]
                    .iter()
                    .map(|ext| dir.join(format!("{profile}.{ext}")))
                    .find(|p| p.is_file())
                    .ok_or_else(not_found)?;
                let raw = fs::read_to_string(&path)?;
                serde_yaml::from_str(&raw).map_err(|e| with_location(e.into(), &path))
            }
        }
    }
}

impl PlanSource for TemplatePlanSource {
    fn plan_for(&self, decision: &ClassifierDecision) -> PlanResult<ExecutionPlan> {
        let template = self.template_for(decision.profile.as_str())?;
        let plan = instantiate(template, decision);
        debug!(
            cve_id = %plan.cve_id,
            profile = %plan.profile,
            source = %self.location,
            steps = plan.steps.len(),
            "instantiated plan template"
        );
        Ok(plan)
    }
}

fn parse_document(raw: &str) -> PlanResult<BTreeMap<String, ProfileTemplate>> {
    Ok(serde_yaml::from_str(raw)?)
}

fn with_location(err: PlanError, path: &Path) -> PlanError {
    match err {
        PlanError::Template(msg) => PlanError::Template(format!("{}: {msg}", path.display())),
        other => other,
    }
}

fn instantiate(template: ProfileTemplate, decision: &ClassifierDecision) -> ExecutionPlan {
    let mut plan = ExecutionPlan::new(decision.cve_id.clone(), decision.profile.clone());

    for artifact in template.artifacts {
        plan.register_artifact(match artifact {
            ArtifactTemplate::Name(name) => PlanArtifact {
                name,
                kind: ArtifactKind::Auto,
                description: None,
            },
            ArtifactTemplate::Full {
                name,
                kind,
                description,
            } => PlanArtifact {
                name,
                kind,
                description,
            },
        });
    }

    let outputs_by_step: HashMap<&str, &[String]> = template
        .steps
        .iter()
        .map(|s| (s.step_id.as_str(), s.outputs.as_slice()))
        .collect();

    for step in &template.steps {
        let inputs = step.inputs.clone().unwrap_or_else(|| {
            step.dependencies
                .iter()
                .filter_map(|dep| outputs_by_step.get(dep.as_str()))
                .flat_map(|outs| outs.iter().cloned())
                .collect()
        });
        let implementation = step.implementation.as_deref().unwrap_or(&step.capability);

        let mut built = PlanStep::new(&step.step_id, &step.capability, implementation)
            .inputs(inputs)
            .outputs(step.outputs.clone())
            .requires(step.dependencies.clone())
            .config(step.config.clone());
        built.environment = step.environment.clone();
        built.retry = step.retry.clone();
        built.condition = step.condition.clone();
        built.success_condition = step.success_condition.clone();
        plan.add_step(built);
    }

    plan
}
