//! Vulnerability classification: `(cve_id, record) -> ClassifierDecision`.
//!
//! [`RuleBasedClassifier`] is the deterministic keyword baseline. Heavier
//! classifiers (e.g. LLM-backed) plug in through
//! [`fallback::FallibleClassifier`] and are wrapped in
//! [`fallback::FallbackClassifier`] so they degrade to the baseline instead
//! of failing.

pub mod fallback;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::plan::{ClassifierDecision, HintValue, Profile, ResourceHints};

pub use fallback::{FallbackClassifier, FallibleClassifier};

const WEB_KEYWORDS: [&str; 4] = ["http", "browser", "csrf", "xss"];
const BROWSER_KEYWORDS: [&str; 4] = ["browser", "csrf", "xss", "web"];
const CLOUD_KEYWORDS: [&str; 2] = ["cloud", "iam"];
const FIRMWARE_KEYWORDS: [&str; 2] = ["firmware", "uart"];
const WEB_CWES: [&str; 2] = ["CWE-352", "CWE-79"];
const CLOUD_CWES: [&str; 1] = ["CWE-918"];

/// Tunables shared by the rule-based and fallback classifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Profile chosen when no heuristic fires.
    pub default_profile: Profile,
    /// Decisions from a fallible classifier below this are discarded.
    pub min_confidence: f64,
    /// Value of the `timeout` resource hint, in seconds.
    pub timeout_secs: i64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            default_profile: Profile::NativeLocal,
            min_confidence: 0.55,
            timeout_secs: 3600,
        }
    }
}

/// Anything that turns a CVE record into a decision without failing.
pub trait Classifier {
    fn classify(
        &self,
        cve_id: &str,
        record: &Value,
        profile_override: Option<&str>,
    ) -> ClassifierDecision;
}

/// Ordered capability names a profile needs. Unknown profiles get the
/// native-local list.
pub fn required_capabilities(profile: &Profile) -> Vec<String> {
    let names: &[&str] = match profile {
        Profile::WebBasic => &[
            "InfoGenerator",
            "PreReqAnalyzer",
            "EnvironmentDeployer",
            "BrowserProvisioner",
            "WebExploiter",
            "WebVerifier",
        ],
        Profile::CloudConfig => &[
            "InfoGenerator",
            "CloudEnvProvisioner",
            "ApiExploiter",
            "LogVerifier",
        ],
        Profile::IotFirmware => &[
            "InfoGenerator",
            "FirmwareProvisioner",
            "ExploitExecutor",
            "TelemetryVerifier",
        ],
        _ => &[
            "InfoGenerator",
            "EnvironmentProvisioner",
            "ExploitExecutor",
            "FlagVerifier",
        ],
    };
    names.iter().map(|n| n.to_string()).collect()
}

/// Keyword heuristics over the description and CWE ids.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedClassifier {
    config: ClassifierConfig,
}

impl RuleBasedClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    fn pick_profile(&self, description: &str, cwes: &[String]) -> Profile {
        let has_cwe = |wanted: &[&str]| cwes.iter().any(|id| wanted.contains(&id.as_str()));

        if contains_any(description, &WEB_KEYWORDS) {
            Profile::WebBasic
        } else if contains_any(description, &CLOUD_KEYWORDS) {
            Profile::CloudConfig
        } else if contains_any(description, &FIRMWARE_KEYWORDS) {
            Profile::IotFirmware
        } else if has_cwe(&WEB_CWES) {
            Profile::WebBasic
        } else if has_cwe(&CLOUD_CWES) {
            Profile::CloudConfig
        } else {
            self.config.default_profile.clone()
        }
    }

    fn resource_hints(&self, description: &str) -> ResourceHints {
        ResourceHints::from([
            (
                "needs_browser".to_string(),
                HintValue::Bool(contains_any(description, &BROWSER_KEYWORDS)),
            ),
            (
                "needs_emulation".to_string(),
                HintValue::Bool(contains_any(description, &FIRMWARE_KEYWORDS)),
            ),
            ("timeout".to_string(), HintValue::Int(self.config.timeout_secs)),
        ])
    }

    fn confidence(&self, profile: &Profile, hints: &ResourceHints) -> f64 {
        let flag = |key: &str| hints.get(key).and_then(HintValue::as_bool).unwrap_or(false);
        let mut score: f64 = 0.6;
        if *profile != self.config.default_profile {
            score += 0.15;
        }
        if flag("needs_browser") {
            score += 0.1;
        }
        if flag("needs_emulation") {
            score += 0.1;
        }
        score.min(0.95)
    }
}

impl Classifier for RuleBasedClassifier {
    fn classify(
        &self,
        cve_id: &str,
        record: &Value,
        profile_override: Option<&str>,
    ) -> ClassifierDecision {
        let description = record_description(record);
        let cwes = record_cwe_ids(record);

        let profile = match profile_override.filter(|p| !p.is_empty()) {
            Some(key) => Profile::from(key),
            None => self.pick_profile(&description, &cwes),
        };
        let resource_hints = self.resource_hints(&description);
        let confidence = self.confidence(&profile, &resource_hints);
        debug!(cve_id = %cve_id, profile = %profile, confidence, "rule-based classification");

        ClassifierDecision {
            cve_id: cve_id.to_string(),
            required_capabilities: required_capabilities(&profile),
            profile,
            confidence,
            resource_hints,
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Lower-cased `description`, empty when missing or not a string.
fn record_description(record: &Value) -> String {
    record
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase()
}

/// Upper-cased CWE ids from `cwe`: `{id}` objects or bare strings.
fn record_cwe_ids(record: &Value) -> Vec<String> {
    let Some(items) = record.get("cwe").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.as_str()),
            Value::Object(obj) => obj.get("id").and_then(Value::as_str),
            _ => None,
        })
        .map(|id| id.trim().to_uppercase())
        .filter(|id| !id.is_empty())
        .collect()
}
