//! Wrapper that degrades an unreliable classifier to the rule-based baseline.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;
use tracing::{info, warn};

use super::{Classifier, ClassifierConfig, RuleBasedClassifier};
use crate::plan::ClassifierDecision;

/// Classifier that may fail, e.g. one backed by a remote model.
pub trait FallibleClassifier {
    fn try_classify(&self, cve_id: &str, record: &Value) -> anyhow::Result<ClassifierDecision>;
}

impl<F> FallibleClassifier for F
where
    F: Fn(&str, &Value) -> anyhow::Result<ClassifierDecision>,
{
    fn try_classify(&self, cve_id: &str, record: &Value) -> anyhow::Result<ClassifierDecision> {
        self(cve_id, record)
    }
}

/// Runs `primary` and falls back to [`RuleBasedClassifier`] on any error,
/// panic, out-of-range or low confidence, or empty profile.
///
/// A profile override skips `primary` entirely.
pub struct FallbackClassifier<C> {
    primary: C,
    rules: RuleBasedClassifier,
}

impl<C: FallibleClassifier> FallbackClassifier<C> {
    pub fn new(primary: C, config: ClassifierConfig) -> Self {
        Self {
            primary,
            rules: RuleBasedClassifier::new(config),
        }
    }

    pub fn primary(&self) -> &C {
        &self.primary
    }

    fn rejection(&self, decision: &ClassifierDecision) -> Option<String> {
        let min = self.rules.config().min_confidence;
        if !(0.0..=1.0).contains(&decision.confidence) {
            Some(format!("confidence {} outside [0, 1]", decision.confidence))
        } else if decision.profile.as_str().trim().is_empty() {
            Some("empty profile".to_string())
        } else if decision.confidence < min {
            Some(format!("confidence {} below {min}", decision.confidence))
        } else {
            None
        }
    }
}

impl<C: FallibleClassifier> Classifier for FallbackClassifier<C> {
    fn classify(
        &self,
        cve_id: &str,
        record: &Value,
        profile_override: Option<&str>,
    ) -> ClassifierDecision {
        if profile_override.is_some_and(|p| !p.is_empty()) {
            return self.rules.classify(cve_id, record, profile_override);
        }

        let attempt = catch_unwind(AssertUnwindSafe(|| self.primary.try_classify(cve_id, record)));
        let reason = match attempt {
            Ok(Ok(decision)) => match self.rejection(&decision) {
                None => {
                    info!(cve_id = %cve_id, profile = %decision.profile, confidence = decision.confidence, "classified");
                    return decision;
                }
                Some(reason) => reason,
            },
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => "classifier panicked".to_string(),
        };

        warn!(cve_id = %cve_id, reason = %reason, "falling back to rule-based classification");
        self.rules.classify(cve_id, record, None)
    }
}
