//! Reproduction report: a per-run record of stages, evidence and verdict.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cvegenie_bus::RunRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::Artifacts;
use crate::executor::{ExecutorResult, StepRecord, StepStatus};
use crate::failure::FailureDetail;

/// Overall verdict of a reproduction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalResult {
    Success,
    Partial,
    Failed,
}

/// Outcome of one stage (usually one plan step).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub success: bool,
    pub duration_seconds: f64,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub failure_detail: Option<FailureDetail>,
}

/// One piece of evidence supporting the verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReproReport {
    pub cve_id: String,
    pub generated_at: DateTime<Utc>,
    pub final_result: Option<FinalResult>,
    /// Stage order is recording order; re-recording a stage replaces it.
    pub stages: Vec<StageReport>,
    pub failure_detail: Option<FailureDetail>,
    pub evidence_chain: Vec<Evidence>,
}

impl ReproReport {
    pub fn new(cve_id: impl Into<String>) -> Self {
        Self {
            cve_id: cve_id.into(),
            generated_at: Utc::now(),
            final_result: None,
            stages: Vec::new(),
            failure_detail: None,
            evidence_chain: Vec::new(),
        }
    }

    /// Build a report from a finished executor run.
    ///
    /// Every artifact whose name starts with `verification` becomes evidence
    /// on success.
    pub fn from_execution(
        cve_id: impl Into<String>,
        records: &[StepRecord],
        result: &ExecutorResult<Artifacts>,
    ) -> Self {
        let mut report = Self::new(cve_id);
        let failed_detail = result.as_ref().err().map(|e| e.diagnosis());

        for record in records {
            let failed = record.status == StepStatus::Failed;
            report.record_stage(StageReport {
                name: record.step_id.clone(),
                success: !failed,
                duration_seconds: record.duration_ms as f64 / 1000.0,
                outputs: record.outputs.clone(),
                failure_detail: if failed { failed_detail.clone() } else { None },
            });
        }

        match result {
            Ok(artifacts) => {
                for (name, value) in artifacts.iter().filter(|(n, _)| n.starts_with("verification")) {
                    report.add_evidence(name, value.clone(), 1.0);
                }
                report.finalize(FinalResult::Success);
            }
            Err(_) => {
                if report.failure_detail.is_none() {
                    report.failure_detail = failed_detail;
                }
                report.finalize(FinalResult::Failed);
            }
        }
        report
    }

    /// Record (or replace) a stage. A failed stage's diagnosis becomes the
    /// report's failure detail.
    pub fn record_stage(&mut self, stage: StageReport) {
        if !stage.success {
            if let Some(detail) = &stage.failure_detail {
                self.failure_detail = Some(detail.clone());
            }
        }
        match self.stages.iter_mut().find(|s| s.name == stage.name) {
            Some(existing) => *existing = stage,
            None => self.stages.push(stage),
        }
    }

    pub fn add_evidence(&mut self, kind: impl Into<String>, data: Value, confidence: f64) {
        self.evidence_chain.push(Evidence {
            kind: kind.into(),
            data,
            confidence: confidence.clamp(0.0, 1.0),
        });
    }

    pub fn finalize(&mut self, result: FinalResult) {
        self.final_result = Some(result);
        self.generated_at = Utc::now();
    }

    pub fn is_success(&self) -> bool {
        self.final_result == Some(FinalResult::Success)
    }

    /// Human-readable one-paragraph summary.
    pub fn summary(&self) -> String {
        match (self.final_result, &self.failure_detail) {
            (Some(FinalResult::Success), _) => format!(
                "{} reproduced successfully with {} evidence item(s)",
                self.cve_id,
                self.evidence_chain.len()
            ),
            (Some(FinalResult::Partial), _) => format!(
                "{} partially reproduced: {} of {} stage(s) succeeded",
                self.cve_id,
                self.stages.iter().filter(|s| s.success).count(),
                self.stages.len()
            ),
            (_, Some(detail)) => {
                let mut out = format!("{} reproduction failed\n", self.cve_id);
                let _ = writeln!(
                    out,
                    "  code: {} ({})",
                    detail.failure_code.code(),
                    detail.failure_code.name()
                );
                let _ = writeln!(out, "  reason: {}", detail.message);
                let _ = write!(
                    out,
                    "  suggestion: {}",
                    detail.suggested_action.as_deref().unwrap_or("none")
                );
                out
            }
            (_, None) => format!("{} reproduction failed (unknown reason)", self.cve_id),
        }
    }

    /// Row for the aggregate results ledger.
    pub fn to_run_record(&self, cost: f64, model: &str) -> RunRecord {
        let elapsed: f64 = self.stages.iter().map(|s| s.duration_seconds).sum();
        let reason = match &self.failure_detail {
            Some(detail) if !self.is_success() => detail.failure_code.label(),
            _ => "N/A".to_string(),
        };
        RunRecord {
            success: self.is_success(),
            reason,
            cost,
            time: elapsed,
            model: model.to_string(),
        }
    }

    /// Write the report as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("serialize repro report")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(path, content).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}
