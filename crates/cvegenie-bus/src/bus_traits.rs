//! Result bus trait and the records it carries
//!
//! The bus is the only channel through which the executor leaves a durable
//! trace:
//! - `publish_event`: append-only, CVE-scoped event log plus subscribers
//! - `store_artifact` / `load_artifact`: step-scoped artifact storage
//! - `record_run`: one normalized row per run in the aggregate results ledger
//!
//! Implementations must be `Send + Sync`; one bus may be shared by executors
//! for different CVEs. Two writers for the same CVE are the caller's problem.

use std::borrow::Cow;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{BusError, BusResult};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Kind of an event published on the bus.
///
/// `Custom(String)` is an escape hatch for collaborators (capabilities,
/// drivers) that want to log their own milestones on the same stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventType {
    PlanStart,
    PlanComplete,
    PlanFailed,
    StepStart,
    StepComplete,
    StepFailed,
    StepRetry,
    StepSkipped,
    ArtifactStored,
    ExecutionAnalysis,
    ImplementationSwitched,
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> Cow<'_, str> {
        let s = match self {
            EventType::PlanStart => "plan_start",
            EventType::PlanComplete => "plan_complete",
            EventType::PlanFailed => "plan_failed",
            EventType::StepStart => "step_start",
            EventType::StepComplete => "step_complete",
            EventType::StepFailed => "step_failed",
            EventType::StepRetry => "step_retry",
            EventType::StepSkipped => "step_skipped",
            EventType::ArtifactStored => "artifact_stored",
            EventType::ExecutionAnalysis => "execution_analysis",
            EventType::ImplementationSwitched => "implementation_switched",
            EventType::Custom(name) => return Cow::Borrowed(name.as_str()),
        };
        Cow::Borrowed(s)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "plan_start" => EventType::PlanStart,
            "plan_complete" => EventType::PlanComplete,
            "plan_failed" => EventType::PlanFailed,
            "step_start" => EventType::StepStart,
            "step_complete" => EventType::StepComplete,
            "step_failed" => EventType::StepFailed,
            "step_retry" => EventType::StepRetry,
            "step_skipped" => EventType::StepSkipped,
            "artifact_stored" => EventType::ArtifactStored,
            "execution_analysis" => EventType::ExecutionAnalysis,
            "implementation_switched" => EventType::ImplementationSwitched,
            _ => EventType::Custom(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().into_owned()
    }
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    /// Monotonic per-bus sequence number, starting at 1.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub cve_id: String,
    pub event_type: EventType,
    pub step_id: Option<String>,
    pub data: Value,
}

/// Callback notified after every published event.
///
/// Errors and panics raised by a subscriber are logged and swallowed.
pub type Subscriber = Box<dyn Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync>;

/// Registered form of a [`Subscriber`]; cloned out of the list before
/// notifying so a callback may publish or subscribe on the same bus.
pub(crate) type SharedSubscriber = Arc<dyn Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync>;

/// Lock `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Snapshot of the registered subscribers; the guard is released on return.
pub(crate) fn snapshot(subscribers: &Mutex<Vec<SharedSubscriber>>) -> Vec<SharedSubscriber> {
    lock(subscribers).clone()
}

/// Notify every subscriber, best-effort.
pub(crate) fn notify_subscribers(subscribers: &[SharedSubscriber], event: &BusEvent) {
    for (idx, subscriber) in subscribers.iter().enumerate() {
        match catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(subscriber = idx, event_type = %event.event_type, error = %e, "subscriber failed");
            }
            Err(_) => {
                warn!(subscriber = idx, event_type = %event.event_type, "subscriber panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// On-disk encoding of a stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Json,
    Text,
    Binary,
}

/// Artifact payload handed to [`ResultBus::store_artifact`].
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactContent {
    Json(Value),
    Text(String),
    Binary(Vec<u8>),
}

impl ArtifactContent {
    pub fn format(&self) -> ArtifactFormat {
        match self {
            ArtifactContent::Json(_) => ArtifactFormat::Json,
            ArtifactContent::Text(_) => ArtifactFormat::Text,
            ArtifactContent::Binary(_) => ArtifactFormat::Binary,
        }
    }

    /// Encode to the exact bytes written to storage.
    pub fn to_bytes(&self) -> BusResult<Vec<u8>> {
        Ok(match self {
            ArtifactContent::Json(v) => serde_json::to_vec_pretty(v)?,
            ArtifactContent::Text(s) => s.as_bytes().to_vec(),
            ArtifactContent::Binary(b) => b.clone(),
        })
    }

    /// Decode bytes previously produced by [`ArtifactContent::to_bytes`].
    pub fn from_bytes(
        format: ArtifactFormat,
        artifact_name: &str,
        bytes: Vec<u8>,
    ) -> BusResult<Self> {
        Ok(match format {
            ArtifactFormat::Json => ArtifactContent::Json(serde_json::from_slice(&bytes)?),
            ArtifactFormat::Text => ArtifactContent::Text(String::from_utf8(bytes).map_err(
                |_| crate::error::BusError::InvalidText {
                    artifact_name: artifact_name.to_string(),
                },
            )?),
            ArtifactFormat::Binary => ArtifactContent::Binary(bytes),
        })
    }
}

/// Whether `segment` stays below the directory it is joined onto: non-empty
/// and made only of normal components (no `..`, root or prefix).
pub fn is_confined(segment: &str) -> bool {
    !segment.is_empty()
        && Path::new(segment)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

pub(crate) fn ensure_confined(field: &'static str, value: &str) -> BusResult<()> {
    if is_confined(value) {
        Ok(())
    } else {
        Err(BusError::InvalidPath {
            field,
            value: value.to_string(),
        })
    }
}

/// Path of an artifact relative to the CVE directory:
/// `artifacts/<step_id>/<name>.json`, `.txt`, or bare `<name>` for binaries.
///
/// Fails with [`BusError::InvalidPath`] when either id would leave that
/// directory.
pub fn artifact_relative_path(
    step_id: &str,
    artifact_name: &str,
    format: ArtifactFormat,
) -> BusResult<PathBuf> {
    ensure_confined("step_id", step_id)?;
    ensure_confined("artifact_name", artifact_name)?;
    let file = match format {
        ArtifactFormat::Json => format!("{artifact_name}.json"),
        ArtifactFormat::Text => format!("{artifact_name}.txt"),
        ArtifactFormat::Binary => artifact_name.to_string(),
    };
    Ok(PathBuf::from("artifacts").join(step_id).join(file))
}

// ---------------------------------------------------------------------------
// Run ledger
// ---------------------------------------------------------------------------

/// Normalized outcome of one CVE run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub success: bool,
    pub reason: String,
    pub cost: f64,
    /// Wall-clock seconds.
    pub time: f64,
    pub model: String,
}

impl RunRecord {
    /// Normalize a loosely-typed result object.
    ///
    /// Accepts `success` as bool or `"true"`/`"True"`, `reason` falling back
    /// to `info_file` then `"N/A"`, numeric or numeric-string `cost`/`time`.
    pub fn from_result(result: &Value, default_model: &str) -> Self {
        let success = match result.get("success") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        };
        let reason = result
            .get("reason")
            .or_else(|| result.get("info_file"))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "N/A".to_string());
        let model = result
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(default_model)
            .to_string();

        Self {
            success,
            reason,
            cost: number_field(result, "cost"),
            time: number_field(result, "time"),
            model,
        }
    }
}

fn number_field(result: &Value, key: &str) -> f64 {
    match result.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Row layout of `results.csv`.
#[derive(Debug, Serialize)]
pub(crate) struct LedgerRow<'a> {
    #[serde(rename = "CVE")]
    pub cve: &'a str,
    #[serde(rename = "SUCCESS")]
    pub success: &'static str,
    #[serde(rename = "REASON")]
    pub reason: &'a str,
    #[serde(rename = "COST")]
    pub cost: f64,
    #[serde(rename = "TIME")]
    pub time: f64,
    #[serde(rename = "MODEL")]
    pub model: &'a str,
}

impl<'a> LedgerRow<'a> {
    pub fn new(cve: &'a str, record: &'a RunRecord) -> Self {
        Self {
            cve,
            success: if record.success { "True" } else { "False" },
            reason: &record.reason,
            cost: record.cost,
            time: record.time,
            model: &record.model,
        }
    }
}

// ---------------------------------------------------------------------------
// ResultBus
// ---------------------------------------------------------------------------

/// Event and artifact sink the executor writes through.
pub trait ResultBus: Send + Sync {
    /// CVE this bus is scoped to.
    fn cve_id(&self) -> &str;

    /// Append a timestamped event and notify subscribers.
    ///
    /// Never fails: persistence problems are logged, subscriber errors are
    /// swallowed.
    fn publish_event(&self, event_type: EventType, step_id: Option<&str>, data: Value);

    /// Register a subscriber for subsequently published events.
    fn subscribe(&self, subscriber: Subscriber);

    /// Snapshot of the events published through this bus instance.
    fn events(&self) -> Vec<BusEvent>;

    /// Persist a step-scoped artifact and return where it landed.
    fn store_artifact(
        &self,
        step_id: &str,
        artifact_name: &str,
        content: &ArtifactContent,
    ) -> BusResult<PathBuf>;

    /// Load an artifact previously written by [`ResultBus::store_artifact`].
    fn load_artifact(
        &self,
        step_id: &str,
        artifact_name: &str,
        format: ArtifactFormat,
    ) -> BusResult<ArtifactContent>;

    /// Append one row to the aggregate results ledger.
    fn record_run(&self, record: &RunRecord) -> BusResult<()>;
}
