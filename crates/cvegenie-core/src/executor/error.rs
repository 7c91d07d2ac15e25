//! Error types for plan execution.

use std::fmt;

use serde::Serialize;

use crate::failure::{FailureAnalyzer, FailureDetail};
use crate::plan::PlanError;

/// Why a step failed for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// The step's implementation is not registered. Never retried.
    ImplementationNotFound,
    /// The capability returned an error, panicked, or its outputs could not
    /// be persisted.
    CapabilityFailed,
    /// The capability ran but its success condition did not hold.
    SuccessConditionFailed,
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepErrorKind::ImplementationNotFound => "implementation not found",
            StepErrorKind::CapabilityFailed => "capability failed",
            StepErrorKind::SuccessConditionFailed => "success condition failed",
        })
    }
}

/// Terminal failure of one step. Always non-retryable once it leaves the
/// executor's retry loop.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("step {step_id} failed after {attempts} attempt(s): {message}")]
pub struct StepError {
    pub step_id: String,
    pub kind: StepErrorKind,
    pub message: String,
    pub attempts: u32,
    pub retryable: bool,
    pub diagnosis: FailureDetail,
}

impl StepError {
    pub fn new(step_id: &str, kind: StepErrorKind, message: impl Into<String>, attempts: u32) -> Self {
        let message = message.into();
        Self {
            step_id: step_id.to_string(),
            kind,
            diagnosis: FailureAnalyzer::analyze(&message),
            message,
            attempts,
            retryable: false,
        }
    }
}

/// Errors returned by [`crate::executor::DagExecutor::execute`].
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Plan structure rejected before any step ran.
    #[error("invalid plan: {0}")]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Step(Box<StepError>),

    #[error("executor has already run; build a new one for another execution")]
    AlreadyExecuted,
}

impl ExecutorError {
    /// Advisory classification of this error.
    pub fn diagnosis(&self) -> FailureDetail {
        match self {
            ExecutorError::Step(step) => step.diagnosis.clone(),
            other => FailureAnalyzer::analyze(&other.to_string()),
        }
    }

    /// Failed step, when the error came from one.
    pub fn step_error(&self) -> Option<&StepError> {
        match self {
            ExecutorError::Step(step) => Some(step),
            _ => None,
        }
    }
}

impl From<StepError> for ExecutorError {
    fn from(e: StepError) -> Self {
        ExecutorError::Step(Box::new(e))
    }
}

/// Result type for executor operations.
pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;
