//! Error types for plan construction, persistence and structure checks.

/// Errors produced while building, loading or scheduling a plan.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("plan contains a dependency cycle through steps: {}", steps.join(", "))]
    DependencyCycle { steps: Vec<String> },

    #[error("step {step} requires unknown step {requires}")]
    UnknownDependency { step: String, requires: String },

    #[error("duplicate step id {step}")]
    DuplicateStep { step: String },

    #[error("step {step} names {name:?}, which is not a plain relative path")]
    UnsafePath { step: String, name: String },

    #[error("no plan template for profile {profile} in {location}")]
    SourceNotFound { profile: String, location: String },

    #[error("malformed plan template: {0}")]
    Template(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<serde_yaml::Error> for PlanError {
    fn from(e: serde_yaml::Error) -> Self {
        PlanError::Template(e.to_string())
    }
}

/// Result type for plan operations.
pub type PlanResult<T> = std::result::Result<T, PlanError>;
