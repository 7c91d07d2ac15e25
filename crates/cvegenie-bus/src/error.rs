//! Error types for cvegenie-bus

use thiserror::Error;

/// Errors that can occur while persisting events, artifacts or run rows.
#[derive(Error, Debug)]
pub enum BusError {
    /// Filesystem error
    #[error("I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Results ledger error
    #[error("Results ledger write failed: {0}")]
    Csv(#[from] csv::Error),

    /// Artifact was never stored for this step
    #[error("Artifact not found: {step_id}/{artifact_name}")]
    ArtifactNotFound {
        step_id: String,
        artifact_name: String,
    },

    /// Atomic rename of a temp file failed
    #[error("Failed to persist {path}: {reason}")]
    Persist { path: String, reason: String },

    /// Step id, artifact name or CVE id would resolve outside its directory
    #[error("Invalid {field} {value:?}: must be a relative path without '..'")]
    InvalidPath { field: &'static str, value: String },

    /// Text artifact was not valid UTF-8
    #[error("Artifact {artifact_name} is not valid UTF-8")]
    InvalidText { artifact_name: String },
}

/// Result type for bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;
