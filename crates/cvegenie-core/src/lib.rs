//! CVE-Genie Core Library
//!
//! Planner/executor kernel: classify a CVE record into a profile, compile a
//! step graph for it, and run that graph against pluggable capabilities.
//!
//! ## Layer 1 - Planning and Execution
//!
//! - `classifier`: `(cve_id, record) -> ClassifierDecision`
//! - `builder`: `ClassifierDecision -> ExecutionPlan` (programmatic or YAML)
//! - `executor`: topological DAG execution with retries, guards and a
//!   restricted success-condition language
//! - `failure`: advisory failure taxonomy
//! - `report`: per-run reproduction report

pub mod builder;
pub mod capability;
pub mod classifier;
pub mod config;
pub mod executor;
pub mod failure;
pub mod metrics;
pub mod obs;
pub mod plan;
pub mod report;
pub mod telemetry;

pub use builder::{ImplementationOverrides, PlanBuilder, PlanSource, TemplatePlanSource};
pub use capability::{
    Artifacts, Capability, CapabilityFactory, CapabilityRegistry, FnCapability, RegistryError,
};
pub use classifier::{
    required_capabilities, Classifier, ClassifierConfig, FallbackClassifier, FallibleClassifier,
    RuleBasedClassifier,
};
pub use config::{ConfigError, GenieConfig, LoggingConfig};
pub use executor::condition::{Condition, ConditionError};
pub use executor::{
    DagExecutor, ExecutorError, ExecutorResult, Sleeper, StepError, StepErrorKind, StepRecord,
    StepStatus, ThreadSleeper,
};
pub use failure::{FailureAnalyzer, FailureCategory, FailureCode, FailureDetail};
pub use plan::{
    ArtifactKind, ClassifierDecision, ExecutionPlan, HintValue, PlanArtifact, PlanError,
    PlanIssue, PlanResult, PlanStep, Profile, ResourceHints, RetryPolicy, StepConfig,
    PLAN_SCHEMA,
};
pub use report::{FinalResult, ReproReport};

pub use cvegenie_bus::{
    ArtifactContent, ArtifactFormat, BusError, BusEvent, EventType, FsResultBus, MemoryResultBus,
    ResultBus, RunRecord,
};

/// Crate version, recorded in run metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
