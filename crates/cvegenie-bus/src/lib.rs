//! cvegenie-bus: result bus for the CVE-Genie orchestration kernel
//!
//! ## Layer 0 - Events and Artifacts
//!
//! Every durable trace the executor leaves goes through a [`ResultBus`]:
//! an append-only event log, step-scoped artifacts, and an aggregate results
//! ledger.
//!
//! ## Key Components
//!
//! - `ResultBus`: backend-agnostic trait
//! - `FsResultBus`: shared-directory implementation (`events.jsonl`,
//!   `artifacts/`, `results.csv`)
//! - `MemoryResultBus`: in-memory fake satisfying the same contract

pub mod bus_traits;
mod error;
pub mod fakes;
mod fs;

pub use bus_traits::{
    artifact_relative_path, is_confined, ArtifactContent, ArtifactFormat, BusEvent, EventType,
    ResultBus, RunRecord, Subscriber,
};
pub use error::{BusError, BusResult};
pub use fakes::MemoryResultBus;
pub use fs::FsResultBus;
