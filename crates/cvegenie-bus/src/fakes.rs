//! In-memory result bus (testing and embedding)
//!
//! `MemoryResultBus` satisfies the [`ResultBus`] contract without touching the
//! filesystem. Artifacts are kept encoded, exactly as `FsResultBus` would
//! write them, so round-trip behaviour matches.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};

use crate::bus_traits::*;
use crate::error::{BusError, BusResult};

#[derive(Default)]
struct MemoryState {
    events: Vec<BusEvent>,
    artifacts: HashMap<PathBuf, Vec<u8>>,
    runs: Vec<RunRecord>,
}

/// In-memory result bus backed by a mutex-guarded state.
pub struct MemoryResultBus {
    cve_id: String,
    seq: AtomicU64,
    state: Mutex<MemoryState>,
    subscribers: Mutex<Vec<SharedSubscriber>>,
}

impl MemoryResultBus {
    pub fn new(cve_id: impl Into<String>) -> Self {
        Self {
            cve_id: cve_id.into(),
            seq: AtomicU64::new(1),
            state: Mutex::new(MemoryState::default()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Rows appended through [`ResultBus::record_run`].
    pub fn runs(&self) -> Vec<RunRecord> {
        lock(&self.state).runs.clone()
    }

    /// Event types in publish order, e.g. for ordering assertions.
    pub fn event_types(&self) -> Vec<EventType> {
        lock(&self.state)
            .events
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    /// Events of one type, in publish order.
    pub fn events_of(&self, event_type: &EventType) -> Vec<BusEvent> {
        lock(&self.state)
            .events
            .iter()
            .filter(|e| &e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Number of stored artifacts.
    pub fn artifact_count(&self) -> usize {
        lock(&self.state).artifacts.len()
    }
}

impl ResultBus for MemoryResultBus {
    fn cve_id(&self) -> &str {
        &self.cve_id
    }

    fn publish_event(&self, event_type: EventType, step_id: Option<&str>, data: Value) {
        let event = BusEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            cve_id: self.cve_id.clone(),
            event_type,
            step_id: step_id.map(str::to_string),
            data,
        };
        lock(&self.state).events.push(event.clone());

        notify_subscribers(&snapshot(&self.subscribers), &event);
    }

    fn subscribe(&self, subscriber: Subscriber) {
        lock(&self.subscribers).push(Arc::from(subscriber));
    }

    fn events(&self) -> Vec<BusEvent> {
        lock(&self.state).events.clone()
    }

    fn store_artifact(
        &self,
        step_id: &str,
        artifact_name: &str,
        content: &ArtifactContent,
    ) -> BusResult<PathBuf> {
        let path = PathBuf::from(&self.cve_id).join(artifact_relative_path(
            step_id,
            artifact_name,
            content.format(),
        )?);
        let bytes = content.to_bytes()?;
        lock(&self.state).artifacts.insert(path.clone(), bytes);

        self.publish_event(
            EventType::ArtifactStored,
            Some(step_id),
            json!({ "artifact": artifact_name, "path": path.display().to_string() }),
        );
        Ok(path)
    }

    fn load_artifact(
        &self,
        step_id: &str,
        artifact_name: &str,
        format: ArtifactFormat,
    ) -> BusResult<ArtifactContent> {
        let path = PathBuf::from(&self.cve_id).join(artifact_relative_path(
            step_id,
            artifact_name,
            format,
        )?);
        let bytes = lock(&self.state)
            .artifacts
            .get(&path)
            .cloned()
            .ok_or_else(|| BusError::ArtifactNotFound {
                step_id: step_id.to_string(),
                artifact_name: artifact_name.to_string(),
            })?;
        ArtifactContent::from_bytes(format, artifact_name, bytes)
    }

    fn record_run(&self, record: &RunRecord) -> BusResult<()> {
        lock(&self.state).runs.push(record.clone());
        Ok(())
    }
}
