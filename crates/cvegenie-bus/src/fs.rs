//! Filesystem-backed result bus.
//!
//! Layout under the shared root:
//!
//! ```text
//! <root>/results.csv                              aggregate ledger
//! <root>/<cve_id>/events.jsonl                    append-only event log
//! <root>/<cve_id>/artifacts/<step_id>/<name>.*    step-scoped artifacts
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::bus_traits::*;
use crate::error::{BusError, BusResult};

const EVENT_LOG: &str = "events.jsonl";
const RESULTS_LEDGER: &str = "results.csv";

/// Serializes ledger appends within the process so the header is written once.
static LEDGER_LOCK: Mutex<()> = Mutex::new(());

/// Result bus persisting to a shared directory tree.
pub struct FsResultBus {
    cve_id: String,
    shared_root: PathBuf,
    cve_dir: PathBuf,
    seq: AtomicU64,
    event_log: Mutex<Vec<BusEvent>>,
    subscribers: Mutex<Vec<SharedSubscriber>>,
}

impl FsResultBus {
    /// Create a bus for `cve_id` rooted at `shared_root`. Creates
    /// `<root>/<cve_id>/` if needed.
    pub fn new(cve_id: impl Into<String>, shared_root: impl AsRef<Path>) -> BusResult<Self> {
        let cve_id = cve_id.into();
        ensure_confined("cve_id", &cve_id)?;
        let shared_root = shared_root.as_ref().to_path_buf();
        let cve_dir = shared_root.join(&cve_id);
        fs::create_dir_all(&cve_dir)?;
        Ok(Self {
            cve_id,
            shared_root,
            cve_dir,
            seq: AtomicU64::new(1),
            event_log: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Directory holding this CVE's events and artifacts.
    pub fn cve_dir(&self) -> &Path {
        &self.cve_dir
    }

    /// Path of the aggregate results ledger.
    pub fn results_path(&self) -> PathBuf {
        self.shared_root.join(RESULTS_LEDGER)
    }

    /// Path of this CVE's event log.
    pub fn event_log_path(&self) -> PathBuf {
        self.cve_dir.join(EVENT_LOG)
    }

    /// Read every event persisted for this CVE, including earlier sessions.
    pub fn read_event_log(&self) -> BusResult<Vec<BusEvent>> {
        let path = self.event_log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(path)?;
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(BusError::from))
            .collect()
    }

    fn append_event_line(&self, event: &BusEvent) -> BusResult<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.event_log_path())?;
        // One write per line keeps concurrent appenders from interleaving.
        file.write_all(&line)?;
        Ok(())
    }
}

impl ResultBus for FsResultBus {
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

        if let Err(e) = self.append_event_line(&event) {
            warn!(cve_id = %self.cve_id, error = %e, "failed to append event log");
        }
        debug!(cve_id = %self.cve_id, seq = event.seq, event_type = %event.event_type, "event published");

        lock(&self.event_log).push(event.clone());
        notify_subscribers(&snapshot(&self.subscribers), &event);
    }

    fn subscribe(&self, subscriber: Subscriber) {
        lock(&self.subscribers).push(Arc::from(subscriber));
    }

    fn events(&self) -> Vec<BusEvent> {
        lock(&self.event_log).clone()
    }

    fn store_artifact(
        &self,
        step_id: &str,
        artifact_name: &str,
        content: &ArtifactContent,
    ) -> BusResult<PathBuf> {
        let path = self
            .cve_dir
            .join(artifact_relative_path(step_id, artifact_name, content.format())?);
        let dir = path.parent().unwrap_or(&self.cve_dir);
        fs::create_dir_all(dir)?;

        // Atomic write: temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&content.to_bytes()?)?;
        tmp.persist(&path).map_err(|e| BusError::Persist {
            path: path.display().to_string(),
            reason: e.error.to_string(),
        })?;

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
        let path = self
            .cve_dir
            .join(artifact_relative_path(step_id, artifact_name, format)?);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BusError::ArtifactNotFound {
                    step_id: step_id.to_string(),
                    artifact_name: artifact_name.to_string(),
                }
            } else {
                BusError::Io(e)
            }
        })?;
        ArtifactContent::from_bytes(format, artifact_name, bytes)
    }

    fn record_run(&self, record: &RunRecord) -> BusResult<()> {
        fs::create_dir_all(&self.shared_root)?;
        let _guard = lock(&LEDGER_LOCK);
        let path = self.results_path();
        let needs_header = !path.exists();

        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(Vec::new());
        writer.serialize(LedgerRow::new(&self.cve_id, record))?;
        let chunk = writer.into_inner().map_err(|e| BusError::Io(e.into_error()))?;

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&chunk)?;
        Ok(())
    }
}
