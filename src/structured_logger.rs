//! Structured JSONL audit log.
//!
//! Every durable change (namespace creation, phase transitions, override
//! exceptions, gate signatures, tombstones, index rebuilds) is appended to
//! `audit/events.jsonl` with:
//! - A per-process monotonic sequence number plus the process id
//! - ISO 8601 timestamps with microsecond precision
//! - The namespace the entry concerns, when there is one
//!
//! Several processes append to the same file; each line is written with a
//! single `write` on an append-mode handle.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::gate::Gate;
use crate::namespace::{NamespaceId, TaskNamespace, Tombstone};
use crate::phase::PhaseEvent;

pub struct StructuredLogger {
    pid: u32,
    seq: AtomicU64,
    log_file: Mutex<File>,
    log_path: PathBuf,
}

/// A single audit entry in JSONL format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Sequence number, monotonic within one process
    pub seq: u64,
    /// ISO 8601 timestamp with microseconds
    pub ts: String,
    /// Writing process
    pub pid: u32,
    /// Component that emitted the entry
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_id: Option<String>,
    /// Structured event data
    pub event: Value,
}

impl StructuredLogger {
    /// Creates a logger appending to `<audit_dir>/events.jsonl`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The audit directory cannot be created
    /// - The log file cannot be opened
    pub fn new(audit_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(audit_dir)?;
        let log_path = audit_dir.join("events.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            pid: std::process::id(),
            seq: AtomicU64::new(0),
            log_file: Mutex::new(file),
            log_path,
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Logs a structured event. Write failures are swallowed; auditing never blocks the workflow.
    pub fn log(&self, component: &str, namespace_id: Option<&NamespaceId>, event: impl Serialize) {
        let entry = LogEntry {
            seq: self.next_seq(),
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            pid: self.pid,
            component: component.to_string(),
            namespace_id: namespace_id.map(|id| id.to_string()),
            event: serde_json::to_value(event).unwrap_or(Value::Null),
        };

        if let Ok(mut file) = self.log_file.lock() {
            if let Ok(mut line) = serde_json::to_string(&entry) {
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()) {
                    tracing::warn!("Failed to append audit entry: {}", e);
                }
            }
        }
    }

    pub fn log_namespace_created(&self, namespace: &TaskNamespace) {
        self.log(
            "Namespace",
            Some(&namespace.id),
            serde_json::json!({
                "type": "Created",
                "parent_id": namespace.parent_id,
                "branch": namespace.branch,
                "status": namespace.status,
            }),
        );
    }

    pub fn log_status_changed(&self, namespace: &TaskNamespace) {
        self.log(
            "Namespace",
            Some(&namespace.id),
            serde_json::json!({
                "type": "StatusChanged",
                "status": namespace.status,
            }),
        );
    }

    pub fn log_tombstone(&self, namespace_id: &NamespaceId, tombstone: &Tombstone) {
        self.log(
            "Namespace",
            Some(namespace_id),
            serde_json::json!({
                "type": "Tombstoned",
                "tombstone": tombstone,
            }),
        );
    }

    pub fn log_phase_event(&self, namespace_id: &NamespaceId, event: &PhaseEvent) {
        self.log("Phase", Some(namespace_id), event);
    }

    pub fn log_gate_signed(&self, gate: &Gate) {
        self.log(
            "Gate",
            Some(&gate.namespace_id),
            serde_json::json!({
                "type": "Signed",
                "phase": gate.phase,
                "head_ref": gate.head_ref,
                "signer": gate.signer,
                "content_hash": gate.content_hash,
            }),
        );
    }

    pub fn log_index_rebuild(&self, entries: usize, reason: &str) {
        self.log(
            "Index",
            None,
            serde_json::json!({
                "type": "Rebuilt",
                "entries": entries,
                "reason": reason,
            }),
        );
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

/// Reads all parseable audit entries, optionally only those for one namespace.
pub fn read_entries(
    log_path: &Path,
    namespace_id: Option<&NamespaceId>,
) -> anyhow::Result<Vec<LogEntry>> {
    let file = match File::open(log_path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let wanted = namespace_id.map(|id| id.to_string());
    let entries = BufReader::new(file)
        .lines()
        .map_while(|line| line.ok())
        .filter_map(|line| serde_json::from_str::<LogEntry>(&line).ok())
        .filter(|entry| match &wanted {
            Some(id) => entry.namespace_id.as_deref() == Some(id.as_str()),
            None => true,
        })
        .collect();

    Ok(entries)
}

#[cfg(test)]
#[path = "tests/structured_logger_tests.rs"]
mod tests;
