//! Error types for the phase-gate core.
//!
//! Every operation returns these as values. Only [`PhaseGateError::IdCollision`]
//! is meant to abort the caller; the CLI turns everything else into an
//! itemized report.

use crate::evidence::ComplianceViolation;
use crate::gate::Check;
use crate::namespace::NamespaceStatus;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T, E = PhaseGateError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PhaseGateError {
    /// The generated namespace id already exists on disk.
    #[error("namespace id collision: '{id}' already exists")]
    IdCollision { id: String },

    #[error(
        "phase out of order for {namespace_id}: cannot move from '{from}' to '{to}'{}",
        expected_suffix(.expected)
    )]
    PhaseOutOfOrder {
        namespace_id: String,
        from: String,
        to: String,
        expected: Option<String>,
    },

    #[error("gate checks failed for phase '{phase}': {}", failing_summary(.checks))]
    GateCheckFailed { phase: String, checks: Vec<Check> },

    /// `sign_gate` was called while validation still reports failures.
    #[error("gate for phase '{phase}' is not ready to sign: {}", failing_summary(.checks))]
    GateNotReady { phase: String, checks: Vec<Check> },

    #[error("signature mismatch for gate '{phase}' of {namespace_id}")]
    SignatureMismatch { namespace_id: String, phase: String },

    #[error("group '{candidate}' conflicts with running group(s): {}", .running.join(", "))]
    ConflictDetected {
        candidate: String,
        running: Vec<String>,
    },

    #[error("group '{group_id}' declares overly broad conflict path '{pattern}'")]
    OverlyBroadDeclaration { group_id: String, pattern: String },

    #[error("{} agent compliance violation(s)", .violations.len())]
    ComplianceViolation { violations: Vec<ComplianceViolation> },

    #[error("central index is stale: {reason}")]
    IndexStale { reason: String },

    #[error("timed out after {waited_ms} ms waiting for lock {}", .path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("namespace '{id}' not found")]
    NamespaceNotFound { id: String },

    #[error("namespace '{id}' is {status:?} and can no longer change")]
    NamespaceInactive { id: String, status: NamespaceStatus },

    #[error("unknown phase '{phase}'")]
    UnknownPhase { phase: String },

    #[error("phase '{phase}' of {namespace_id} has no verified gate")]
    GateRequired { namespace_id: String, phase: String },

    /// The gate predates the current visit of a phase re-entered by rollback.
    #[error(
        "gate for phase '{phase}' of {namespace_id} was signed at {signed_at}, \
         before the phase was re-entered at {entered_at}"
    )]
    GateStale {
        namespace_id: String,
        phase: String,
        signed_at: DateTime<Utc>,
        entered_at: DateTime<Utc>,
    },

    #[error("gate for phase '{phase}' of {namespace_id} was already signed")]
    GateAlreadySigned { namespace_id: String, phase: String },

    #[error("invalid conflict path pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("duplicate parallel group id '{group_id}'")]
    DuplicateGroup { group_id: String },

    #[error("invocation '{invocation_id}' not found in {namespace_id}")]
    InvocationNotFound {
        namespace_id: String,
        invocation_id: String,
    },

    #[error("legacy phase file {} was already imported as {id}", .legacy_path.display())]
    AlreadyMigrated { legacy_path: PathBuf, id: String },

    #[error("unrecognized legacy phase file {}: {message}", .path.display())]
    LegacyFormat { path: PathBuf, message: String },

    #[error("workspace probe failed: {message}")]
    Probe { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record {}: {source}", .path.display())]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PhaseGateError {
    /// Returns a closure mapping an `io::Error` to [`PhaseGateError::Io`] for `path`.
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn serde(path: &Path) -> impl FnOnce(serde_json::Error) -> Self + '_ {
        move |source| Self::Serde {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn expected_suffix(expected: &Option<String>) -> String {
    match expected {
        Some(next) => format!(" (next allowed phase is '{}')", next),
        None => " (already at the final phase)".to_string(),
    }
}

fn failing_summary(checks: &[Check]) -> String {
    let failing: Vec<&str> = checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| c.kind.as_str())
        .collect();
    if failing.is_empty() {
        "no failing checks".to_string()
    } else {
        failing.join(", ")
    }
}
