//! Events emitted by the phase state machine.

use serde::{Deserialize, Serialize};

/// How a namespace entered its current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// The first configured phase, entered at creation.
    #[default]
    Initial,
    /// Immediate successor of the previous phase.
    Forward,
    /// Explicitly flagged jump ahead (or a flagged step to the successor).
    Override,
    /// Explicitly flagged re-entry of an earlier or the same phase.
    Rollback,
    /// Imported from a legacy global phase file.
    Imported,
}

impl TransitionKind {
    /// Whether entering a phase this way is an auditable irregularity.
    pub fn is_exception(self) -> bool {
        matches!(self, Self::Override | Self::Rollback)
    }
}

/// Events are logged to the audit trail after a transition is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PhaseEvent {
    PhaseChanged {
        from: String,
        to: String,
        transition: TransitionKind,
    },
    ComplianceException {
        from: String,
        to: String,
        transition: TransitionKind,
        reason: String,
    },
}
