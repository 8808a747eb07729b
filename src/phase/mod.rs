//! Per-namespace phase state machine.
//!
//! Each namespace owns its own `phase.json`; there is no global "current
//! phase". A transition is validated against the configured phase order,
//! persisted atomically while the caller holds the namespace lock, and then
//! reported as [`PhaseEvent`]s.

mod events;

pub use events::{PhaseEvent, TransitionKind};

use crate::config::WorkflowConfig;
use crate::errors::{PhaseGateError, Result};
use crate::gate::Gate;
use crate::namespace::{NamespaceId, NamespaceLock};
use crate::paths::StorePaths;
use crate::records;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A phase and its position in the configured order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub ordinal: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub phase: String,
    pub ordinal: usize,
    pub entered_at: DateTime<Utc>,
    #[serde(default)]
    pub exited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transition: TransitionKind,
    /// Present for override and rollback transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

/// `namespaces/<id>/phase.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub namespace_id: NamespaceId,
    /// Ordinal in the configured phase list.
    pub current_phase: usize,
    pub history: Vec<PhaseHistoryEntry>,
}

impl PhaseRecord {
    /// A namespace that has just entered `ordinal`.
    pub fn starting_at(
        namespace_id: NamespaceId,
        config: &WorkflowConfig,
        ordinal: usize,
        transition: TransitionKind,
        entered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            namespace_id,
            current_phase: ordinal,
            history: vec![PhaseHistoryEntry {
                phase: config.phases[ordinal].name.clone(),
                ordinal,
                entered_at,
                exited_at: None,
                transition,
                exception: None,
            }],
        }
    }

    /// How often `phase` has been entered. A phase not entered yet is on its first visit.
    pub fn visit_of(&self, phase: &str) -> u32 {
        let entered = self.history.iter().filter(|entry| entry.phase == phase).count();
        u32::try_from(entered).unwrap_or(u32::MAX).max(1)
    }

    /// Start of the current visit, when the current phase was entered before.
    pub fn reentered_at(&self) -> Option<DateTime<Utc>> {
        let last = self.history.last()?;
        (self.visit_of(&last.phase) > 1).then_some(last.entered_at)
    }

    /// History entries that were recorded as compliance exceptions.
    pub fn exceptions(&self) -> impl Iterator<Item = &PhaseHistoryEntry> {
        self.history.iter().filter(|entry| entry.exception.is_some())
    }
}

/// Evidence accompanying a transition request.
#[derive(Debug, Clone, Default)]
pub struct TransitionEvidence {
    /// Gate for the phase being left, if the caller already has it in hand.
    pub gate: Option<Gate>,
    /// Free-form justification; required wording for overrides is up to the caller.
    pub note: Option<String>,
}

#[derive(Clone)]
pub struct PhaseMachine {
    paths: StorePaths,
    config: Arc<WorkflowConfig>,
}

impl PhaseMachine {
    pub fn new(paths: StorePaths, config: Arc<WorkflowConfig>) -> Self {
        Self { paths, config }
    }

    /// Current phase of a namespace; the first configured phase if none was recorded.
    pub fn get_phase(&self, namespace_id: &NamespaceId) -> Result<Phase> {
        let record = self.load_record(namespace_id)?;
        self.phase_at(record.current_phase)
    }

    pub fn load_record(&self, namespace_id: &NamespaceId) -> Result<PhaseRecord> {
        let stored: Option<PhaseRecord> =
            records::read_json(&self.paths.phase_path(namespace_id.as_str()))?;
        match stored {
            Some(record) => {
                self.phase_at(record.current_phase)?;
                Ok(record)
            }
            None => Ok(PhaseRecord {
                namespace_id: namespace_id.clone(),
                current_phase: 0,
                history: Vec::new(),
            }),
        }
    }

    pub fn phase_named(&self, name: &str) -> Result<Phase> {
        self.config
            .phase_index(name)
            .map(|ordinal| Phase {
                name: name.to_string(),
                ordinal,
            })
            .ok_or_else(|| PhaseGateError::UnknownPhase {
                phase: name.to_string(),
            })
    }

    pub fn phase_at(&self, ordinal: usize) -> Result<Phase> {
        self.config
            .phases
            .get(ordinal)
            .map(|p| Phase {
                name: p.name.clone(),
                ordinal,
            })
            .ok_or_else(|| PhaseGateError::Config {
                message: format!(
                    "recorded phase ordinal {} is outside the {} configured phases",
                    ordinal,
                    self.config.phases.len()
                ),
            })
    }

    /// Validates a transition without applying it.
    pub fn check_transition(
        &self,
        record: &PhaseRecord,
        to: &Phase,
        override_: bool,
    ) -> Result<TransitionKind> {
        let current = record.current_phase;
        if override_ {
            return Ok(if to.ordinal <= current {
                TransitionKind::Rollback
            } else {
                TransitionKind::Override
            });
        }
        if to.ordinal == current + 1 {
            return Ok(TransitionKind::Forward);
        }

        Err(PhaseGateError::PhaseOutOfOrder {
            namespace_id: record.namespace_id.to_string(),
            from: self.phase_at(current)?.name,
            to: to.name.clone(),
            expected: self.phase_at(current + 1).ok().map(|p| p.name),
        })
    }

    /// Moves a namespace to `to_phase`.
    ///
    /// A regular forward step calls `exit_gate` with the phase being left and
    /// the record as it stands, so the caller can insist on a verified gate for
    /// the current visit; overrides skip it but are recorded as compliance
    /// exceptions.
    pub fn advance(
        &self,
        lock: &NamespaceLock,
        to_phase: &str,
        override_: bool,
        note: Option<&str>,
        exit_gate: impl FnOnce(&Phase, &PhaseRecord) -> Result<()>,
    ) -> Result<(Phase, Vec<PhaseEvent>)> {
        let mut record = self.load_record(lock.id())?;
        let from = self.phase_at(record.current_phase)?;
        let to = self.phase_named(to_phase)?;
        let kind = self.check_transition(&record, &to, override_)?;

        if kind == TransitionKind::Forward {
            exit_gate(&from, &record)?;
        }

        let now = Utc::now();
        if record.history.is_empty() {
            // Namespace never had a record: materialize the implicit first phase
            record = PhaseRecord::starting_at(
                lock.id().clone(),
                &self.config,
                record.current_phase,
                TransitionKind::Initial,
                now,
            );
        }
        if let Some(last) = record.history.last_mut() {
            last.exited_at = Some(now);
        }

        let exception = kind.is_exception().then(|| {
            note.map(str::to_string).unwrap_or_else(|| {
                format!("{:?} from '{}' to '{}' without justification", kind, from.name, to.name)
            })
        });
        record.history.push(PhaseHistoryEntry {
            phase: to.name.clone(),
            ordinal: to.ordinal,
            entered_at: now,
            exited_at: None,
            transition: kind,
            exception: exception.clone(),
        });
        record.current_phase = to.ordinal;

        self.write_record(lock, &record)?;

        let mut events = vec![PhaseEvent::PhaseChanged {
            from: from.name.clone(),
            to: to.name.clone(),
            transition: kind,
        }];
        if let Some(reason) = exception {
            tracing::warn!(
                "Compliance exception on {}: {} -> {} ({})",
                lock.id(),
                from.name,
                to.name,
                reason
            );
            events.push(PhaseEvent::ComplianceException {
                from: from.name,
                to: to.name.clone(),
                transition: kind,
                reason,
            });
        }

        Ok((to, events))
    }

    pub(crate) fn write_record(&self, lock: &NamespaceLock, record: &PhaseRecord) -> Result<()> {
        debug_assert_eq!(lock.id(), &record.namespace_id);
        records::write_json_atomic(&self.paths.phase_path(lock.id().as_str()), record)
    }
}
