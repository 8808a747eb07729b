//! Import of a legacy global "current phase" file.
//!
//! Older setups kept a single phase for the whole repository, either as a
//! JSON object (`{"current_phase": "implement", ...}`) or as a bare phase
//! name on one line. Importing turns it into a namespace with status
//! `MIGRATED` whose phase history starts at the recorded phase.

use crate::engine::PhaseGate;
use crate::errors::{PhaseGateError, Result};
use crate::namespace::{NamespaceStatus, TaskNamespace};
use crate::phase::{Phase, PhaseEvent, PhaseRecord, TransitionKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const IMPORTED_PREFIX: &str = "Imported from ";
const DEFAULT_BRANCH: &str = "main";

/// Contents of a legacy phase file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LegacyPhaseFile {
    #[serde(alias = "phase")]
    pub current_phase: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default, alias = "task")]
    pub description: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl LegacyPhaseFile {
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(PhaseGateError::io(path))?;
        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self> {
        let trimmed = content.trim();
        if trimmed.starts_with('{') {
            return serde_json::from_str(trimmed).map_err(PhaseGateError::serde(path));
        }

        let format_error = |message: &str| PhaseGateError::LegacyFormat {
            path: path.to_path_buf(),
            message: message.to_string(),
        };
        if trimmed.is_empty() {
            return Err(format_error("file is empty"));
        }
        if trimmed.split_whitespace().count() != 1 {
            return Err(format_error("expected a JSON object or a single phase name"));
        }
        Ok(Self {
            current_phase: trimmed.to_string(),
            branch: None,
            description: None,
            updated_at: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationOutcome {
    pub namespace: TaskNamespace,
    pub phase: Phase,
    pub legacy_path: PathBuf,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum MigrationEvent<'a> {
    LegacyImported {
        legacy_path: &'a Path,
        phase: &'a str,
    },
}

impl PhaseGate {
    /// Imports `legacy_path` into a new MIGRATED namespace.
    ///
    /// A file is imported at most once; a second import fails with
    /// [`PhaseGateError::AlreadyMigrated`].
    pub fn migrate_legacy(&self, legacy_path: &Path) -> Result<MigrationOutcome> {
        let legacy_path = legacy_path
            .canonicalize()
            .map_err(PhaseGateError::io(legacy_path))?;
        let legacy = LegacyPhaseFile::read(&legacy_path)?;
        let phase = self.phases.phase_named(&legacy.current_phase)?;

        let marker = format!("{}{}", IMPORTED_PREFIX, legacy_path.display());
        let imported_from_here = |description: &str| {
            description == marker
                || description
                    .strip_prefix(marker.as_str())
                    .is_some_and(|rest| rest.starts_with(": "))
        };
        if let Some(existing) = self
            .namespaces
            .list_all()?
            .into_iter()
            .find(|ns| {
                ns.status == NamespaceStatus::Migrated && imported_from_here(&ns.description)
            })
        {
            return Err(PhaseGateError::AlreadyMigrated {
                legacy_path,
                id: existing.id.to_string(),
            });
        }

        let description = match &legacy.description {
            Some(task) => format!("{}: {}", marker, task),
            None => marker,
        };
        let branch = legacy.branch.as_deref().unwrap_or(DEFAULT_BRANCH);
        let namespace = self.namespaces.create_with_status(
            &description,
            branch,
            None,
            NamespaceStatus::Migrated,
        )?;

        let lock = self.namespaces.lock(&namespace.id)?;
        let record = PhaseRecord::starting_at(
            namespace.id.clone(),
            &self.config,
            phase.ordinal,
            TransitionKind::Imported,
            legacy.updated_at.unwrap_or(namespace.created_at),
        );
        self.phases.write_record(&lock, &record)?;
        self.sync_index(&lock, &namespace);

        self.logger.log_namespace_created(&namespace);
        self.logger.log_phase_event(
            &namespace.id,
            &PhaseEvent::PhaseChanged {
                from: String::new(),
                to: phase.name.clone(),
                transition: TransitionKind::Imported,
            },
        );
        self.logger.log(
            "Migration",
            Some(&namespace.id),
            MigrationEvent::LegacyImported {
                legacy_path: &legacy_path,
                phase: &phase.name,
            },
        );
        tracing::debug!(
            "Imported {} into namespace {} at phase {}",
            legacy_path.display(),
            namespace.id,
            phase.name
        );

        Ok(MigrationOutcome {
            namespace,
            phase,
            legacy_path,
        })
    }
}

#[cfg(test)]
#[path = "tests/migration_tests.rs"]
mod tests;
