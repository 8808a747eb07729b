//! Task namespaces: isolated, per-task working state.
//!
//! A namespace is a directory under `namespaces/<id>/`. Creation is an
//! exclusive create-only `mkdir`, so two processes can never both believe
//! they own the same id. After creation, any process holding the id may
//! mutate the namespace while holding its [`NamespaceLock`].

mod id;

pub use id::{compose_id, FixedIdSource, IdSource, SystemIdSource, ID_TIMESTAMP_FORMAT};

use crate::errors::{PhaseGateError, Result};
use crate::lock::LockGuard;
use crate::paths::StorePaths;
use crate::records::{self, CreateOutcome};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

const MAX_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(String);

impl NamespaceId {
    /// Validates an id received from a caller or read from a directory name.
    pub fn parse(raw: &str) -> Result<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_ID_LEN
            && !raw.starts_with('.')
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(PhaseGateError::NamespaceNotFound {
                id: raw.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The coarse creation timestamp embedded in generated ids, if present.
    pub fn created_stamp(&self) -> Option<DateTime<Utc>> {
        let prefix = self.0.get(..15)?;
        NaiveDateTime::parse_from_str(prefix, ID_TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

impl Display for NamespaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NamespaceStatus {
    Active,
    Completed,
    Migrated,
    Tombstoned,
}

impl NamespaceStatus {
    /// Whether phases and gates of a namespace in this status may still change.
    pub fn is_mutable(self) -> bool {
        matches!(self, Self::Active | Self::Migrated)
    }
}

/// `namespaces/<id>/metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNamespace {
    pub id: NamespaceId,
    #[serde(default)]
    pub parent_id: Option<NamespaceId>,
    pub branch: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub status: NamespaceStatus,
    /// Millisecond watermark, strictly increasing on every mutation.
    pub last_updated: u64,
}

/// `namespaces/<id>/tombstone.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub deleted_at: DateTime<Utc>,
    pub deleted_by: String,
    pub reason: String,
    /// Status the namespace had when it was archived.
    pub final_status: NamespaceStatus,
}

/// Proof that the caller holds a namespace's advisory lock.
#[derive(Debug)]
pub struct NamespaceLock {
    id: NamespaceId,
    _guard: LockGuard,
}

impl NamespaceLock {
    pub fn id(&self) -> &NamespaceId {
        &self.id
    }
}

/// Next value of a `last_updated` watermark: wall-clock millis, but never below `previous + 1`.
pub fn next_watermark(previous: u64) -> u64 {
    let now = Utc::now().timestamp_millis().max(0) as u64;
    now.max(previous.saturating_add(1))
}

#[derive(Clone)]
pub struct NamespaceManager {
    paths: StorePaths,
    ids: Arc<dyn IdSource>,
    lock_timeout: Duration,
}

impl NamespaceManager {
    pub fn new(paths: StorePaths, ids: Arc<dyn IdSource>, lock_timeout: Duration) -> Self {
        Self {
            paths,
            ids,
            lock_timeout,
        }
    }

    /// Allocates a new ACTIVE namespace.
    ///
    /// Fails with [`PhaseGateError::IdCollision`] if the generated id already
    /// exists. The call is never retried with a fresh id: a collision points at
    /// a broken clock or entropy source and must stay visible.
    pub fn create(
        &self,
        description: &str,
        branch: &str,
        parent_id: Option<&NamespaceId>,
    ) -> Result<TaskNamespace> {
        self.create_with_status(description, branch, parent_id, NamespaceStatus::Active)
    }

    pub(crate) fn create_with_status(
        &self,
        description: &str,
        branch: &str,
        parent_id: Option<&NamespaceId>,
        status: NamespaceStatus,
    ) -> Result<TaskNamespace> {
        if let Some(parent) = parent_id {
            self.get(parent)?;
        }

        let root = self.paths.namespaces_dir();
        std::fs::create_dir_all(&root).map_err(PhaseGateError::io(&root))?;

        let id = self.ids.next_id();
        let dir = self.paths.namespace_dir(id.as_str());
        match std::fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::warn!("Namespace id collision on {}", id);
                return Err(PhaseGateError::IdCollision { id: id.to_string() });
            }
            Err(e) => return Err(PhaseGateError::io(&dir)(e)),
        }

        let namespace = TaskNamespace {
            id,
            parent_id: parent_id.cloned(),
            branch: branch.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            status,
            last_updated: next_watermark(0),
        };
        records::write_json_atomic(
            &self.paths.metadata_path(namespace.id.as_str()),
            &namespace,
        )?;

        tracing::debug!("Created namespace {} on branch {}", namespace.id, branch);
        Ok(namespace)
    }

    pub fn get(&self, id: &NamespaceId) -> Result<TaskNamespace> {
        records::read_json(&self.paths.metadata_path(id.as_str()))?.ok_or_else(|| {
            PhaseGateError::NamespaceNotFound { id: id.to_string() }
        })
    }

    pub fn exists(&self, id: &NamespaceId) -> bool {
        self.paths.metadata_path(id.as_str()).is_file()
    }

    /// Ids of every namespace directory that holds metadata, sorted.
    pub fn list_ids(&self) -> Result<Vec<NamespaceId>> {
        let root = self.paths.namespaces_dir();
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PhaseGateError::io(&root)(e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(PhaseGateError::io(&root))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(id) = NamespaceId::parse(name) else { continue };
            if self.exists(&id) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Every namespace, including completed and tombstoned ones. Unreadable
    /// metadata is skipped with a warning.
    pub fn list_all(&self) -> Result<Vec<TaskNamespace>> {
        let mut namespaces = Vec::new();
        for id in self.list_ids()? {
            match self.get(&id) {
                Ok(ns) => namespaces.push(ns),
                Err(e) => tracing::warn!("Skipping unreadable namespace {}: {}", id, e),
            }
        }
        Ok(namespaces)
    }

    pub fn list_active(&self) -> Result<Vec<TaskNamespace>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|ns| ns.status == NamespaceStatus::Active)
            .collect())
    }

    /// Acquires the namespace's advisory lock, bounded by the configured timeout.
    pub fn lock(&self, id: &NamespaceId) -> Result<NamespaceLock> {
        if !self.exists(id) {
            return Err(PhaseGateError::NamespaceNotFound { id: id.to_string() });
        }
        let guard = LockGuard::acquire(
            &self.paths.namespace_lock_path(id.as_str()),
            self.lock_timeout,
        )?;
        Ok(NamespaceLock {
            id: id.clone(),
            _guard: guard,
        })
    }

    /// Fails with [`PhaseGateError::NamespaceInactive`] unless phases may still change.
    pub fn ensure_mutable(&self, namespace: &TaskNamespace) -> Result<()> {
        if namespace.status.is_mutable() {
            Ok(())
        } else {
            Err(PhaseGateError::NamespaceInactive {
                id: namespace.id.to_string(),
                status: namespace.status,
            })
        }
    }

    /// Bumps the watermark and persists the metadata.
    pub(crate) fn save(&self, lock: &NamespaceLock, namespace: &mut TaskNamespace) -> Result<()> {
        debug_assert_eq!(lock.id(), &namespace.id);
        namespace.last_updated = next_watermark(namespace.last_updated);
        records::write_json_atomic(
            &self.paths.metadata_path(lock.id().as_str()),
            namespace,
        )
    }

    /// Records activity on a namespace without changing its status.
    pub(crate) fn touch(&self, lock: &NamespaceLock) -> Result<TaskNamespace> {
        let mut namespace = self.get(lock.id())?;
        self.save(lock, &mut namespace)?;
        Ok(namespace)
    }

    pub fn complete(&self, lock: &NamespaceLock) -> Result<TaskNamespace> {
        let mut namespace = self.get(lock.id())?;
        self.ensure_mutable(&namespace)?;
        namespace.status = NamespaceStatus::Completed;
        self.save(lock, &mut namespace)?;
        Ok(namespace)
    }

    /// Archives a namespace. Its directory and history stay on disk.
    pub fn tombstone(
        &self,
        lock: &NamespaceLock,
        reason: &str,
        deleted_by: &str,
    ) -> Result<(TaskNamespace, Tombstone)> {
        let mut namespace = self.get(lock.id())?;
        if namespace.status == NamespaceStatus::Tombstoned {
            return Err(PhaseGateError::NamespaceInactive {
                id: namespace.id.to_string(),
                status: namespace.status,
            });
        }

        let tombstone = Tombstone {
            deleted_at: Utc::now(),
            deleted_by: deleted_by.to_string(),
            reason: reason.to_string(),
            final_status: namespace.status,
        };
        let path = self.paths.tombstone_path(lock.id().as_str());
        if records::create_json_exclusive(&path, &tombstone)? == CreateOutcome::AlreadyExists {
            return Err(PhaseGateError::NamespaceInactive {
                id: namespace.id.to_string(),
                status: NamespaceStatus::Tombstoned,
            });
        }

        namespace.status = NamespaceStatus::Tombstoned;
        self.save(lock, &mut namespace)?;
        Ok((namespace, tombstone))
    }

    pub fn read_tombstone(&self, id: &NamespaceId) -> Result<Option<Tombstone>> {
        records::read_json(&self.paths.tombstone_path(id.as_str()))
    }
}

#[cfg(test)]
#[path = "tests/namespace_tests.rs"]
mod tests;
