//! Central index: a cross-namespace cache of phase and status.
//!
//! `index.json` is never authoritative. Namespace records are the source of
//! truth and the index can always be rebuilt from them. Readers detect a
//! stale index through the `last_updated` watermarks and rebuild it once,
//! transparently.
//!
//! A namespace whose records cannot be read is listed under `unreadable`
//! instead of failing the whole index; it rejoins the entries on the next
//! rebuild after it is repaired.
//!
//! Lock order: a writer already holding a namespace lock takes the index
//! lock second, and holds it only for the read-modify-write of the file.

use crate::errors::{PhaseGateError, Result};
use crate::lock::LockGuard;
use crate::namespace::{
    NamespaceId, NamespaceLock, NamespaceManager, NamespaceStatus, TaskNamespace,
};
use crate::paths::StorePaths;
use crate::phase::PhaseMachine;
use crate::records;
use crate::structured_logger::StructuredLogger;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

pub const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub current_phase: String,
    pub status: NamespaceStatus,
    /// Copy of the namespace's watermark when the entry was written.
    pub last_updated: u64,
}

/// `index.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub version: u32,
    pub last_updated: u64,
    pub entries: BTreeMap<NamespaceId, IndexEntry>,
    /// Namespaces on disk whose metadata or phase record failed to load.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unreadable: BTreeSet<NamespaceId>,
}

impl Index {
    fn empty() -> Self {
        Self {
            version: INDEX_VERSION,
            last_updated: 0,
            entries: BTreeMap::new(),
            unreadable: BTreeSet::new(),
        }
    }
}

#[derive(Clone)]
pub struct CentralIndex {
    paths: StorePaths,
    namespaces: NamespaceManager,
    phases: PhaseMachine,
    lock_timeout: Duration,
    logger: Option<Arc<StructuredLogger>>,
}

impl CentralIndex {
    pub fn new(
        paths: StorePaths,
        namespaces: NamespaceManager,
        phases: PhaseMachine,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            paths,
            namespaces,
            phases,
            lock_timeout,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: Arc<StructuredLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    fn lock(&self) -> Result<LockGuard> {
        LockGuard::acquire(&self.paths.index_lock_path(), self.lock_timeout)
    }

    /// Records a namespace's new phase and status after a mutation.
    ///
    /// Requires the namespace lock; takes the index lock itself.
    pub fn update(
        &self,
        lock: &NamespaceLock,
        namespace: &TaskNamespace,
        phase: &str,
    ) -> Result<()> {
        debug_assert_eq!(lock.id(), &namespace.id);
        let _index_lock = self.lock()?;

        let mut index = match records::read_json::<Index>(&self.paths.index_path()) {
            Ok(Some(index)) if index.version == INDEX_VERSION => index,
            Ok(_) => Index::empty(),
            Err(e) => {
                tracing::warn!("Discarding unreadable index: {}", e);
                Index::empty()
            }
        };

        index.unreadable.remove(&namespace.id);
        index.entries.insert(
            namespace.id.clone(),
            IndexEntry {
                current_phase: phase.to_string(),
                status: namespace.status,
                last_updated: namespace.last_updated,
            },
        );
        index.last_updated = index.last_updated.max(namespace.last_updated);
        records::write_json_atomic(&self.paths.index_path(), &index)
    }

    /// Reconstructs the index from every namespace record and writes it.
    pub fn rebuild(&self) -> Result<Index> {
        let _index_lock = self.lock()?;
        self.rebuild_locked("requested")
    }

    fn rebuild_locked(&self, reason: &str) -> Result<Index> {
        let mut index = Index::empty();
        for id in self.namespaces.list_ids()? {
            let loaded = self
                .namespaces
                .get(&id)
                .and_then(|namespace| Ok((self.phases.get_phase(&id)?, namespace)));
            let (phase, namespace) = match loaded {
                Ok(loaded) => loaded,
                Err(e) => {
                    tracing::warn!("Leaving unreadable namespace {} out of the index: {}", id, e);
                    index.unreadable.insert(id);
                    continue;
                }
            };
            index.last_updated = index.last_updated.max(namespace.last_updated);
            index.entries.insert(
                id,
                IndexEntry {
                    current_phase: phase.name,
                    status: namespace.status,
                    last_updated: namespace.last_updated,
                },
            );
        }
        if let Some(oldest) = self.oldest_stamp_ms(&index) {
            index.last_updated = index.last_updated.max(oldest);
        }

        records::write_json_atomic(&self.paths.index_path(), &index)?;
        tracing::debug!(
            "Rebuilt index with {} entries, {} unreadable ({})",
            index.entries.len(),
            index.unreadable.len(),
            reason
        );
        if let Some(logger) = &self.logger {
            logger.log_index_rebuild(index.entries.len(), reason);
        }
        Ok(index)
    }

    fn oldest_stamp_ms(&self, index: &Index) -> Option<u64> {
        index
            .entries
            .keys()
            .filter_map(|id| id.created_stamp())
            .min()
            .map(|at| at.timestamp_millis().max(0) as u64)
    }

    fn read_cached(&self) -> Result<Index> {
        let stale = |reason: String| PhaseGateError::IndexStale { reason };

        let index = match records::read_json::<Index>(&self.paths.index_path()) {
            Ok(Some(index)) => index,
            Ok(None) => return Err(stale("index file missing".to_string())),
            Err(e) => return Err(stale(format!("index unreadable: {}", e))),
        };
        if index.version != INDEX_VERSION {
            return Err(stale(format!(
                "index version {} (expected {})",
                index.version, INDEX_VERSION
            )));
        }
        Ok(index)
    }

    /// The cached index, or [`PhaseGateError::IndexStale`] explaining why it cannot be trusted.
    ///
    /// Reads every namespace's metadata; single lookups go through [`CentralIndex::query`].
    pub fn check_fresh(&self) -> Result<Index> {
        let stale = |reason: String| PhaseGateError::IndexStale { reason };
        let index = self.read_cached()?;

        let on_disk: BTreeSet<NamespaceId> = self.namespaces.list_ids()?.into_iter().collect();
        let indexed: BTreeSet<NamespaceId> = index
            .entries
            .keys()
            .chain(index.unreadable.iter())
            .cloned()
            .collect();
        if on_disk != indexed {
            let missing = on_disk.difference(&indexed).count();
            let extra = indexed.difference(&on_disk).count();
            return Err(stale(format!(
                "namespace set differs ({} unindexed, {} unknown)",
                missing, extra
            )));
        }

        for id in &index.unreadable {
            if self.namespaces.get(id).is_ok() && self.phases.get_phase(id).is_ok() {
                return Err(stale(format!("namespace {} is readable again", id)));
            }
        }

        let mut newest = 0;
        for (id, entry) in &index.entries {
            let namespace = self
                .namespaces
                .get(id)
                .map_err(|e| stale(format!("namespace {} unreadable: {}", id, e)))?;
            if namespace.last_updated != entry.last_updated {
                return Err(stale(format!(
                    "entry {} at watermark {} but namespace at {}",
                    id, entry.last_updated, namespace.last_updated
                )));
            }
            newest = newest.max(entry.last_updated);
        }
        if index.last_updated < newest {
            return Err(stale(format!(
                "index watermark {} older than newest entry {}",
                index.last_updated, newest
            )));
        }
        if let Some(oldest) = self.oldest_stamp_ms(&index) {
            if index.last_updated < oldest {
                return Err(stale(format!(
                    "index watermark {} older than namespace creation {}",
                    index.last_updated, oldest
                )));
            }
        }

        Ok(index)
    }

    /// Serves the cached index, rebuilding it once if it is stale.
    pub fn query_all(&self) -> Result<Index> {
        match self.check_fresh() {
            Ok(index) => Ok(index),
            Err(PhaseGateError::IndexStale { reason }) => {
                tracing::debug!("Index stale: {}", reason);
                let _index_lock = self.lock()?;
                self.rebuild_locked(&reason)
            }
            Err(e) => Err(e),
        }
    }

    /// One namespace's entry. A cached entry whose watermark still matches the
    /// namespace is served without checking the rest of the index.
    pub fn query(&self, namespace_id: &NamespaceId) -> Result<IndexEntry> {
        if let Ok(mut index) = self.read_cached() {
            if let (Some(entry), Ok(namespace)) = (
                index.entries.remove(namespace_id),
                self.namespaces.get(namespace_id),
            ) {
                if entry.last_updated == namespace.last_updated {
                    return Ok(entry);
                }
            }
        }
        self.query_all()?
            .entries
            .remove(namespace_id)
            .ok_or_else(|| PhaseGateError::NamespaceNotFound {
                id: namespace_id.to_string(),
            })
    }
}

#[cfg(test)]
#[path = "tests/index_tests.rs"]
mod tests;
