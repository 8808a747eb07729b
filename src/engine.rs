//! The `PhaseGate` facade.
//!
//! Wires the namespace manager, phase machine, gate validator, evidence
//! collector, central index and conflict planner over one store, so that every
//! mutation also lands in the index and the audit trail.

use crate::config::{ChildGatePolicy, WorkflowConfig};
use crate::conflict::{ConflictPlanner, ExecutionPlan, ParallelGroup};
use crate::errors::{PhaseGateError, Result};
use crate::evidence::{ComplianceReport, EvidenceCollector, InvocationId, InvocationStatus};
use crate::gate::{Gate, GateResult, GateValidator, HmacSigner, Signer};
use crate::index::{CentralIndex, Index, IndexEntry};
use crate::namespace::{
    IdSource, NamespaceId, NamespaceLock, NamespaceManager, SystemIdSource, TaskNamespace,
    Tombstone,
};
use crate::paths::{StorePaths, STORE_DIR};
use crate::phase::{Phase, PhaseMachine, PhaseRecord, TransitionEvidence, TransitionKind};
use crate::probe::{self, WorkspaceProbe};
use crate::structured_logger::{self, LogEntry, StructuredLogger};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;

pub struct PhaseGateBuilder {
    store_root: PathBuf,
    workspace_root: Option<PathBuf>,
    config: Option<WorkflowConfig>,
    ids: Option<Arc<dyn IdSource>>,
    probe: Option<Arc<dyn WorkspaceProbe>>,
    signer: Option<Arc<dyn Signer>>,
}

impl PhaseGateBuilder {
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
            workspace_root: None,
            config: None,
            ids: None,
            probe: None,
            signer: None,
        }
    }

    /// Repository the gates inspect. Defaults to the parent of a `.phasegate`
    /// store, otherwise the current directory.
    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn id_source(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn WorkspaceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    fn default_workspace_root(&self) -> anyhow::Result<PathBuf> {
        if self.store_root.file_name().is_some_and(|name| name == STORE_DIR) {
            if let Some(parent) = self.store_root.parent() {
                if !parent.as_os_str().is_empty() {
                    return Ok(parent.to_path_buf());
                }
            }
        }
        std::env::current_dir().context("Failed to determine the current directory")
    }

    pub fn build(self) -> anyhow::Result<PhaseGate> {
        std::fs::create_dir_all(&self.store_root).with_context(|| {
            format!("Failed to create store root: {}", self.store_root.display())
        })?;
        let paths = StorePaths::new(&self.store_root);

        let config = match self.config.clone() {
            Some(config) => {
                config.validate()?;
                config
            }
            None => WorkflowConfig::resolve(paths.root())?,
        };
        let config = Arc::new(config);

        let probe = match self.probe.clone() {
            Some(probe) => probe,
            None => {
                let root = match &self.workspace_root {
                    Some(root) => root.clone(),
                    None => self.default_workspace_root()?,
                };
                Arc::from(probe::detect(&root))
            }
        };
        let signer = match self.signer.clone() {
            Some(signer) => signer,
            None => Arc::new(
                HmacSigner::load_or_create(&paths.signing_key_path())
                    .context("Failed to load the gate signing key")?,
            ),
        };
        let ids = self.ids.unwrap_or_else(|| Arc::new(SystemIdSource));

        let logger = Arc::new(
            StructuredLogger::new(&paths.audit_dir()).context("Failed to open the audit log")?,
        );
        let lock_timeout = config.lock_timeout();
        let namespaces = NamespaceManager::new(paths.clone(), ids, lock_timeout);
        let phases = PhaseMachine::new(paths.clone(), config.clone());
        let evidence = EvidenceCollector::new(
            paths.clone(),
            &config.orchestrator,
            config.staleness_threshold(),
            lock_timeout,
        );
        let gates = GateValidator::new(
            paths.clone(),
            config.clone(),
            probe,
            signer,
            evidence.clone(),
        );
        let index = CentralIndex::new(
            paths.clone(),
            namespaces.clone(),
            phases.clone(),
            lock_timeout,
        )
        .with_logger(logger.clone());
        let planner = ConflictPlanner::new(config.conflict.broad_policy);

        tracing::debug!("Opened phasegate store at {}", paths.root().display());
        Ok(PhaseGate {
            config,
            namespaces,
            phases,
            gates,
            evidence,
            index,
            planner,
            logger,
        })
    }
}

pub struct PhaseGate {
    pub(crate) config: Arc<WorkflowConfig>,
    pub(crate) namespaces: NamespaceManager,
    pub(crate) phases: PhaseMachine,
    gates: GateValidator,
    evidence: EvidenceCollector,
    pub(crate) index: CentralIndex,
    planner: ConflictPlanner,
    pub(crate) logger: Arc<StructuredLogger>,
}

impl PhaseGate {
    pub fn builder(store_root: impl Into<PathBuf>) -> PhaseGateBuilder {
        PhaseGateBuilder::new(store_root)
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Writes the namespace's index entry. Failures leave the index stale for
    /// the next reader to rebuild.
    pub(crate) fn sync_index(&self, lock: &NamespaceLock, namespace: &TaskNamespace) {
        let phase = match self.phases.get_phase(&namespace.id) {
            Ok(phase) => phase,
            Err(e) => {
                tracing::warn!("Index not updated for {}: {}", namespace.id, e);
                return;
            }
        };
        if let Err(e) = self.index.update(lock, namespace, &phase.name) {
            tracing::warn!("Index not updated for {}: {}", namespace.id, e);
        }
    }

    // ------------------------------------------------------------------
    // Namespaces
    // ------------------------------------------------------------------

    /// Creates an ACTIVE namespace in the first configured phase.
    pub fn create_namespace(
        &self,
        description: &str,
        branch: &str,
        parent_id: Option<&NamespaceId>,
    ) -> Result<TaskNamespace> {
        let namespace = self.namespaces.create(description, branch, parent_id)?;
        let lock = self.namespaces.lock(&namespace.id)?;
        let record = PhaseRecord::starting_at(
            namespace.id.clone(),
            &self.config,
            0,
            TransitionKind::Initial,
            namespace.created_at,
        );
        self.phases.write_record(&lock, &record)?;
        self.sync_index(&lock, &namespace);
        self.logger.log_namespace_created(&namespace);
        Ok(namespace)
    }

    pub fn get_namespace(&self, id: &NamespaceId) -> Result<TaskNamespace> {
        self.namespaces.get(id)
    }

    pub fn list_active(&self) -> Result<Vec<TaskNamespace>> {
        self.namespaces.list_active()
    }

    pub fn list_all(&self) -> Result<Vec<TaskNamespace>> {
        self.namespaces.list_all()
    }

    pub fn tombstone(
        &self,
        id: &NamespaceId,
        reason: &str,
        deleted_by: &str,
    ) -> Result<(TaskNamespace, Tombstone)> {
        let lock = self.namespaces.lock(id)?;
        let (namespace, tombstone) = self.namespaces.tombstone(&lock, reason, deleted_by)?;
        self.sync_index(&lock, &namespace);
        self.logger.log_tombstone(id, &tombstone);
        Ok((namespace, tombstone))
    }

    pub fn read_tombstone(&self, id: &NamespaceId) -> Result<Option<Tombstone>> {
        self.namespaces.read_tombstone(id)
    }

    pub fn complete(&self, id: &NamespaceId) -> Result<TaskNamespace> {
        let lock = self.namespaces.lock(id)?;
        let namespace = self.namespaces.complete(&lock)?;
        self.sync_index(&lock, &namespace);
        self.logger.log_status_changed(&namespace);
        Ok(namespace)
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    pub fn get_phase(&self, id: &NamespaceId) -> Result<Phase> {
        self.namespaces.get(id)?;
        self.phases.get_phase(id)
    }

    pub fn phase_record(&self, id: &NamespaceId) -> Result<PhaseRecord> {
        self.namespaces.get(id)?;
        self.phases.load_record(id)
    }

    /// Moves a namespace to `to_phase` under its lock.
    pub fn advance_phase(
        &self,
        id: &NamespaceId,
        to_phase: &str,
        evidence: TransitionEvidence,
        override_: bool,
    ) -> Result<Phase> {
        let lock = self.namespaces.lock(id)?;
        let namespace = self.namespaces.get(id)?;
        self.namespaces.ensure_mutable(&namespace)?;

        let (phase, events) = self.phases.advance(
            &lock,
            to_phase,
            override_,
            evidence.note.as_deref(),
            |from, record| {
                self.require_exit_gate(&namespace, from, record, evidence.gate.as_ref())
            },
        )?;

        let namespace = self.namespaces.touch(&lock)?;
        self.sync_index(&lock, &namespace);
        for event in &events {
            self.logger.log_phase_event(id, event);
        }
        tracing::debug!("Namespace {} entered phase {}", id, phase.name);
        Ok(phase)
    }

    fn require_exit_gate(
        &self,
        namespace: &TaskNamespace,
        from: &Phase,
        record: &PhaseRecord,
        supplied: Option<&Gate>,
    ) -> Result<()> {
        if !self.config.require_gate_to_advance {
            return Ok(());
        }
        let inherited_from = match self.config.child_gate_policy {
            ChildGatePolicy::Inherit => namespace.parent_id.as_ref(),
            ChildGatePolicy::Independent => None,
        };
        // After a rollback only gates signed during the current visit count
        let current_visit = |gate: &Gate| match record.reentered_at() {
            Some(entered_at) if gate.timestamp < entered_at => Err(PhaseGateError::GateStale {
                namespace_id: namespace.id.to_string(),
                phase: from.name.clone(),
                signed_at: gate.timestamp,
                entered_at,
            }),
            _ => Ok(()),
        };

        if let Some(gate) = supplied {
            let owner_matches = gate.namespace_id == namespace.id
                || Some(&gate.namespace_id) == inherited_from;
            if owner_matches && gate.phase == from.name {
                self.gates.ensure_verified(gate)?;
                return current_visit(gate);
            }
            tracing::warn!(
                "Supplied gate {} of {} does not cover phase {} of {}",
                gate.phase,
                gate.namespace_id,
                from.name,
                namespace.id
            );
        }

        let visit = record.visit_of(&from.name);
        match (
            self.gates.verified_gate(&namespace.id, &from.name, visit),
            inherited_from,
        ) {
            (Ok(gate), _) => current_visit(&gate),
            (Err(PhaseGateError::GateRequired { .. }), Some(parent)) => {
                let parent_visit = self.phases.load_record(parent)?.visit_of(&from.name);
                match self.gates.verified_gate(parent, &from.name, parent_visit) {
                    Ok(gate) => {
                        tracing::debug!(
                            "Namespace {} inherits gate {} from {}",
                            namespace.id,
                            from.name,
                            parent
                        );
                        current_visit(&gate)
                    }
                    Err(PhaseGateError::GateRequired { .. }) => Err(PhaseGateError::GateRequired {
                        namespace_id: namespace.id.to_string(),
                        phase: from.name.clone(),
                    }),
                    Err(e) => Err(e),
                }
            }
            (Err(e), _) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Gates
    // ------------------------------------------------------------------

    pub fn validate_gate(&self, id: &NamespaceId, phase: &str) -> Result<GateResult> {
        self.gates.validate(id, phase)
    }

    /// Re-validates `phase` and writes its signed gate for the phase's latest visit.
    pub fn sign_gate(&self, id: &NamespaceId, phase: &str) -> Result<Gate> {
        let lock = self.namespaces.lock(id)?;
        let namespace = self.namespaces.get(id)?;
        self.namespaces.ensure_mutable(&namespace)?;

        let visit = self.phases.load_record(id)?.visit_of(phase);
        let gate = self.gates.sign(&lock, phase, visit)?;
        let namespace = self.namespaces.touch(&lock)?;
        self.sync_index(&lock, &namespace);
        self.logger.log_gate_signed(&gate);
        Ok(gate)
    }

    pub fn verify_gate(&self, gate: &Gate) -> bool {
        self.gates.verify(gate)
    }

    /// The gate of the latest visit of `phase`, if one was signed.
    pub fn load_gate(&self, id: &NamespaceId, phase: &str) -> Result<Option<Gate>> {
        self.namespaces.get(id)?;
        let visit = self.phases.load_record(id)?.visit_of(phase);
        self.gates.load(id, phase, visit)
    }

    // ------------------------------------------------------------------
    // Parallel groups
    // ------------------------------------------------------------------

    pub fn plan_execution(&self, groups: &[ParallelGroup]) -> Result<ExecutionPlan> {
        self.planner.plan(groups)
    }

    pub fn check_admission(
        &self,
        running: &[ParallelGroup],
        candidate: &ParallelGroup,
    ) -> Result<()> {
        self.planner.check_admission(running, candidate)
    }

    // ------------------------------------------------------------------
    // Agent evidence
    // ------------------------------------------------------------------

    pub fn record_invocation_start(
        &self,
        id: &NamespaceId,
        agent: &str,
        parent: &str,
        depth: u32,
    ) -> Result<InvocationId> {
        self.evidence.record_start(id, agent, parent, depth)
    }

    pub fn record_invocation_end(
        &self,
        id: &NamespaceId,
        invocation_id: &InvocationId,
        status: InvocationStatus,
    ) -> Result<()> {
        self.evidence.record_end(id, invocation_id, status)
    }

    pub fn compliance(&self, id: &NamespaceId, now: DateTime<Utc>) -> Result<ComplianceReport> {
        self.namespaces.get(id)?;
        Ok(self.evidence.compliance(id, now))
    }

    // ------------------------------------------------------------------
    // Index and audit trail
    // ------------------------------------------------------------------

    pub fn query_index(&self, id: &NamespaceId) -> Result<IndexEntry> {
        self.index.query(id)
    }

    pub fn query_all(&self) -> Result<Index> {
        self.index.query_all()
    }

    pub fn rebuild_index(&self) -> Result<Index> {
        self.index.rebuild()
    }

    pub fn audit_entries(&self, id: Option<&NamespaceId>) -> anyhow::Result<Vec<LogEntry>> {
        structured_logger::read_entries(self.logger.log_path(), id)
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
