//! Agent invocation evidence.
//!
//! Workers report start/end through an append-only JSONL log per namespace
//! (`agent_invocations.jsonl`). Nothing is checked at record time so a worker
//! is never blocked; compliance is evaluated later, during gate validation:
//! - every invocation must have `depth == 1` and `parent == orchestrator`
//! - RUNNING invocations older than the staleness threshold count as CRASHED
//! - unparseable or unreadable evidence is a warning (missing evidence), never a failure

use crate::errors::{PhaseGateError, Result};
use crate::namespace::NamespaceId;
use crate::paths::StorePaths;
use crate::records;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(String);

impl InvocationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for InvocationId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl Display for InvocationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    Running,
    Success,
    Failed,
    Crashed,
}

/// One line of `agent_invocations.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum EvidenceEvent {
    Started {
        invocation_id: InvocationId,
        agent: String,
        parent: String,
        depth: u32,
        at: DateTime<Utc>,
    },
    Ended {
        invocation_id: InvocationId,
        status: InvocationStatus,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub invocation_id: InvocationId,
    pub namespace_id: NamespaceId,
    pub agent: String,
    pub parent: String,
    pub depth: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: InvocationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceViolation {
    pub invocation_id: InvocationId,
    pub agent: String,
    pub parent: String,
    pub depth: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    /// Invocations with their effective status (stale RUNNING reported as CRASHED).
    pub invocations: Vec<AgentInvocation>,
    pub violations: Vec<ComplianceViolation>,
    pub warnings: Vec<String>,
}

impl ComplianceReport {
    pub fn is_compliant(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Invocations folded from the log, plus warnings about evidence that could not be used.
#[derive(Debug, Clone, Default)]
pub struct EvidenceLog {
    pub invocations: Vec<AgentInvocation>,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct EvidenceCollector {
    paths: StorePaths,
    orchestrator: String,
    staleness: chrono::Duration,
    lock_timeout: Duration,
}

impl EvidenceCollector {
    pub fn new(
        paths: StorePaths,
        orchestrator: &str,
        staleness: chrono::Duration,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            paths,
            orchestrator: orchestrator.to_string(),
            staleness,
            lock_timeout,
        }
    }

    pub fn orchestrator(&self) -> &str {
        &self.orchestrator
    }

    fn require_namespace(&self, namespace_id: &NamespaceId) -> Result<()> {
        if self.paths.metadata_path(namespace_id.as_str()).is_file() {
            Ok(())
        } else {
            Err(PhaseGateError::NamespaceNotFound {
                id: namespace_id.to_string(),
            })
        }
    }

    pub fn record_start(
        &self,
        namespace_id: &NamespaceId,
        agent: &str,
        parent: &str,
        depth: u32,
    ) -> Result<InvocationId> {
        self.require_namespace(namespace_id)?;
        let invocation_id = InvocationId::new();
        records::append_jsonl(
            &self.paths.invocations_path(namespace_id.as_str()),
            &EvidenceEvent::Started {
                invocation_id: invocation_id.clone(),
                agent: agent.to_string(),
                parent: parent.to_string(),
                depth,
                at: Utc::now(),
            },
            self.lock_timeout,
        )?;
        Ok(invocation_id)
    }

    pub fn record_end(
        &self,
        namespace_id: &NamespaceId,
        invocation_id: &InvocationId,
        status: InvocationStatus,
    ) -> Result<()> {
        self.require_namespace(namespace_id)?;
        let known = self
            .load(namespace_id)
            .invocations
            .iter()
            .any(|inv| &inv.invocation_id == invocation_id);
        if !known {
            return Err(PhaseGateError::InvocationNotFound {
                namespace_id: namespace_id.to_string(),
                invocation_id: invocation_id.to_string(),
            });
        }

        records::append_jsonl(
            &self.paths.invocations_path(namespace_id.as_str()),
            &EvidenceEvent::Ended {
                invocation_id: invocation_id.clone(),
                status,
                at: Utc::now(),
            },
            self.lock_timeout,
        )
    }

    /// Folds the evidence log as recorded, without staleness applied.
    pub fn load(&self, namespace_id: &NamespaceId) -> EvidenceLog {
        let path = self.paths.invocations_path(namespace_id.as_str());
        let read = match records::read_jsonl::<EvidenceEvent>(&path, self.lock_timeout) {
            Ok(Some(read)) => read,
            Ok(None) => return EvidenceLog::default(),
            Err(e) => {
                tracing::warn!("Evidence for {} unreadable: {}", namespace_id, e);
                return EvidenceLog {
                    invocations: Vec::new(),
                    warnings: vec![format!("evidence file unreadable, treated as missing: {}", e)],
                };
            }
        };

        let mut warnings: Vec<String> = read
            .skipped
            .iter()
            .map(|(line, err)| format!("evidence line {} unparseable, ignored: {}", line, err))
            .collect();

        let mut order = Vec::new();
        let mut by_id: BTreeMap<InvocationId, AgentInvocation> = BTreeMap::new();
        for event in read.records {
            match event {
                EvidenceEvent::Started {
                    invocation_id,
                    agent,
                    parent,
                    depth,
                    at,
                } => {
                    if by_id.contains_key(&invocation_id) {
                        warnings.push(format!("duplicate start for invocation {}", invocation_id));
                        continue;
                    }
                    order.push(invocation_id.clone());
                    by_id.insert(
                        invocation_id.clone(),
                        AgentInvocation {
                            invocation_id,
                            namespace_id: namespace_id.clone(),
                            agent,
                            parent,
                            depth,
                            started_at: at,
                            completed_at: None,
                            status: InvocationStatus::Running,
                        },
                    );
                }
                EvidenceEvent::Ended {
                    invocation_id,
                    status,
                    at,
                } => match by_id.get_mut(&invocation_id) {
                    Some(invocation) => {
                        invocation.status = status;
                        invocation.completed_at = Some(at);
                    }
                    None => warnings.push(format!(
                        "end recorded for unknown invocation {}",
                        invocation_id
                    )),
                },
            }
        }

        let invocations = order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect();
        EvidenceLog {
            invocations,
            warnings,
        }
    }

    /// Evaluates the single-level delegation rule as of `now`.
    pub fn compliance(&self, namespace_id: &NamespaceId, now: DateTime<Utc>) -> ComplianceReport {
        let EvidenceLog {
            mut invocations,
            mut warnings,
        } = self.load(namespace_id);

        let mut violations = Vec::new();
        for invocation in &mut invocations {
            if invocation.status == InvocationStatus::Running
                && now.signed_duration_since(invocation.started_at) > self.staleness
            {
                invocation.status = InvocationStatus::Crashed;
                warnings.push(format!(
                    "invocation {} ({}) running since {} treated as crashed",
                    invocation.invocation_id,
                    invocation.agent,
                    invocation.started_at.to_rfc3339()
                ));
            }

            let mut reasons = Vec::new();
            if invocation.depth != 1 {
                reasons.push(format!("depth {} (expected 1)", invocation.depth));
            }
            if invocation.parent != self.orchestrator {
                reasons.push(format!(
                    "parent '{}' (expected '{}')",
                    invocation.parent, self.orchestrator
                ));
            }
            if !reasons.is_empty() {
                violations.push(ComplianceViolation {
                    invocation_id: invocation.invocation_id.clone(),
                    agent: invocation.agent.clone(),
                    parent: invocation.parent.clone(),
                    depth: invocation.depth,
                    reason: reasons.join("; "),
                });
            }
        }

        ComplianceReport {
            invocations,
            violations,
            warnings,
        }
    }

    /// Like [`compliance`](Self::compliance) but fails with every violation found.
    pub fn ensure_compliant(
        &self,
        namespace_id: &NamespaceId,
        now: DateTime<Utc>,
    ) -> Result<ComplianceReport> {
        let report = self.compliance(namespace_id, now);
        if report.is_compliant() {
            Ok(report)
        } else {
            Err(PhaseGateError::ComplianceViolation {
                violations: report.violations,
            })
        }
    }
}

#[cfg(test)]
#[path = "tests/evidence_tests.rs"]
mod tests;
