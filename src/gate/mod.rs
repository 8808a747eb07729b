//! Gate validation and signing.
//!
//! A gate is the signed record that a namespace satisfied every check for a
//! phase. Validation runs a fixed battery of checks without short-circuiting:
//! 1. `allowed_paths` - every changed path is allowed in the phase
//! 2. `required_artifacts` - configured artifacts exist and satisfy their predicate
//! 3. `secret_scan` - no changed file matches a secret pattern
//! 4. `version_consistency` - configured manifests declare the same version
//! 5. `agent_compliance` - recorded agent invocations obey single-level delegation
//!
//! Signing re-validates, then writes `gates/<phase>.json` create-only, so a
//! gate is never overwritten once it exists. A phase re-entered after a
//! rollback is a new visit and gets its own gate file.

mod collaborators;
mod signing;

pub use collaborators::{
    DeclaredVersion, GlobAllowlist, ManifestVersionChecker, PathAllowlist, RegexSecretScanner,
    SecretScanner, VersionChecker, VersionReport, Violation,
};
pub use signing::{content_hash, HmacSigner, Signer};

use crate::config::{ArtifactPredicate, ArtifactSpec, WorkflowConfig};
use crate::errors::{PhaseGateError, Result};
use crate::evidence::EvidenceCollector;
use crate::namespace::{NamespaceId, NamespaceLock};
use crate::paths::StorePaths;
use crate::probe::WorkspaceProbe;
use crate::records::{self, CreateOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    AllowedPaths,
    RequiredArtifacts,
    SecretScan,
    VersionConsistency,
    AgentCompliance,
}

impl CheckKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllowedPaths => "allowed_paths",
            Self::RequiredArtifacts => "required_artifacts",
            Self::SecretScan => "secret_scan",
            Self::VersionConsistency => "version_consistency",
            Self::AgentCompliance => "agent_compliance",
        }
    }
}

/// One itemized finding of a failing check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckItem {
    pub subject: String,
    pub reason: String,
    pub remediation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub kind: CheckKind,
    pub passed: bool,
    pub items: Vec<CheckItem>,
    pub warnings: Vec<String>,
}

impl Check {
    fn from_items(kind: CheckKind, items: Vec<CheckItem>, warnings: Vec<String>) -> Self {
        Self {
            kind,
            passed: items.is_empty(),
            items,
            warnings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactVerdict {
    /// Repository-relative path with `{namespace}` expanded.
    pub path: String,
    pub passed: bool,
    pub detail: String,
}

/// Outcome of [`GateValidator::validate`]. Contains no wall-clock values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub namespace_id: NamespaceId,
    pub phase: String,
    pub passed: bool,
    pub checks: Vec<Check>,
    pub artifacts: Vec<ArtifactVerdict>,
}

impl GateResult {
    pub fn failing(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// `namespaces/<id>/gates/<phase>.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate {
    pub namespace_id: NamespaceId,
    pub phase: String,
    pub required_artifacts: Vec<ArtifactVerdict>,
    pub head_ref: String,
    pub signer: String,
    pub timestamp: DateTime<Utc>,
    pub content_hash: String,
    pub signature: String,
}

#[derive(Clone)]
pub struct GateValidator {
    paths: StorePaths,
    config: Arc<WorkflowConfig>,
    probe: Arc<dyn WorkspaceProbe>,
    signer: Arc<dyn Signer>,
    evidence: EvidenceCollector,
    allowlist: Arc<dyn PathAllowlist>,
    scanner: Arc<dyn SecretScanner>,
    versions: Arc<dyn VersionChecker>,
}

impl GateValidator {
    /// A validator using the config-driven default checks.
    pub fn new(
        paths: StorePaths,
        config: Arc<WorkflowConfig>,
        probe: Arc<dyn WorkspaceProbe>,
        signer: Arc<dyn Signer>,
        evidence: EvidenceCollector,
    ) -> Self {
        Self {
            allowlist: Arc::new(GlobAllowlist::from_config(&config)),
            scanner: Arc::new(RegexSecretScanner::from_config(&config)),
            versions: Arc::new(ManifestVersionChecker::new()),
            paths,
            config,
            probe,
            signer,
            evidence,
        }
    }

    pub fn with_allowlist(mut self, allowlist: Arc<dyn PathAllowlist>) -> Self {
        self.allowlist = allowlist;
        self
    }

    pub fn with_secret_scanner(mut self, scanner: Arc<dyn SecretScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_version_checker(mut self, versions: Arc<dyn VersionChecker>) -> Self {
        self.versions = versions;
        self
    }

    /// Runs every check for `phase` and reports all of them.
    pub fn validate(&self, namespace_id: &NamespaceId, phase: &str) -> Result<GateResult> {
        let phase_config = self
            .config
            .phase(phase)
            .ok_or_else(|| PhaseGateError::UnknownPhase {
                phase: phase.to_string(),
            })?;
        if !self.paths.metadata_path(namespace_id.as_str()).is_file() {
            return Err(PhaseGateError::NamespaceNotFound {
                id: namespace_id.to_string(),
            });
        }

        let root = self.probe.root();
        let changed = self.changed_paths()?;

        let allowed = self.check_allowed_paths(phase, &changed);
        let artifacts: Vec<ArtifactVerdict> = phase_config
            .required_artifacts
            .iter()
            .map(|spec| evaluate_artifact(root, namespace_id, spec))
            .collect();
        let required = check_artifacts(phase, &artifacts);
        let secrets = self.check_secrets(root, &changed);
        let versions = self.check_versions(root);
        let compliance = self.check_compliance(namespace_id);

        let checks = vec![allowed, required, secrets, versions, compliance];
        let passed = checks.iter().all(|c| c.passed);
        tracing::debug!(
            "Validated gate {} for {}: {}",
            phase,
            namespace_id,
            if passed { "passed" } else { "failed" }
        );

        Ok(GateResult {
            namespace_id: namespace_id.clone(),
            phase: phase.to_string(),
            passed,
            checks,
            artifacts,
        })
    }

    /// Validates and fails with the itemized checks unless everything passed.
    pub fn ensure_passed(&self, namespace_id: &NamespaceId, phase: &str) -> Result<GateResult> {
        let result = self.validate(namespace_id, phase)?;
        if result.passed {
            Ok(result)
        } else {
            Err(PhaseGateError::GateCheckFailed {
                phase: phase.to_string(),
                checks: result.checks,
            })
        }
    }

    /// Re-validates and writes a signed gate for the given visit of `phase`.
    pub fn sign(&self, lock: &NamespaceLock, phase: &str, visit: u32) -> Result<Gate> {
        let namespace_id = lock.id();
        let gate_path = self.paths.gate_path(namespace_id.as_str(), phase, visit);
        let already_signed = || PhaseGateError::GateAlreadySigned {
            namespace_id: namespace_id.to_string(),
            phase: phase.to_string(),
        };
        if gate_path.exists() {
            return Err(already_signed());
        }

        let result = self.validate(namespace_id, phase)?;
        if !result.passed {
            return Err(PhaseGateError::GateNotReady {
                phase: phase.to_string(),
                checks: result.checks,
            });
        }

        let head_ref = self.probe.head_ref()?;
        let signer = self.config.signer_identity();
        let timestamp = Utc::now();
        let hash = content_hash(
            namespace_id.as_str(),
            phase,
            &head_ref,
            &timestamp,
            &result.artifacts,
            &signer,
        );
        let gate = Gate {
            namespace_id: namespace_id.clone(),
            phase: phase.to_string(),
            required_artifacts: result.artifacts,
            signature: self.signer.sign(&hash, &signer),
            head_ref,
            signer,
            timestamp,
            content_hash: hash,
        };

        match records::create_json_exclusive(&gate_path, &gate)? {
            CreateOutcome::Created => Ok(gate),
            CreateOutcome::AlreadyExists => Err(already_signed()),
        }
    }

    /// Recomputes the content hash from the gate's fields and checks the signature.
    pub fn verify(&self, gate: &Gate) -> bool {
        let expected = content_hash(
            gate.namespace_id.as_str(),
            &gate.phase,
            &gate.head_ref,
            &gate.timestamp,
            &gate.required_artifacts,
            &gate.signer,
        );
        expected == gate.content_hash
            && self
                .signer
                .verify(&gate.content_hash, &gate.signer, &gate.signature)
    }

    pub fn load(
        &self,
        namespace_id: &NamespaceId,
        phase: &str,
        visit: u32,
    ) -> Result<Option<Gate>> {
        records::read_json(&self.paths.gate_path(namespace_id.as_str(), phase, visit))
    }

    /// The stored gate for a visit of `phase`, provided it verifies.
    pub fn verified_gate(
        &self,
        namespace_id: &NamespaceId,
        phase: &str,
        visit: u32,
    ) -> Result<Gate> {
        let gate = self
            .load(namespace_id, phase, visit)?
            .ok_or_else(|| PhaseGateError::GateRequired {
                namespace_id: namespace_id.to_string(),
                phase: phase.to_string(),
            })?;
        self.ensure_verified(&gate)?;
        Ok(gate)
    }

    pub fn ensure_verified(&self, gate: &Gate) -> Result<()> {
        if self.verify(gate) {
            Ok(())
        } else {
            tracing::warn!(
                "Gate {} of {} failed verification",
                gate.phase,
                gate.namespace_id
            );
            Err(PhaseGateError::SignatureMismatch {
                namespace_id: gate.namespace_id.to_string(),
                phase: gate.phase.clone(),
            })
        }
    }

    /// Changed paths outside the store directory itself.
    fn changed_paths(&self) -> Result<Vec<String>> {
        let store_prefix = self
            .paths
            .root()
            .strip_prefix(self.probe.root())
            .ok()
            .and_then(|p| p.to_str())
            .filter(|p| !p.is_empty())
            .map(|p| format!("{}/", p.trim_end_matches('/')));

        Ok(self
            .probe
            .changed_paths()?
            .into_iter()
            .filter(|path| match &store_prefix {
                Some(prefix) => !path.starts_with(prefix.as_str()),
                None => true,
            })
            .collect())
    }

    fn check_allowed_paths(&self, phase: &str, changed: &[String]) -> Check {
        let items = changed
            .iter()
            .filter(|path| !self.allowlist.is_path_allowed(phase, path))
            .map(|path| CheckItem {
                subject: path.clone(),
                reason: format!("changed path is not allowed during phase '{}'", phase),
                remediation: format!(
                    "revert the change or add a matching glob to allowed_paths of phase '{}'",
                    phase
                ),
            })
            .collect();
        Check::from_items(CheckKind::AllowedPaths, items, Vec::new())
    }

    fn check_secrets(&self, root: &Path, changed: &[String]) -> Check {
        let items = self
            .scanner
            .scan(root, changed)
            .into_iter()
            .map(|v| CheckItem {
                subject: format!("{}:{}", v.path, v.line),
                reason: format!("matches secret pattern /{}/", v.pattern),
                remediation: "remove the secret and rotate it".to_string(),
            })
            .collect();
        Check::from_items(CheckKind::SecretScan, items, Vec::new())
    }

    fn check_versions(&self, root: &Path) -> Check {
        let report = self.versions.check_versions(root, &self.config.version_files);
        if report.consistent {
            return Check::from_items(CheckKind::VersionConsistency, Vec::new(), Vec::new());
        }
        let items = report
            .declared
            .iter()
            .map(|d| CheckItem {
                subject: d.file.clone(),
                reason: match &d.version {
                    Some(v) => format!("declares version {}", v),
                    None => "no version declaration found".to_string(),
                },
                remediation: "bump every configured version file to the same version".to_string(),
            })
            .collect();
        Check::from_items(CheckKind::VersionConsistency, items, Vec::new())
    }

    fn check_compliance(&self, namespace_id: &NamespaceId) -> Check {
        let report = self.evidence.compliance(namespace_id, Utc::now());
        let items = report
            .violations
            .iter()
            .map(|v| CheckItem {
                subject: format!("{} ({})", v.agent, v.invocation_id),
                reason: v.reason.clone(),
                remediation: format!(
                    "only '{}' may spawn agents, and only at depth 1",
                    self.evidence.orchestrator()
                ),
            })
            .collect();
        Check::from_items(CheckKind::AgentCompliance, items, report.warnings)
    }
}

fn check_artifacts(phase: &str, artifacts: &[ArtifactVerdict]) -> Check {
    let items = artifacts
        .iter()
        .filter(|a| !a.passed)
        .map(|a| CheckItem {
            subject: a.path.clone(),
            reason: a.detail.clone(),
            remediation: format!("produce the artifact required by phase '{}'", phase),
        })
        .collect();
    Check::from_items(CheckKind::RequiredArtifacts, items, Vec::new())
}

fn evaluate_artifact(
    root: &Path,
    namespace_id: &NamespaceId,
    spec: &ArtifactSpec,
) -> ArtifactVerdict {
    let rel = spec.path.replace("{namespace}", namespace_id.as_str());
    let full = root.join(&rel);
    let verdict = |passed: bool, detail: String| ArtifactVerdict {
        path: rel.clone(),
        passed,
        detail,
    };

    if !full.exists() {
        return verdict(false, "missing".to_string());
    }

    match &spec.predicate {
        ArtifactPredicate::Exists => verdict(true, "exists".to_string()),
        ArtifactPredicate::NonEmpty => {
            let non_empty = if full.is_dir() {
                std::fs::read_dir(&full)
                    .map(|mut entries| entries.next().is_some())
                    .unwrap_or(false)
            } else {
                std::fs::metadata(&full).map(|m| m.len() > 0).unwrap_or(false)
            };
            if non_empty {
                verdict(true, "non-empty".to_string())
            } else {
                verdict(false, "empty".to_string())
            }
        }
        ArtifactPredicate::Contains(pattern) => match (
            regex::Regex::new(pattern),
            std::fs::read_to_string(&full),
        ) {
            (Ok(re), Ok(content)) if re.is_match(&content) => {
                verdict(true, format!("matches /{}/", pattern))
            }
            (Ok(_), Ok(_)) => verdict(false, format!("no match for /{}/", pattern)),
            (Err(e), _) => verdict(false, format!("invalid pattern /{}/: {}", pattern, e)),
            (_, Err(e)) => verdict(false, format!("unreadable: {}", e)),
        },
        ArtifactPredicate::MinLines(min) => match std::fs::read_to_string(&full) {
            Ok(content) => {
                let lines = content.lines().count();
                if lines >= *min {
                    verdict(true, format!("{} lines", lines))
                } else {
                    verdict(false, format!("{} lines, at least {} required", lines, min))
                }
            }
            Err(e) => verdict(false, format!("unreadable: {}", e)),
        },
    }
}
