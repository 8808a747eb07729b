use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Identity every agent invocation must name as its parent.
    #[serde(default = "default_orchestrator")]
    pub orchestrator: String,
    /// Signer identity recorded in gates. Defaults to `$USER@<hostname>`.
    #[serde(default)]
    pub signer: Option<String>,
    /// RUNNING invocations older than this are treated as CRASHED.
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,
    /// Upper bound on waiting for a namespace or index lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default)]
    pub child_gate_policy: ChildGatePolicy,
    /// Whether a regular forward transition needs a verified gate for the phase being left.
    #[serde(default = "default_true")]
    pub require_gate_to_advance: bool,
    /// Files whose declared versions must agree (relative to the repository root).
    #[serde(default)]
    pub version_files: Vec<String>,
    /// Regexes the default secret scanner looks for in changed files.
    #[serde(default)]
    pub secret_patterns: Vec<String>,
    #[serde(default)]
    pub conflict: ConflictConfig,
    pub phases: Vec<PhaseConfig>,
}

/// Whether a child namespace may reuse its parent's passed gates.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChildGatePolicy {
    #[default]
    Independent,
    Inherit,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConflictConfig {
    #[serde(default)]
    pub broad_policy: BroadPolicy,
}

/// What the conflict planner does with a group that declares an overly broad path.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BroadPolicy {
    /// Run it alone after everything else and report it.
    #[default]
    Isolate,
    /// Refuse to plan.
    Reject,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PhaseConfig {
    pub name: String,
    /// Globs of paths that may change during this phase. Empty means unrestricted.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub required_artifacts: Vec<ArtifactSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
    /// Path relative to the repository root. `{namespace}` expands to the namespace id.
    pub path: String,
    #[serde(default)]
    pub predicate: ArtifactPredicate,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactPredicate {
    #[default]
    Exists,
    NonEmpty,
    /// Content matches this regex.
    Contains(String),
    MinLines(usize),
}

fn default_orchestrator() -> String {
    "orchestrator".to_string()
}

fn default_staleness_threshold_secs() -> u64 {
    3600
}

fn default_lock_timeout_ms() -> u64 {
    400
}

fn default_true() -> bool {
    true
}

impl WorkflowConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Loads the first config found: `<store>/config.yaml`, then the per-user
    /// config, then the embedded default.
    pub fn resolve(store_root: &Path) -> Result<Self> {
        let store_config = store_root.join("config.yaml");
        if store_config.exists() {
            return Self::load(&store_config);
        }
        if let Some(user_config) = crate::paths::user_config_path() {
            if user_config.exists() {
                return Self::load(&user_config);
            }
        }
        Ok(Self::default_config())
    }

    pub fn default_config() -> Self {
        const DEFAULT_WORKFLOW_YAML: &str = include_str!("../phasegate.yaml");

        serde_yaml::from_str(DEFAULT_WORKFLOW_YAML)
            .expect("Failed to parse embedded phasegate.yaml")
    }

    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            anyhow::bail!("At least one phase must be configured");
        }

        let mut seen = HashSet::new();
        for phase in &self.phases {
            if !is_valid_phase_name(&phase.name) {
                anyhow::bail!(
                    "Phase name '{}' must be non-empty lowercase letters, digits, '-' or '_'",
                    phase.name
                );
            }
            if !seen.insert(phase.name.as_str()) {
                anyhow::bail!("Phase '{}' is configured more than once", phase.name);
            }
            for pattern in &phase.allowed_paths {
                glob::Pattern::new(pattern).with_context(|| {
                    format!(
                        "Invalid allowed_paths glob '{}' in phase '{}'",
                        pattern, phase.name
                    )
                })?;
            }
            for artifact in &phase.required_artifacts {
                if artifact.path.trim().is_empty() {
                    anyhow::bail!("Phase '{}' has an artifact with an empty path", phase.name);
                }
                if let ArtifactPredicate::Contains(pattern) = &artifact.predicate {
                    regex::Regex::new(pattern).with_context(|| {
                        format!(
                            "Invalid contains regex for artifact '{}' in phase '{}'",
                            artifact.path, phase.name
                        )
                    })?;
                }
            }
        }

        for pattern in &self.secret_patterns {
            regex::Regex::new(pattern)
                .with_context(|| format!("Invalid secret pattern '{}'", pattern))?;
        }

        if self.orchestrator.trim().is_empty() {
            anyhow::bail!("Orchestrator identity must not be empty");
        }
        if self.lock_timeout_ms == 0 {
            anyhow::bail!("lock_timeout_ms must be greater than zero");
        }
        if self.staleness_threshold_secs == 0 {
            anyhow::bail!("staleness_threshold_secs must be greater than zero");
        }

        Ok(())
    }

    pub fn phase_names(&self) -> impl Iterator<Item = &str> {
        self.phases.iter().map(|p| p.name.as_str())
    }

    pub fn first_phase(&self) -> &PhaseConfig {
        &self.phases[0]
    }

    /// Ordinal of `name` in the configured phase order.
    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseConfig> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn staleness_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_threshold_secs.min(i64::MAX as u64) as i64)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// The identity recorded as a gate's signer.
    pub fn signer_identity(&self) -> String {
        if let Some(signer) = self.signer.as_deref().filter(|s| !s.trim().is_empty()) {
            return signer.to_string();
        }
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        format!("{}@{}", user, host)
    }
}

fn is_valid_phase_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
