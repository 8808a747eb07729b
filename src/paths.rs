//! On-disk layout of a phasegate store.
//!
//! Everything lives under a single store root (by default `<repo>/.phasegate/`):
//! - `config.yaml` - Optional workflow configuration override
//! - `signing.key` - Per-store HMAC secret for gate signatures
//! - `index.json` / `index.lock` - Central index and its lock
//! - `audit/events.jsonl` - Audit trail
//! - `namespaces/<id>/` - One directory per task namespace (metadata, phase,
//!   gates, agent invocations, tombstone, lock)

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// The name of the store directory inside a repository.
pub const STORE_DIR: &str = ".phasegate";

/// Environment variable overriding the store root.
pub const STORE_ENV: &str = "PHASEGATE_HOME";

/// Resolves the store root: explicit path, then `$PHASEGATE_HOME`, then `<cwd>/.phasegate`.
pub fn resolve_store_root(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(from_env) = std::env::var_os(STORE_ENV) {
        if !from_env.is_empty() {
            return Ok(PathBuf::from(from_env));
        }
    }
    let cwd = std::env::current_dir().context("Could not determine current directory")?;
    Ok(cwd.join(STORE_DIR))
}

/// Returns the per-user configuration file: `<config dir>/phasegate/config.yaml`.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("phasegate").join("config.yaml"))
}

/// Path helpers for one store root. Computing a path never touches the disk.
#[derive(Debug, Clone)]
pub struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn signing_key_path(&self) -> PathBuf {
        self.root.join("signing.key")
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    pub fn index_lock_path(&self) -> PathBuf {
        self.root.join("index.lock")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    pub fn namespaces_dir(&self) -> PathBuf {
        self.root.join("namespaces")
    }

    pub fn namespace_dir(&self, id: &str) -> PathBuf {
        self.namespaces_dir().join(id)
    }

    pub fn metadata_path(&self, id: &str) -> PathBuf {
        self.namespace_dir(id).join("metadata.json")
    }

    pub fn phase_path(&self, id: &str) -> PathBuf {
        self.namespace_dir(id).join("phase.json")
    }

    pub fn gates_dir(&self, id: &str) -> PathBuf {
        self.namespace_dir(id).join("gates")
    }

    /// `namespaces/<id>/gates/<phase>.json` for the first visit of a phase,
    /// `<phase>.<visit>.json` once it is re-entered after a rollback.
    pub fn gate_path(&self, id: &str, phase: &str, visit: u32) -> PathBuf {
        if visit <= 1 {
            self.gates_dir(id).join(format!("{}.json", phase))
        } else {
            self.gates_dir(id).join(format!("{}.{}.json", phase, visit))
        }
    }

    pub fn invocations_path(&self, id: &str) -> PathBuf {
        self.namespace_dir(id).join("agent_invocations.jsonl")
    }

    pub fn tombstone_path(&self, id: &str) -> PathBuf {
        self.namespace_dir(id).join("tombstone.json")
    }

    pub fn namespace_lock_path(&self, id: &str) -> PathBuf {
        self.namespace_dir(id).join(".lock")
    }
}

/// Encodes bytes as lowercase hex string.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decodes a lowercase or uppercase hex string. Returns `None` on odd length or bad digits.
pub fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if !text.len().is_multiple_of(2) {
        return None;
    }
    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/paths_tests.rs"]
mod tests;
