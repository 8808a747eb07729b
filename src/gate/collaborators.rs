//! Checks the gate validator delegates to, with their default implementations.

use crate::config::WorkflowConfig;
use glob::{MatchOptions, Pattern};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Files larger than this are not scanned for secrets.
const MAX_SCAN_BYTES: u64 = 4 * 1024 * 1024;

const PATH_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

pub trait PathAllowlist: Send + Sync {
    fn is_path_allowed(&self, phase: &str, path: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub path: String,
    pub line: usize,
    pub pattern: String,
}

pub trait SecretScanner: Send + Sync {
    /// Scans the given repository-relative paths under `root`.
    fn scan(&self, root: &Path, paths: &[String]) -> Vec<Violation>;
}

/// Version found in one configured file, `None` if it could not be determined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredVersion {
    pub file: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReport {
    pub consistent: bool,
    pub declared: Vec<DeclaredVersion>,
}

pub trait VersionChecker: Send + Sync {
    fn check_versions(&self, root: &Path, files: &[String]) -> VersionReport;
}

/// Per-phase `allowed_paths` globs; a phase without globs allows everything.
pub struct GlobAllowlist {
    phases: HashMap<String, Vec<Pattern>>,
}

impl GlobAllowlist {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        let phases = config
            .phases
            .iter()
            .map(|phase| {
                // Globs were checked by WorkflowConfig::validate
                let patterns = phase
                    .allowed_paths
                    .iter()
                    .filter_map(|p| Pattern::new(p).ok())
                    .collect();
                (phase.name.clone(), patterns)
            })
            .collect();
        Self { phases }
    }
}

impl PathAllowlist for GlobAllowlist {
    fn is_path_allowed(&self, phase: &str, path: &str) -> bool {
        match self.phases.get(phase) {
            Some(patterns) if !patterns.is_empty() => patterns
                .iter()
                .any(|pattern| pattern.matches_with(path, PATH_MATCH)),
            _ => true,
        }
    }
}

pub struct RegexSecretScanner {
    patterns: Vec<Regex>,
}

impl RegexSecretScanner {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }

    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self::new(
            config
                .secret_patterns
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
        )
    }
}

impl SecretScanner for RegexSecretScanner {
    fn scan(&self, root: &Path, paths: &[String]) -> Vec<Violation> {
        let mut violations = Vec::new();
        if self.patterns.is_empty() {
            return violations;
        }

        for rel in paths {
            let file = root.join(rel);
            let too_big = std::fs::metadata(&file)
                .map(|m| !m.is_file() || m.len() > MAX_SCAN_BYTES)
                .unwrap_or(true);
            if too_big {
                continue;
            }
            // Binary and deleted files are skipped
            let Ok(content) = std::fs::read_to_string(&file) else {
                continue;
            };
            for (index, line) in content.lines().enumerate() {
                for pattern in &self.patterns {
                    if pattern.is_match(line) {
                        violations.push(Violation {
                            path: rel.clone(),
                            line: index + 1,
                            pattern: pattern.as_str().to_string(),
                        });
                    }
                }
            }
        }
        violations
    }
}

/// Reads `version = "x"` (TOML) or `"version": "x"` (JSON) declarations and requires them to agree.
pub struct ManifestVersionChecker {
    toml_version: Regex,
    json_version: Regex,
}

impl ManifestVersionChecker {
    pub fn new() -> Self {
        Self {
            toml_version: Regex::new(r#"(?m)^\s*version\s*=\s*"([^"]+)""#)
                .expect("static regex"),
            json_version: Regex::new(r#""version"\s*:\s*"([^"]+)""#).expect("static regex"),
        }
    }

    fn declared_version(&self, content: &str) -> Option<String> {
        self.toml_version
            .captures(content)
            .or_else(|| self.json_version.captures(content))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

impl Default for ManifestVersionChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionChecker for ManifestVersionChecker {
    fn check_versions(&self, root: &Path, files: &[String]) -> VersionReport {
        let declared: Vec<DeclaredVersion> = files
            .iter()
            .map(|file| DeclaredVersion {
                file: file.clone(),
                version: std::fs::read_to_string(root.join(file))
                    .ok()
                    .and_then(|content| self.declared_version(&content)),
            })
            .collect();

        let first = declared.first().and_then(|d| d.version.as_deref());
        let consistent = declared
            .iter()
            .all(|d| d.version.is_some() && d.version.as_deref() == first);

        VersionReport {
            consistent,
            declared,
        }
    }
}
