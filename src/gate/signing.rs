//! Gate content hashing and signatures.

use super::ArtifactVerdict;
use crate::errors::{PhaseGateError, Result};
use crate::paths::{hex_decode, hex_encode};
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

const KEY_LEN: usize = 32;

/// Produces and checks gate signatures.
pub trait Signer: Send + Sync {
    fn sign(&self, content_hash: &str, signer: &str) -> String;

    fn verify(&self, content_hash: &str, signer: &str, signature: &str) -> bool;
}

/// HMAC-SHA256 keyed by the per-store secret in `signing.key`.
pub struct HmacSigner {
    key: Vec<u8>,
}

impl HmacSigner {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    /// Loads the store key, creating it with fresh randomness on first use.
    ///
    /// Concurrent first uses race on a hard link, so exactly one key wins and
    /// every process ends up reading it.
    pub fn load_or_create(key_path: &Path) -> Result<Self> {
        if let Some(key) = read_key(key_path)? {
            return Ok(Self::new(key));
        }

        let dir = key_path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(PhaseGateError::io(dir))?;

        let mut key = vec![0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        let tmp = dir.join(format!(
            "signing.key.{}.{:08x}.tmp",
            std::process::id(),
            rand::random::<u32>()
        ));

        let written = write_private(&tmp, hex_encode(&key).as_bytes());
        let linked = written.and_then(|_| match fs::hard_link(&tmp, key_path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(PhaseGateError::io(key_path)(e)),
        });
        let _ = fs::remove_file(&tmp);

        if linked? {
            tracing::debug!("Created signing key at {}", key_path.display());
            return Ok(Self::new(key));
        }
        let key = read_key(key_path)?.ok_or_else(|| PhaseGateError::Config {
            message: format!("signing key {} vanished after creation", key_path.display()),
        })?;
        Ok(Self::new(key))
    }

    fn mac(&self, content_hash: &str, signer: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .expect("HMAC can take key of any size");
        mac.update(content_hash.as_bytes());
        mac.update(b"\n");
        mac.update(signer.as_bytes());
        mac
    }
}

impl Signer for HmacSigner {
    fn sign(&self, content_hash: &str, signer: &str) -> String {
        hex_encode(&self.mac(content_hash, signer).finalize().into_bytes())
    }

    fn verify(&self, content_hash: &str, signer: &str, signature: &str) -> bool {
        match hex_decode(signature) {
            Some(bytes) => self.mac(content_hash, signer).verify_slice(&bytes).is_ok(),
            None => false,
        }
    }
}

fn read_key(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read_to_string(path) {
        Ok(text) => hex_decode(text.trim())
            .filter(|key| !key.is_empty())
            .map(Some)
            .ok_or_else(|| PhaseGateError::Config {
                message: format!("signing key {} is not valid hex", path.display()),
            }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PhaseGateError::io(path)(e)),
    }
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(PhaseGateError::io(path))?;
    file.write_all(contents).map_err(PhaseGateError::io(path))?;
    file.sync_all().map_err(PhaseGateError::io(path))
}

/// SHA-256 over the canonical JSON of every signed gate field.
///
/// `serde_json::Value` objects keep keys sorted, so the encoding does not
/// depend on struct field order.
pub fn content_hash(
    namespace_id: &str,
    phase: &str,
    head_ref: &str,
    timestamp: &DateTime<Utc>,
    artifacts: &[ArtifactVerdict],
    signer: &str,
) -> String {
    let artifacts: Vec<serde_json::Value> = artifacts
        .iter()
        .map(|a| {
            serde_json::json!({
                "path": a.path,
                "passed": a.passed,
                "detail": a.detail,
            })
        })
        .collect();
    let canonical = serde_json::json!({
        "namespace_id": namespace_id,
        "phase": phase,
        "head_ref": head_ref,
        "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        "artifacts": artifacts,
        "signer": signer,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex_encode(&hasher.finalize())
}
