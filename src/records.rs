//! Durable record IO.
//!
//! - JSON records are replaced atomically via temp file + rename
//! - Immutable records (gates, tombstones) are written create-only
//! - Append-only logs are JSONL guarded by a bounded-wait lock on the log itself

use crate::errors::{PhaseGateError, Result};
use crate::lock::{lock_within, LockMode};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::Path;
use std::time::Duration;

/// Outcome of a create-only write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Result of reading a JSONL log: parsed records plus lines that failed to parse.
#[derive(Debug)]
pub struct JsonlRead<T> {
    pub records: Vec<T>,
    /// `(1-based line number, parse error)` for each skipped line.
    pub skipped: Vec<(usize, String)>,
}

/// Reads a JSON record. Returns `Ok(None)` if the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PhaseGateError::io(path)(e)),
    };

    let value = serde_json::from_str(&content).map_err(PhaseGateError::serde(path))?;
    Ok(Some(value))
}

/// Writes a JSON record atomically (temp file in the same directory, then rename).
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(PhaseGateError::io(parent))?;
    }

    let content = serde_json::to_string_pretty(value).map_err(PhaseGateError::serde(path))?;

    // Temp name is unique per writer so concurrent writers never share a temp file
    let tmp_path = path.with_extension(format!(
        "json.{}.{:08x}.tmp",
        std::process::id(),
        rand::random::<u32>()
    ));
    std::fs::write(&tmp_path, content).map_err(PhaseGateError::io(&tmp_path))?;
    std::fs::rename(&tmp_path, path).map_err(PhaseGateError::io(path))?;

    Ok(())
}

/// Writes a JSON record only if `path` does not exist yet.
pub fn create_json_exclusive<T: Serialize>(path: &Path, value: &T) -> Result<CreateOutcome> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(PhaseGateError::io(parent))?;
    }

    let content = serde_json::to_string_pretty(value).map_err(PhaseGateError::serde(path))?;

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(CreateOutcome::AlreadyExists),
        Err(e) => return Err(PhaseGateError::io(path)(e)),
    };

    file.write_all(content.as_bytes())
        .map_err(PhaseGateError::io(path))?;
    file.sync_all().map_err(PhaseGateError::io(path))?;

    Ok(CreateOutcome::Created)
}

/// Appends one JSON line under an exclusive lock on the log file itself,
/// waiting at most `timeout` for the lock.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T, timeout: Duration) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(PhaseGateError::io(parent))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(PhaseGateError::io(path))?;

    lock_within(&file, path, LockMode::Exclusive, timeout)?;

    let line = serde_json::to_string(value).map_err(PhaseGateError::serde(path))?;
    let written = writeln!(file, "{}", line)
        .and_then(|_| file.flush())
        .and_then(|_| file.sync_all());
    let _ = FileExt::unlock(&file);

    written.map_err(PhaseGateError::io(path))
}

/// Reads a JSONL log under a shared lock. Unparseable lines are skipped and reported.
///
/// Returns `Ok(None)` if the file does not exist, and
/// [`PhaseGateError::LockTimeout`] if a writer holds the log past `timeout`.
pub fn read_jsonl<T: DeserializeOwned>(
    path: &Path,
    timeout: Duration,
) -> Result<Option<JsonlRead<T>>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PhaseGateError::io(path)(e)),
    };

    lock_within(&file, path, LockMode::Shared, timeout)?;

    let reader = BufReader::new(&file);
    let mut records = Vec::new();
    let mut skipped = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                skipped.push((idx + 1, e.to_string()));
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(record) => records.push(record),
            Err(e) => skipped.push((idx + 1, e.to_string())),
        }
    }

    let _ = FileExt::unlock(&file);
    Ok(Some(JsonlRead { records, skipped }))
}

#[cfg(test)]
#[path = "tests/records_tests.rs"]
mod tests;
