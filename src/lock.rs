//! Bounded-wait advisory file locks.
//!
//! Locks are `fs2` locks, either on a dedicated lock file ([`LockGuard`]) or
//! on a log file itself ([`lock_within`]). Acquisition polls `try_lock_*` with
//! exponential backoff until the timeout elapses, so an interactive caller (a
//! commit hook) never blocks indefinitely.

use crate::errors::{PhaseGateError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const INITIAL_BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Locks an already open `file` in `mode`, polling until `timeout` elapses.
///
/// The caller unlocks. Fails with [`PhaseGateError::LockTimeout`] when the
/// lock is still contended at the deadline.
pub fn lock_within(file: &File, path: &Path, mode: LockMode, timeout: Duration) -> Result<()> {
    let started = Instant::now();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let attempt = match mode {
            LockMode::Shared => FileExt::try_lock_shared(file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(file),
        };
        match attempt {
            Ok(()) => return Ok(()),
            Err(e) if is_contended(&e) => {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    tracing::warn!("Lock {} still held after {:?}", path.display(), elapsed);
                    return Err(PhaseGateError::LockTimeout {
                        path: path.to_path_buf(),
                        waited_ms: elapsed.as_millis() as u64,
                    });
                }
                std::thread::sleep(backoff.min(timeout - elapsed));
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(e) => return Err(PhaseGateError::io(path)(e)),
        }
    }
}

/// An acquired exclusive lock. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Acquires an exclusive lock on `path`, creating the lock file if needed.
    ///
    /// Fails with [`PhaseGateError::LockTimeout`] once `timeout` has elapsed.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(PhaseGateError::io(parent))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(PhaseGateError::io(path))?;

        lock_within(&file, path, LockMode::Exclusive, timeout)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
#[path = "tests/lock_tests.rs"]
mod tests;
