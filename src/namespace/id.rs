//! Namespace id generation.
//!
//! Ids are `<YYYYMMDDTHHMMSS>-<pid>-<16 hex digits of OS randomness>`. The
//! timestamp keeps ids roughly sortable by creation time, the pid separates
//! processes started in the same second, and 64 random bits make collisions
//! within one process and second practically impossible.

use super::NamespaceId;
use chrono::{DateTime, Utc};

pub const ID_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

pub trait IdSource: Send + Sync {
    fn next_id(&self) -> NamespaceId;
}

/// Wall clock + current process id + `rand` entropy.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemIdSource;

impl IdSource for SystemIdSource {
    fn next_id(&self) -> NamespaceId {
        compose_id(Utc::now(), std::process::id(), rand::random::<u64>())
    }
}

/// Always yields the same id. Used to exercise collision handling.
#[derive(Debug, Clone)]
pub struct FixedIdSource {
    pub at: DateTime<Utc>,
    pub pid: u32,
    pub entropy: u64,
}

impl IdSource for FixedIdSource {
    fn next_id(&self) -> NamespaceId {
        compose_id(self.at, self.pid, self.entropy)
    }
}

pub fn compose_id(at: DateTime<Utc>, pid: u32, entropy: u64) -> NamespaceId {
    NamespaceId(format!(
        "{}-{}-{:016x}",
        at.format(ID_TIMESTAMP_FORMAT),
        pid,
        entropy
    ))
}
