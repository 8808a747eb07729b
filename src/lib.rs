//! Phase-gated orchestration of concurrent agent tasks.
//!
//! Each task runs in its own namespace with its own phase record. Moving a
//! namespace forward requires a signed gate for the phase it leaves; parallel
//! agent groups are scheduled so that groups touching the same files never
//! run at the same time.

pub mod config;
pub mod conflict;
pub mod engine;
pub mod errors;
pub mod evidence;
pub mod gate;
pub mod index;
pub mod lock;
pub mod migration;
pub mod namespace;
pub mod paths;
pub mod phase;
pub mod probe;
pub mod records;
pub mod structured_logger;

pub use engine::{PhaseGate, PhaseGateBuilder};
pub use errors::{PhaseGateError, Result};
