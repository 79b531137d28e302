//! # molt-supervisor
//!
//! Generation supervisor for hot relay: keeps one listening socket open for
//! the lifetime of a service and replaces the process behind it without
//! dropping connections or losing in-memory state.
//!
//! The process-side half of the protocol lives in `molt-ecdysis`; this crate
//! owns spawning, readiness, promotion, draining, operator controls and
//! handoff metrics.

pub mod config;
pub mod error;
pub mod generation;
pub mod hooks;
pub mod metrics;
pub mod ops;
pub mod process;
pub mod supervisor;
pub mod telemetry;

pub use config::{ConfigError, SupervisorConfig};
pub use error::SupervisorError;
pub use generation::{Generation, GenerationId, GenerationState, StartKind};
pub use ops::{OpsRequest, OpsResponse};
pub use supervisor::{HandoffOutcome, RelayRequest, RelayStats, StatusReport, Supervisor};
