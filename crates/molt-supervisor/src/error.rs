use std::time::Duration;

use molt_ecdysis::{ControlError, HandshakeError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::generation::{GenerationId, TransitionError};
use crate::metrics::MetricsError;
use crate::ops::OpsError;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("a handoff is already in progress")]
    HandoffInProgress,

    #[error("no active generation")]
    NoActiveGeneration,

    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error("pre-flight hook '{name}' failed: {reason}")]
    PreflightFailed { name: String, reason: String },

    #[error("failed to spawn generation {generation}: {source}")]
    Spawn {
        generation: GenerationId,
        #[source]
        source: std::io::Error,
    },

    #[error("generation {generation} did not report {expected} within {timeout:?}")]
    Timeout {
        generation: GenerationId,
        expected: &'static str,
        timeout: Duration,
    },

    #[error("generation {generation} exited before becoming ready ({status})")]
    ExitedEarly { generation: GenerationId, status: String },

    #[error("generation {generation} closed its control channel")]
    ControlClosed { generation: GenerationId },

    #[error("state relay from generation {generation} failed: {reason}")]
    RelayFailed { generation: GenerationId, reason: String },

    #[error("handoff cancelled")]
    Cancelled,

    #[error("active generation exited outside a handoff")]
    ActiveGenerationLost,

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("control channel error: {0}")]
    Control(#[from] ControlError),

    #[error(transparent)]
    Ops(#[from] OpsError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("listener error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
