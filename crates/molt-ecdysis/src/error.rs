use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::control::ControlError;
use crate::relay::RelayError;

/// Failure to obtain the service listener at startup.
///
/// Every variant is fatal for the process: falling back to a fresh bind
/// would put a second listener on the address.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("invalid startup marker {var}={value:?}")]
    InvalidMarker { var: &'static str, value: String },

    #[error("{0} inherited listeners advertised, exactly one is supported")]
    UnsupportedListenerCount(usize),

    #[error("inherited listener '{0}' is missing from LISTEN_FD_NAMES")]
    MissingListenerName(String),

    #[error("inherited fd {fd} is not a valid socket")]
    InvalidDescriptor { fd: RawFd },

    #[error("inherited fd {fd} is a socket but is not listening")]
    NotListening { fd: RawFd },

    #[error("startup markers advertise {expected} inherited listener(s) but none was handed over")]
    MissingInherited { expected: usize },

    #[error("inherited descriptors were already claimed by this process")]
    AlreadyClaimed,

    #[error("listener was already taken")]
    ListenerTaken,

    #[error("listener I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by [`AgentRuntime`](crate::AgentRuntime).
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("listener handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("state relay failed: {0}")]
    Relay(#[from] RelayError),

    #[error("control channel failed: {0}")]
    Control(#[from] ControlError),

    #[error("prior state was already received")]
    StateTaken,

    #[error("lifecycle stream was already taken")]
    LifecycleTaken,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
