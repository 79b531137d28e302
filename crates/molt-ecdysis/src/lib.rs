//! # molt-ecdysis
//!
//! Process-side plumbing for hot relay: handing a live listening socket and
//! an opaque state blob from one generation of a service to the next.
//!
//! ## Overview
//!
//! A hot relay moves a running service onto a fresh process by:
//! 1. Passing the already-listening socket to the new process via fd inheritance
//! 2. Pushing the old process's state snapshot over a one-shot Unix socket
//!    (the State Relay Protocol, length-prefixed framing)
//! 3. Letting both processes accept on the shared listener until the new one
//!    reports readiness
//! 4. Draining the old process's in-flight requests, after which it exits
//!
//! ## Descriptor Conventions
//!
//! - fd `3`: the inherited TCP listener (`LISTEN_FDS=1`, `LISTEN_FD_NAMES=http`)
//! - fd `4`: the generation control channel (`MOLT_CONTROL_FD=4`)
//!
//! ## Environment Variables
//!
//! - `LISTEN_FDS`: Number of inherited listeners (absent or `0` means cold start)
//! - `LISTEN_FD_NAMES`: Colon-separated names for each inherited fd
//! - `MOLT_CONTROL_FD`: Control channel descriptor
//! - `MOLT_STATE_SOCK`: Relay endpoint holding the previous generation's state
//! - `MOLT_GENERATION`: Generation id assigned by the supervisor
//! - `MOLT_MAX_STATE_BYTES`: Upper bound for a state snapshot
//! - `MOLT_RELAY_TIMEOUT_MS`: Relay send/receive timeout
//! - `MOLT_DRAIN_TIMEOUT_MS`: Drain timeout for in-flight requests (default: 30s)
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("molt-ecdysis requires a Unix platform (Linux or macOS)");

pub mod control;
mod dir;
pub mod env;
mod error;
mod inherit;
mod listener;
pub mod relay;
mod runtime;
mod shutdown;

pub use control::{ControlError, ControlReader, ControlWriter, GenerationReport, SupervisorCommand};
pub use dir::{ensure_socket_dir, PRIVATE_DIR_MODE};
pub use env::StartupEnv;
pub use error::{HandshakeError, RuntimeError};
pub use inherit::HandleTransfer;
pub use listener::{ListenerHandle, ListenerOrigin, DEFAULT_BACKLOG};
pub use relay::{PriorState, RelayChannel, RelayError, RelaySender, StateSnapshot};
pub use runtime::{AgentRuntime, InheritedHandles, Lifecycle, LifecycleEvent, Reporter, StatePusher};
pub use shutdown::{ConnectionGuard, GracefulShutdown, ShutdownSignal, ShutdownSignals};
