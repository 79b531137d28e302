//! Startup markers exchanged between the supervisor and a generation.
//!
//! The supervisor writes these into the child's environment at spawn time;
//! the generation reads them exactly once through [`StartupEnv::capture`].

use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::HandshakeError;
use crate::relay::DEFAULT_MAX_STATE_BYTES;

/// Number of inherited listening descriptors.
pub const LISTEN_FDS: &str = "LISTEN_FDS";
/// Colon-separated names of the inherited descriptors.
pub const LISTEN_FD_NAMES: &str = "LISTEN_FD_NAMES";
/// First inherited descriptor (0, 1 and 2 are stdio).
pub const LISTEN_FDS_START: RawFd = 3;
/// Name under which the service listener is passed.
pub const LISTENER_NAME: &str = "http";

/// Descriptor of the generation control channel.
pub const CONTROL_FD_ENV: &str = "MOLT_CONTROL_FD";
/// Fixed index the supervisor places the control channel at.
pub const CONTROL_FD: RawFd = 4;

/// Path of the State Relay Channel endpoint.
pub const STATE_SOCK_ENV: &str = "MOLT_STATE_SOCK";
/// Generation id assigned by the supervisor.
pub const GENERATION_ENV: &str = "MOLT_GENERATION";
/// Upper bound for a relayed snapshot, in bytes.
pub const MAX_STATE_BYTES_ENV: &str = "MOLT_MAX_STATE_BYTES";
/// Timeout for a single relay transfer, in milliseconds.
pub const RELAY_TIMEOUT_ENV: &str = "MOLT_RELAY_TIMEOUT_MS";
/// Drain timeout for in-flight requests, in milliseconds.
pub const DRAIN_TIMEOUT_ENV: &str = "MOLT_DRAIN_TIMEOUT_MS";

/// Default relay transfer timeout.
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(5);

/// Markers read once at process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupEnv {
    /// Inherited listener count. Zero means cold start.
    pub inherited_fds: usize,
    /// Names of the inherited listeners, in descriptor order.
    pub fd_names: Vec<String>,
    /// Control channel descriptor, when supervised.
    pub control_fd: Option<RawFd>,
    /// Relay endpoint to pull prior state from.
    pub relay_path: Option<PathBuf>,
    /// Generation id, when supervised.
    pub generation: Option<u64>,
    /// Snapshot size limit.
    pub max_state_bytes: usize,
    /// Relay transfer timeout.
    pub relay_timeout: Duration,
}

impl Default for StartupEnv {
    fn default() -> Self {
        Self {
            inherited_fds: 0,
            fd_names: Vec::new(),
            control_fd: None,
            relay_path: None,
            generation: None,
            max_state_bytes: DEFAULT_MAX_STATE_BYTES,
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
        }
    }
}

impl StartupEnv {
    /// Read the markers from the process environment.
    pub fn capture() -> Result<Self, HandshakeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the markers through an arbitrary lookup.
    ///
    /// A present but unparsable marker is an error: the parent promised
    /// something it did not deliver, and guessing would risk a second bind.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, HandshakeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let inherited_fds = parse_marker::<usize>(&lookup, LISTEN_FDS)?.unwrap_or(0);

        let fd_names = match lookup(LISTEN_FD_NAMES) {
            Some(raw) if !raw.is_empty() => raw.split(':').map(str::to_string).collect(),
            _ => Vec::new(),
        };

        if inherited_fds > 0 && !fd_names.is_empty() && fd_names.len() != inherited_fds {
            return Err(HandshakeError::InvalidMarker {
                var: LISTEN_FD_NAMES,
                value: fd_names.join(":"),
            });
        }

        let control_fd = parse_marker::<RawFd>(&lookup, CONTROL_FD_ENV)?;
        let generation = parse_marker::<u64>(&lookup, GENERATION_ENV)?;
        let max_state_bytes =
            parse_marker::<usize>(&lookup, MAX_STATE_BYTES_ENV)?.unwrap_or(DEFAULT_MAX_STATE_BYTES);
        let relay_timeout = parse_marker::<u64>(&lookup, RELAY_TIMEOUT_ENV)?
            .map_or(DEFAULT_RELAY_TIMEOUT, Duration::from_millis);

        let relay_path = lookup(STATE_SOCK_ENV)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            inherited_fds,
            fd_names,
            control_fd,
            relay_path,
            generation,
            max_state_bytes,
            relay_timeout,
        })
    }

    /// Whether the parent handed over a listening socket.
    pub fn inherits_listener(&self) -> bool {
        self.inherited_fds > 0
    }
}

fn parse_marker<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, HandshakeError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| HandshakeError::InvalidMarker { var, value }),
    }
}
