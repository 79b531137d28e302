//! State Relay Protocol (SRP).
//!
//! One Unix-socket connection carries exactly one message: a `u32`
//! big-endian length followed by that many payload bytes. The receiver
//! reads exactly the declared length, so a truncated transfer can never be
//! mistaken for a shorter (or empty) snapshot.
//!
//! A missing or refusing endpoint means "no predecessor": the receiver
//! yields [`PriorState::Absent`] instead of an error.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default upper bound for a snapshot (64 MiB).
pub const DEFAULT_MAX_STATE_BYTES: usize = 64 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;
const ENDPOINT_MODE: u32 = 0o600;

/// Errors from either side of a relay transfer.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("relay endpoint {0} already exists")]
    EndpointExists(PathBuf),

    #[error("relay connection closed after {received} of 4 length-prefix bytes")]
    MissingHeader { received: usize },

    #[error("state transfer truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("state snapshot of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("state relay timed out after {0:?}")]
    Timeout(Duration),

    #[error("state relay cancelled")]
    Cancelled,

    #[error("state relay I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Opaque application state handed from one generation to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    payload: Bytes,
}

impl StateSnapshot {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.payload
    }
}

/// What the incoming generation found at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorState {
    /// No relay endpoint was available: this is a cold start.
    Absent,
    /// A complete frame was read (possibly zero bytes long).
    Received(StateSnapshot),
}

impl PriorState {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Collapse to a snapshot, treating absence as empty state.
    pub fn into_snapshot(self) -> StateSnapshot {
        match self {
            Self::Absent => StateSnapshot::empty(),
            Self::Received(snapshot) => snapshot,
        }
    }
}

/// A single-use rendezvous address for one handoff.
///
/// Allocated by the supervisor before the new generation is spawned. The
/// path is unique per handoff and is unlinked when the channel is dropped.
#[derive(Debug)]
pub struct RelayChannel {
    path: PathBuf,
}

impl RelayChannel {
    /// Allocate a fresh endpoint path inside `dir`. A missing `dir` is
    /// created with mode 0700; an existing one must already be safe to share.
    pub fn allocate(dir: &Path) -> io::Result<Self> {
        crate::dir::ensure_socket_dir(dir)?;

        let path = dir.join(format!("relay-{}.sock", Uuid::new_v4().simple()));
        if path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("relay endpoint {} already exists", path.display()),
            ));
        }
        debug!(path = %path.display(), "Allocated relay channel");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        remove_endpoint(&self.path);
    }
}

/// Outgoing side: serves one snapshot to the first peer that connects.
#[derive(Debug)]
pub struct RelaySender {
    listener: UnixListener,
    path: PathBuf,
    max_bytes: usize,
}

impl RelaySender {
    /// Open the endpoint at `path`. Fails if anything already lives there.
    ///
    /// Must run inside a Tokio runtime.
    pub fn open(path: &Path, max_bytes: usize) -> Result<Self, RelayError> {
        if path.exists() {
            return Err(RelayError::EndpointExists(path.to_path_buf()));
        }
        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(ENDPOINT_MODE))?;
        info!(path = %path.display(), "Relay endpoint open");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            max_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the incoming generation, then write the framed snapshot.
    ///
    /// `timeout` bounds the wait for a peer and, separately, the write.
    /// Returns the payload length sent.
    pub async fn send(self, snapshot: &StateSnapshot, timeout: Duration) -> Result<usize, RelayError> {
        if snapshot.len() > self.max_bytes {
            return Err(RelayError::TooLarge {
                len: snapshot.len(),
                max: self.max_bytes,
            });
        }

        let (mut stream, _) = tokio::time::timeout(timeout, self.listener.accept())
            .await
            .map_err(|_| RelayError::Timeout(timeout))??;

        // The endpoint serves exactly one peer.
        remove_endpoint(&self.path);

        tokio::time::timeout(timeout, write_frame(&mut stream, snapshot, self.max_bytes))
            .await
            .map_err(|_| RelayError::Timeout(timeout))??;

        info!(bytes = snapshot.len(), "State snapshot relayed");
        Ok(snapshot.len())
    }
}

impl Drop for RelaySender {
    fn drop(&mut self) {
        remove_endpoint(&self.path);
    }
}

/// Incoming side: pull the predecessor's snapshot, if there is one.
pub async fn receive(
    path: Option<&Path>,
    max_bytes: usize,
    timeout: Duration,
) -> Result<PriorState, RelayError> {
    let Some(path) = path else {
        info!("No relay channel advertised, starting with empty state");
        return Ok(PriorState::Absent);
    };

    let mut stream = match UnixStream::connect(path).await {
        Ok(stream) => stream,
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
            ) =>
        {
            info!(path = %path.display(), error = %err, "Relay endpoint unavailable, starting with empty state");
            return Ok(PriorState::Absent);
        }
        Err(err) => return Err(err.into()),
    };

    let snapshot = tokio::time::timeout(timeout, read_frame(&mut stream, max_bytes))
        .await
        .map_err(|_| RelayError::Timeout(timeout))??;

    info!(bytes = snapshot.len(), "State snapshot received");
    Ok(PriorState::Received(snapshot))
}

/// Write one length-prefixed frame and shut the write side down.
pub async fn write_frame<W>(
    writer: &mut W,
    snapshot: &StateSnapshot,
    max_bytes: usize,
) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    let len = snapshot.len();
    let prefix = u32::try_from(len)
        .ok()
        .filter(|_| len <= max_bytes)
        .ok_or(RelayError::TooLarge {
            len,
            max: max_bytes.min(u32::MAX as usize),
        })?;

    writer.write_u32(prefix).await?;
    writer.write_all(snapshot.payload()).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}

/// Read exactly one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R, max_bytes: usize) -> Result<StateSnapshot, RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LENGTH_PREFIX];
    let received = read_full(reader, &mut header).await?;
    if received < LENGTH_PREFIX {
        return Err(RelayError::MissingHeader { received });
    }

    let expected = u32::from_be_bytes(header) as usize;
    if expected > max_bytes {
        return Err(RelayError::TooLarge {
            len: expected,
            max: max_bytes,
        });
    }

    let mut payload = vec![0u8; expected];
    let received = read_full(reader, &mut payload).await?;
    if received < expected {
        return Err(RelayError::Truncated { expected, received });
    }

    Ok(StateSnapshot::new(payload))
}

/// Fill `buf` until it is full or the peer closes. Returns bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn remove_endpoint(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed relay endpoint"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "Failed to remove relay endpoint"),
    }
}
