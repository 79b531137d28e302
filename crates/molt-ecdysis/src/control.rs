//! Generation control channel.
//!
//! A socketpair inherited at fd 4 carries newline-delimited JSON in both
//! directions. The supervisor sends [`SupervisorCommand`]s; the generation
//! answers with [`GenerationReport`]s. The framing halves are generic so the
//! supervisor's operator socket can reuse them for its own message types.

use std::io;
use std::marker::PhantomData;
use std::os::unix::io::OwnedFd;
use std::path::PathBuf;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

/// Longest accepted control line.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control framing error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("control channel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Supervisor → generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorCommand {
    /// Open the relay endpoint at `relay_path` and serve the current snapshot.
    Handoff { relay_path: PathBuf },
    /// The pending handoff was abandoned: keep serving.
    AbortHandoff,
    /// A successor is active: stop accepting and drain.
    Drain,
}

/// Generation → supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationReport {
    Ready,
    RelayOpen,
    StateSent { bytes: usize },
    RelayFailed { reason: String },
}

/// Reading half: decodes one `T` per line.
pub struct ControlReader<T> {
    inner: FramedRead<OwnedReadHalf, LinesCodec>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ControlReader<T> {
    pub fn new(half: OwnedReadHalf) -> Self {
        Self {
            inner: FramedRead::new(half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            _marker: PhantomData,
        }
    }

    /// Next message, or `None` once the peer has closed its end.
    pub async fn recv(&mut self) -> Result<Option<T>, ControlError> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(line) => {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Ok(Some(serde_json::from_str(&line)?));
                }
            }
        }
    }
}

/// Writing half: encodes one `T` per line.
pub struct ControlWriter<T> {
    inner: FramedWrite<OwnedWriteHalf, LinesCodec>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> ControlWriter<T> {
    pub fn new(half: OwnedWriteHalf) -> Self {
        Self {
            inner: FramedWrite::new(half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            _marker: PhantomData,
        }
    }

    pub async fn send(&mut self, message: &T) -> Result<(), ControlError> {
        let line = serde_json::to_string(message)?;
        self.inner.send(line).await?;
        Ok(())
    }
}

/// Split a connected stream into typed halves.
pub fn split<R, W>(stream: UnixStream) -> (ControlReader<R>, ControlWriter<W>)
where
    R: DeserializeOwned,
    W: Serialize,
{
    let (read, write) = stream.into_split();
    (ControlReader::new(read), ControlWriter::new(write))
}

/// Wrap an inherited (or socketpair) descriptor as a Tokio stream.
///
/// Must run inside a Tokio runtime.
pub fn stream_from_fd(fd: OwnedFd) -> io::Result<UnixStream> {
    let std = std::os::unix::net::UnixStream::from(fd);
    std.set_nonblocking(true)?;
    UnixStream::from_std(std)
}
