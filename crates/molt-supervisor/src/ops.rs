//! Operator control socket.
//!
//! One newline-delimited JSON request per connection, answered with one
//! response line:
//!
//! ```text
//! → {"op":"relay","command":["/usr/local/bin/agent-v2"]}
//! ← {"ok":true,"result":{"generation":2}}
//! ```
//!
//! The socket lives in the supervisor's private runtime directory with mode
//! 0600. A stale socket left by a crashed supervisor is removed at bind.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use molt_ecdysis::control::{self, ControlError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::supervisor::{RelayRequest, Supervisor};

const SOCKET_MODE: u32 = 0o600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpsRequest {
    /// Start a handoff, optionally to a different command.
    Relay {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<Vec<String>>,
    },
    Status,
    /// Cancel the pending handoff, if any.
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpsResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OpsResponse {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Error, Debug)]
pub enum OpsError {
    #[error("cannot reach supervisor at {path:?}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("control socket {0:?} belongs to a running supervisor")]
    InUse(PathBuf),

    #[error("supervisor closed the connection without replying")]
    NoResponse,

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("control socket I/O error: {0}")]
    Io(#[from] io::Error),
}

pub struct OpsServer {
    listener: UnixListener,
    path: PathBuf,
}

impl OpsServer {
    /// Bind the control socket at `path`.
    ///
    /// Must run inside a Tokio runtime.
    pub fn bind(path: &Path) -> Result<Self, OpsError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            molt_ecdysis::ensure_socket_dir(parent)?;
        }

        if path.exists() {
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(OpsError::InUse(path.to_path_buf()));
            }
            warn!(path = %path.display(), "Removing stale control socket");
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        info!(path = %path.display(), "Control socket listening");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept requests until `shutdown` fires. The socket file is removed
    /// when the server is dropped.
    pub async fn serve(self, supervisor: Supervisor, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let supervisor = supervisor.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, &supervisor).await {
                                debug!(error = %err, "Control connection ended with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "Failed to accept control connection"),
                },
            }
        }
        info!("Control socket closed");
    }
}

impl Drop for OpsServer {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "Failed to remove control socket");
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, supervisor: &Supervisor) -> Result<(), ControlError> {
    let (mut reader, mut writer) = control::split::<OpsRequest, OpsResponse>(stream);

    let response = match reader.recv().await {
        Ok(Some(request)) => {
            debug!(?request, "Operator request");
            dispatch(supervisor, request).await
        }
        Ok(None) => return Ok(()),
        Err(ControlError::Json(err)) => OpsResponse::failure(format!("malformed request: {err}")),
        Err(err) => return Err(err),
    };
    writer.send(&response).await
}

pub async fn dispatch(supervisor: &Supervisor, request: OpsRequest) -> OpsResponse {
    match request {
        OpsRequest::Relay { command } => match supervisor.relay(RelayRequest { command }).await {
            Ok(generation) => OpsResponse::success(json!({ "generation": generation })),
            Err(err) => OpsResponse::failure(err.to_string()),
        },
        OpsRequest::Status => match serde_json::to_value(supervisor.status().await) {
            Ok(status) => OpsResponse::success(status),
            Err(err) => OpsResponse::failure(err.to_string()),
        },
        OpsRequest::Cancel => {
            let cancelled = supervisor.cancel_pending().await;
            OpsResponse::success(json!({ "cancelled": cancelled }))
        }
    }
}

/// Send one request to a running supervisor.
pub async fn request(path: &Path, request: &OpsRequest) -> Result<OpsResponse, OpsError> {
    let stream = UnixStream::connect(path)
        .await
        .map_err(|source| OpsError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
    let (mut reader, mut writer) = control::split::<OpsResponse, OpsRequest>(stream);
    writer.send(request).await?;
    reader.recv().await?.ok_or(OpsError::NoResponse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let relay: OpsRequest = serde_json::from_str(r#"{"op":"relay"}"#).unwrap();
        assert_eq!(relay, OpsRequest::Relay { command: None });

        let json = serde_json::to_string(&OpsRequest::Relay {
            command: Some(vec!["agent".into(), "--v2".into()]),
        })
        .unwrap();
        assert_eq!(json, r#"{"op":"relay","command":["agent","--v2"]}"#);

        assert_eq!(serde_json::to_string(&OpsRequest::Status).unwrap(), r#"{"op":"status"}"#);
    }

    #[test]
    fn test_response_wire_shape() {
        let ok = serde_json::to_string(&OpsResponse::success(json!({ "cancelled": false }))).unwrap();
        assert_eq!(ok, r#"{"ok":true,"result":{"cancelled":false}}"#);

        let err = serde_json::to_string(&OpsResponse::failure("a handoff is already in progress")).unwrap();
        assert_eq!(err, r#"{"ok":false,"error":"a handoff is already in progress"}"#);
    }

    #[tokio::test]
    async fn test_client_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.sock");
        let server = OpsServer::bind(&path).unwrap();

        let responder = tokio::spawn(async move {
            let (stream, _) = server.listener.accept().await.unwrap();
            let (mut reader, mut writer) = control::split::<OpsRequest, OpsResponse>(stream);
            let request = reader.recv().await.unwrap().unwrap();
            assert_eq!(request, OpsRequest::Cancel);
            writer
                .send(&OpsResponse::success(json!({ "cancelled": true })))
                .await
                .unwrap();
        });

        let response = request(&path, &OpsRequest::Cancel).await.unwrap();
        responder.await.unwrap();
        assert!(response.ok);
        assert_eq!(response.result, Some(json!({ "cancelled": true })));
    }

    #[tokio::test]
    async fn test_bind_sets_permissions_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("supervisor.sock");

        let server = OpsServer::bind(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, SOCKET_MODE);

        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_in_shared_directory_keeps_its_mode() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared");
        std::fs::create_dir(&shared).unwrap();
        std::fs::set_permissions(&shared, std::fs::Permissions::from_mode(0o1777)).unwrap();
        let path = shared.join("molt.sock");

        let server = OpsServer::bind(&path).unwrap();

        let dir_mode = std::fs::metadata(&shared).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o7777, 0o1777);
        let sock_mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(sock_mode & 0o777, SOCKET_MODE);
        drop(server);
    }

    #[tokio::test]
    async fn test_bind_refuses_unprotected_directory() {
        let dir = tempfile::tempdir().unwrap();
        let open = dir.path().join("open");
        std::fs::create_dir(&open).unwrap();
        std::fs::set_permissions(&open, std::fs::Permissions::from_mode(0o777)).unwrap();

        let err = OpsServer::bind(&open.join("molt.sock")).err().unwrap();
        assert!(matches!(err, OpsError::Io(ref e) if e.kind() == io::ErrorKind::PermissionDenied));
        assert!(!open.join("molt.sock").exists());
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let server = OpsServer::bind(&path).unwrap();
        assert_eq!(server.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_live_socket_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.sock");
        let _running = OpsServer::bind(&path).unwrap();

        assert!(matches!(OpsServer::bind(&path), Err(OpsError::InUse(_))));
    }

    #[tokio::test]
    async fn test_unreachable_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let err = request(&dir.path().join("missing.sock"), &OpsRequest::Status)
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::Connect { .. }));
    }
}
