//! Spawning and controlling one generation's OS process.
//!
//! Each generation gets the shared listener at fd 3 and one end of a fresh
//! control socketpair at fd 4. Two background tasks per process forward
//! control reports into a channel and reap the exit status.

use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use molt_ecdysis::control::{self, ControlWriter, GenerationReport, SupervisorCommand};
use molt_ecdysis::env::{
    CONTROL_FD, CONTROL_FD_ENV, DRAIN_TIMEOUT_ENV, GENERATION_ENV, LISTENER_NAME, LISTEN_FDS,
    LISTEN_FDS_START, LISTEN_FD_NAMES, MAX_STATE_BYTES_ENV, RELAY_TIMEOUT_ENV, STATE_SOCK_ENV,
};
use molt_ecdysis::{ControlError, HandleTransfer};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::generation::GenerationId;

const REPORT_BUFFER: usize = 32;

/// Everything needed to start one generation.
pub struct SpawnSpec<'a> {
    pub id: GenerationId,
    pub command: &'a [String],
    pub env: &'a BTreeMap<String, String>,
    pub working_dir: Option<&'a Path>,
    pub listener: BorrowedFd<'a>,
    /// Relay endpoint to pull prior state from. `None` for a cold start.
    pub relay_path: Option<&'a Path>,
    pub max_state_bytes: usize,
    pub relay_timeout: Duration,
    pub drain_timeout: Duration,
}

/// How a generation's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSummary {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitSummary {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitSummary {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => match Signal::try_from(signal) {
                Ok(sig) => write!(f, "killed by {}", sig.as_str()),
                Err(_) => write!(f, "killed by signal {signal}"),
            },
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// A running (or reaped) generation process.
pub struct GenerationProcess {
    id: GenerationId,
    pid: u32,
    commands: Mutex<ControlWriter<SupervisorCommand>>,
    reports: Mutex<mpsc::Receiver<GenerationReport>>,
    exit: watch::Receiver<Option<ExitSummary>>,
}

impl GenerationProcess {
    pub fn id(&self) -> GenerationId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub async fn send(&self, command: SupervisorCommand) -> Result<(), ControlError> {
        debug!(generation = %self.id, ?command, "Sending command");
        self.commands.lock().await.send(&command).await
    }

    /// Next report, or `None` once the control channel has closed.
    pub async fn next_report(&self) -> Option<GenerationReport> {
        self.reports.lock().await.recv().await
    }

    /// Discard reports that arrived while nobody was listening.
    pub async fn discard_stale_reports(&self) {
        let mut reports = self.reports.lock().await;
        while let Ok(report) = reports.try_recv() {
            debug!(generation = %self.id, ?report, "Discarding stale report");
        }
    }

    pub fn exit_status(&self) -> Option<ExitSummary> {
        *self.exit.borrow()
    }

    pub async fn wait_exit(&self) -> ExitSummary {
        let mut exit = self.exit.clone();
        loop {
            if let Some(summary) = *exit.borrow_and_update() {
                return summary;
            }
            if exit.changed().await.is_err() {
                // Reaper gone without a status; nothing more will arrive.
                return (*exit.borrow()).unwrap_or(ExitSummary {
                    code: None,
                    signal: None,
                });
            }
        }
    }

    /// Deliver `signal` unless the process was already reaped.
    pub fn signal(&self, signal: Signal) -> Result<(), SupervisorError> {
        if self.exit_status().is_some() {
            return Ok(());
        }
        let pid = i32::try_from(self.pid)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(errno) => Err(std::io::Error::from(errno).into()),
        }
    }

    /// Ask the process to drain over the control channel, falling back to
    /// SIGTERM when the channel is broken.
    pub async fn request_drain(&self) {
        if let Err(err) = self.send(SupervisorCommand::Drain).await {
            warn!(generation = %self.id, error = %err, "Control channel broken, sending SIGTERM");
            if let Err(err) = self.signal(Signal::SIGTERM) {
                warn!(generation = %self.id, error = %err, "Failed to send SIGTERM");
            }
        }
    }

    /// Wait up to `grace` for the process to exit, then SIGKILL it.
    ///
    /// Returns the exit summary and whether a kill was needed.
    pub async fn await_exit_or_kill(&self, grace: Duration) -> (ExitSummary, bool) {
        if let Ok(summary) = tokio::time::timeout(grace, self.wait_exit()).await {
            return (summary, false);
        }

        warn!(
            generation = %self.id,
            pid = self.pid,
            grace_ms = grace.as_millis() as u64,
            "Generation did not exit within grace period, sending SIGKILL"
        );
        if let Err(err) = self.signal(Signal::SIGKILL) {
            warn!(generation = %self.id, error = %err, "Failed to send SIGKILL");
        }
        (self.wait_exit().await, true)
    }

    pub fn kill(&self) {
        if let Err(err) = self.signal(Signal::SIGKILL) {
            warn!(generation = %self.id, error = %err, "Failed to send SIGKILL");
        }
    }
}

/// Start a generation with the listener and a control channel attached.
pub fn spawn_generation(spec: SpawnSpec<'_>) -> Result<GenerationProcess, SupervisorError> {
    let id = spec.id;
    let spawn_err = |source: std::io::Error| SupervisorError::Spawn { generation: id, source };

    let (program, args) = spec.command.split_first().ok_or_else(|| {
        spawn_err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty command",
        ))
    })?;

    let (ours, theirs) = std::os::unix::net::UnixStream::pair().map_err(spawn_err)?;
    let theirs = OwnedFd::from(theirs);

    let mut transfer = HandleTransfer::new();
    transfer.stage(spec.listener, LISTEN_FDS_START).map_err(spawn_err)?;
    transfer.stage(theirs.as_fd(), CONTROL_FD).map_err(spawn_err)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(spec.env)
        .env(LISTEN_FDS, "1")
        .env(LISTEN_FD_NAMES, LISTENER_NAME)
        .env(CONTROL_FD_ENV, CONTROL_FD.to_string())
        .env(GENERATION_ENV, id.to_string())
        .env(MAX_STATE_BYTES_ENV, spec.max_state_bytes.to_string())
        .env(RELAY_TIMEOUT_ENV, spec.relay_timeout.as_millis().to_string())
        .env(DRAIN_TIMEOUT_ENV, spec.drain_timeout.as_millis().to_string())
        .env_remove("LISTEN_PID")
        .stdin(Stdio::null());
    match spec.relay_path {
        Some(path) => cmd.env(STATE_SOCK_ENV, path),
        None => cmd.env_remove(STATE_SOCK_ENV),
    };
    if let Some(dir) = spec.working_dir {
        cmd.current_dir(dir);
    }
    transfer.install(&mut cmd);

    let mut child = cmd.spawn().map_err(spawn_err)?;
    // The child holds its own copies now.
    drop(transfer);
    drop(theirs);

    let pid = child.id().ok_or_else(|| {
        spawn_err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "child exited before its pid was read",
        ))
    })?;
    info!(generation = %id, pid, program = %program, "Spawned generation");

    let stream = control::stream_from_fd(OwnedFd::from(ours)).map_err(spawn_err)?;
    let (mut reader, writer) = control::split::<GenerationReport, SupervisorCommand>(stream);

    let (report_tx, report_rx) = mpsc::channel(REPORT_BUFFER);
    tokio::spawn(async move {
        loop {
            match reader.recv().await {
                Ok(Some(report)) => {
                    debug!(generation = %id, ?report, "Report");
                    if report_tx.send(report).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(generation = %id, "Control channel closed");
                    break;
                }
                Err(ControlError::Json(err)) => {
                    warn!(generation = %id, error = %err, "Ignoring malformed report");
                }
                Err(err) => {
                    warn!(generation = %id, error = %err, "Control channel failed");
                    break;
                }
            }
        }
    });

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(async move {
        let summary = match child.wait().await {
            Ok(status) => ExitSummary::from(status),
            Err(err) => {
                warn!(generation = %id, error = %err, "Failed to reap generation");
                ExitSummary {
                    code: None,
                    signal: None,
                }
            }
        };
        info!(generation = %id, pid, status = %summary, "Generation exited");
        let _ = exit_tx.send(Some(summary));
    });

    Ok(GenerationProcess {
        id,
        pid,
        commands: Mutex::new(writer),
        reports: Mutex::new(report_rx),
        exit: exit_rx,
    })
}
