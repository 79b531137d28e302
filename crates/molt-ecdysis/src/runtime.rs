//! Agent-facing facade over the handshake, relay and control plumbing.
//!
//! An agent calls, in order: [`AgentRuntime::listener`],
//! [`AgentRuntime::prior_state`], [`AgentRuntime::notify_ready`], then loops
//! on [`Lifecycle::next`]. Without a supervisor every step degrades to the
//! cold-start behaviour: fresh bind, absent state, readiness is a no-op.

use std::net::SocketAddr;
use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::control::{self, ControlError, ControlReader, ControlWriter, GenerationReport, SupervisorCommand};
use crate::env::{StartupEnv, LISTENER_NAME, LISTEN_FDS_START};
use crate::error::{HandshakeError, RuntimeError};
use crate::listener::{claim_fd, ListenerHandle, DEFAULT_BACKLOG};
use crate::relay::{self, PriorState, RelayError, RelaySender, StateSnapshot};
use crate::shutdown::{ShutdownSignal, ShutdownSignals};

static CLAIMED: AtomicBool = AtomicBool::new(false);

/// Descriptors handed over by the parent process.
#[derive(Debug, Default)]
pub struct InheritedHandles {
    listener: Option<OwnedFd>,
    control: Option<OwnedFd>,
}

impl InheritedHandles {
    /// Nothing inherited.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(listener: Option<OwnedFd>, control: Option<OwnedFd>) -> Self {
        Self { listener, control }
    }

    /// Take ownership of the descriptors advertised by `env`.
    ///
    /// Succeeds at most once per process.
    pub fn claim(env: &StartupEnv) -> Result<Self, HandshakeError> {
        let wants_listener = expects_listener(env)?;
        if CLAIMED.swap(true, Ordering::SeqCst) {
            return Err(HandshakeError::AlreadyClaimed);
        }

        let listener = if wants_listener {
            Some(claim_fd(LISTEN_FDS_START)?)
        } else {
            None
        };
        let control = env.control_fd.map(claim_fd).transpose()?;

        debug!(
            listener = listener.is_some(),
            control = control.is_some(),
            "Claimed inherited descriptors"
        );
        Ok(Self { listener, control })
    }
}

/// Whether `env` advertises exactly one usable listener.
fn expects_listener(env: &StartupEnv) -> Result<bool, HandshakeError> {
    match env.inherited_fds {
        0 => Ok(false),
        1 => match env.fd_names.first() {
            Some(name) if name != LISTENER_NAME => {
                Err(HandshakeError::MissingListenerName(LISTENER_NAME.to_string()))
            }
            _ => Ok(true),
        },
        n => Err(HandshakeError::UnsupportedListenerCount(n)),
    }
}

/// Sends reports to the supervisor. Cloneable; a no-op when unsupervised.
#[derive(Clone)]
pub struct Reporter {
    writer: Option<Arc<Mutex<ControlWriter<GenerationReport>>>>,
}

impl Reporter {
    fn detached() -> Self {
        Self { writer: None }
    }

    pub fn is_supervised(&self) -> bool {
        self.writer.is_some()
    }

    pub async fn send(&self, report: GenerationReport) -> Result<(), ControlError> {
        let Some(writer) = &self.writer else {
            debug!(?report, "No supervisor, dropping report");
            return Ok(());
        };
        writer.lock().await.send(&report).await
    }
}

/// Serves this generation's snapshot to its successor.
#[derive(Clone)]
pub struct StatePusher {
    reporter: Reporter,
    max_bytes: usize,
    timeout: Duration,
}

impl StatePusher {
    /// Open the endpoint at `relay_path`, then hand `snapshot` to the first
    /// peer. Reports `relay_open`, then `state_sent` or `relay_failed`.
    pub async fn push(
        &self,
        relay_path: &Path,
        snapshot: StateSnapshot,
        cancel: &CancellationToken,
    ) -> Result<usize, RuntimeError> {
        let sender = match RelaySender::open(relay_path, self.max_bytes) {
            Ok(sender) => sender,
            Err(err) => return Err(self.fail(err).await),
        };
        self.reporter.send(GenerationReport::RelayOpen).await?;

        let sent = tokio::select! {
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            sent = sender.send(&snapshot, self.timeout) => sent,
        };

        match sent {
            Ok(bytes) => {
                self.reporter.send(GenerationReport::StateSent { bytes }).await?;
                Ok(bytes)
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    /// Refuse a handoff without opening the endpoint, e.g. when the state
    /// could not be captured. The supervisor aborts and keeps this generation.
    pub async fn abandon(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(%reason, "Abandoning state relay");
        if let Err(err) = self.reporter.send(GenerationReport::RelayFailed { reason }).await {
            warn!(error = %err, "Could not report relay failure");
        }
    }

    async fn fail(&self, err: RelayError) -> RuntimeError {
        error!(error = %err, "State relay failed");
        let report = GenerationReport::RelayFailed {
            reason: err.to_string(),
        };
        if let Err(send_err) = self.reporter.send(report).await {
            warn!(error = %send_err, "Could not report relay failure");
        }
        err.into()
    }
}

/// What the supervisor (or the OS) wants from this generation next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Handoff { relay_path: PathBuf },
    AbortHandoff,
    Drain,
    Signal(ShutdownSignal),
}

impl From<SupervisorCommand> for LifecycleEvent {
    fn from(command: SupervisorCommand) -> Self {
        match command {
            SupervisorCommand::Handoff { relay_path } => Self::Handoff { relay_path },
            SupervisorCommand::AbortHandoff => Self::AbortHandoff,
            SupervisorCommand::Drain => Self::Drain,
        }
    }
}

/// Stream of lifecycle events from the control channel and signals.
pub struct Lifecycle {
    commands: Option<ControlReader<SupervisorCommand>>,
    signals: ShutdownSignals,
}

enum Polled {
    Signal(ShutdownSignal),
    Command(Result<Option<SupervisorCommand>, ControlError>),
}

impl Lifecycle {
    pub async fn next(&mut self) -> LifecycleEvent {
        loop {
            let polled = {
                let commands = &mut self.commands;
                let signals = &mut self.signals;
                tokio::select! {
                    signal = signals.recv() => Polled::Signal(signal),
                    command = next_command(commands) => Polled::Command(command),
                }
            };

            match polled {
                Polled::Signal(signal) => return LifecycleEvent::Signal(signal),
                Polled::Command(Ok(Some(command))) => {
                    debug!(?command, "Supervisor command");
                    return command.into();
                }
                Polled::Command(Ok(None)) => {
                    warn!("Control channel closed by supervisor, continuing unsupervised");
                    self.commands = None;
                }
                Polled::Command(Err(ControlError::Json(err))) => {
                    warn!(error = %err, "Ignoring malformed supervisor command");
                }
                Polled::Command(Err(err)) => {
                    error!(error = %err, "Control channel failed, continuing unsupervised");
                    self.commands = None;
                }
            }
        }
    }
}

async fn next_command(
    commands: &mut Option<ControlReader<SupervisorCommand>>,
) -> Result<Option<SupervisorCommand>, ControlError> {
    match commands {
        Some(reader) => reader.recv().await,
        None => std::future::pending().await,
    }
}

/// Per-process entry point for a relay-capable agent.
pub struct AgentRuntime {
    env: StartupEnv,
    listener_fd: Option<OwnedFd>,
    listener_taken: bool,
    state_taken: bool,
    reporter: Reporter,
    commands: Option<ControlReader<SupervisorCommand>>,
    lifecycle_taken: bool,
}

impl AgentRuntime {
    /// Capture the startup markers and claim inherited descriptors.
    ///
    /// Must run inside a Tokio runtime.
    pub fn from_env() -> Result<Self, RuntimeError> {
        let env = StartupEnv::capture()?;
        let handles = InheritedHandles::claim(&env)?;
        Self::from_parts(env, handles)
    }

    /// Build from explicit markers and handles.
    ///
    /// Must run inside a Tokio runtime.
    pub fn from_parts(env: StartupEnv, handles: InheritedHandles) -> Result<Self, RuntimeError> {
        let (commands, reporter) = match handles.control {
            Some(fd) => {
                let stream = control::stream_from_fd(fd)?;
                let (reader, writer) = control::split(stream);
                let reporter = Reporter {
                    writer: Some(Arc::new(Mutex::new(writer))),
                };
                (Some(reader), reporter)
            }
            None => (None, Reporter::detached()),
        };

        info!(
            generation = ?env.generation,
            inherited_listener = env.inherits_listener(),
            relay = env.relay_path.is_some(),
            supervised = reporter.is_supervised(),
            "Agent runtime initialised"
        );

        Ok(Self {
            env,
            listener_fd: handles.listener,
            listener_taken: false,
            state_taken: false,
            reporter,
            commands,
            lifecycle_taken: false,
        })
    }

    pub fn env(&self) -> &StartupEnv {
        &self.env
    }

    pub fn generation(&self) -> Option<u64> {
        self.env.generation
    }

    /// Whether a predecessor's state is waiting for this generation.
    pub fn is_relay(&self) -> bool {
        self.env.relay_path.is_some()
    }

    /// Adopt the inherited listener, or bind `cold_addr` when none was
    /// advertised. Callable once.
    pub async fn listener(&mut self, cold_addr: SocketAddr) -> Result<ListenerHandle, RuntimeError> {
        if self.listener_taken {
            return Err(HandshakeError::ListenerTaken.into());
        }
        self.listener_taken = true;

        if !self.env.inherits_listener() {
            info!(addr = %cold_addr, "Cold start, binding listener");
            return Ok(ListenerHandle::bind(cold_addr, DEFAULT_BACKLOG).await?);
        }

        let fd = self.listener_fd.take().ok_or(HandshakeError::MissingInherited {
            expected: self.env.inherited_fds,
        })?;
        Ok(ListenerHandle::adopt(fd)?)
    }

    /// Pull the predecessor's snapshot. Callable once.
    pub async fn prior_state(&mut self) -> Result<PriorState, RuntimeError> {
        if self.state_taken {
            return Err(RuntimeError::StateTaken);
        }
        self.state_taken = true;

        let state = relay::receive(
            self.env.relay_path.as_deref(),
            self.env.max_state_bytes,
            self.env.relay_timeout,
        )
        .await?;
        Ok(state)
    }

    /// Tell the supervisor this generation is serving.
    pub async fn notify_ready(&self) -> Result<(), RuntimeError> {
        self.reporter.send(GenerationReport::Ready).await?;
        info!(generation = ?self.env.generation, "Reported ready");
        Ok(())
    }

    pub fn reporter(&self) -> Reporter {
        self.reporter.clone()
    }

    pub fn pusher(&self) -> StatePusher {
        StatePusher {
            reporter: self.reporter.clone(),
            max_bytes: self.env.max_state_bytes,
            timeout: self.env.relay_timeout,
        }
    }

    /// Lifecycle events. Callable once; registers signal handlers.
    pub fn lifecycle(&mut self) -> Result<Lifecycle, RuntimeError> {
        if self.lifecycle_taken {
            return Err(RuntimeError::LifecycleTaken);
        }
        self.lifecycle_taken = true;

        Ok(Lifecycle {
            commands: self.commands.take(),
            signals: ShutdownSignals::register()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsFd;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn supervised_env(relay_path: Option<PathBuf>) -> StartupEnv {
        StartupEnv {
            inherited_fds: 1,
            fd_names: vec![LISTENER_NAME.to_string()],
            control_fd: Some(4),
            relay_path,
            generation: Some(2),
            ..StartupEnv::default()
        }
    }

    /// Supervisor end of a control socketpair plus the generation's fd.
    fn control_pair() -> (
        ControlReader<GenerationReport>,
        ControlWriter<SupervisorCommand>,
        OwnedFd,
    ) {
        let (ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        let ours = control::stream_from_fd(OwnedFd::from(ours)).unwrap();
        let (reader, writer) = control::split(ours);
        (reader, writer, OwnedFd::from(theirs))
    }

    #[test]
    fn test_expects_listener() {
        assert!(!expects_listener(&StartupEnv::default()).unwrap());
        assert!(expects_listener(&supervised_env(None)).unwrap());

        let unnamed = StartupEnv {
            inherited_fds: 1,
            ..StartupEnv::default()
        };
        assert!(expects_listener(&unnamed).unwrap());

        let two = StartupEnv {
            inherited_fds: 2,
            ..StartupEnv::default()
        };
        assert!(matches!(
            expects_listener(&two),
            Err(HandshakeError::UnsupportedListenerCount(2))
        ));

        let misnamed = StartupEnv {
            inherited_fds: 1,
            fd_names: vec!["grpc".to_string()],
            ..StartupEnv::default()
        };
        assert!(matches!(
            expects_listener(&misnamed),
            Err(HandshakeError::MissingListenerName(_))
        ));
    }

    #[test]
    fn test_claim_succeeds_once() {
        let env = StartupEnv::default();
        let handles = InheritedHandles::claim(&env).unwrap();
        assert!(handles.listener.is_none());
        assert!(handles.control.is_none());

        assert!(matches!(
            InheritedHandles::claim(&env),
            Err(HandshakeError::AlreadyClaimed)
        ));
    }

    #[tokio::test]
    async fn test_cold_start_binds_and_skips_state() {
        let mut runtime =
            AgentRuntime::from_parts(StartupEnv::default(), InheritedHandles::none()).unwrap();
        assert!(!runtime.is_relay());

        let listener = runtime
            .listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(listener.origin(), crate::ListenerOrigin::Bound);

        assert!(runtime.prior_state().await.unwrap().is_absent());
        runtime.notify_ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_and_state_are_single_use() {
        let mut runtime =
            AgentRuntime::from_parts(StartupEnv::default(), InheritedHandles::none()).unwrap();

        runtime
            .listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(matches!(
            runtime.listener("127.0.0.1:0".parse().unwrap()).await,
            Err(RuntimeError::Handshake(HandshakeError::ListenerTaken))
        ));

        runtime.prior_state().await.unwrap();
        assert!(matches!(
            runtime.prior_state().await,
            Err(RuntimeError::StateTaken)
        ));
    }

    /// Advertised but not handed over is fatal, never a fresh bind.
    #[tokio::test]
    async fn test_missing_inherited_listener_is_fatal() {
        let mut runtime =
            AgentRuntime::from_parts(supervised_env(None), InheritedHandles::none()).unwrap();
        let err = runtime
            .listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Handshake(HandshakeError::MissingInherited { expected: 1 })
        ));
    }

    #[tokio::test]
    async fn test_adopts_inherited_listener_and_reports_ready() {
        let shared = ListenerHandle::bind("127.0.0.1:0".parse().unwrap(), DEFAULT_BACKLOG)
            .await
            .unwrap();
        let (mut reports, _commands, control_fd) = control_pair();

        let handles = InheritedHandles::new(
            Some(shared.as_fd().try_clone_to_owned().unwrap()),
            Some(control_fd),
        );
        let mut runtime = AgentRuntime::from_parts(supervised_env(None), handles).unwrap();
        assert_eq!(runtime.generation(), Some(2));

        let adopted = runtime
            .listener("127.0.0.1:1".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(adopted.local_addr(), shared.local_addr());
        assert_eq!(adopted.origin(), crate::ListenerOrigin::Inherited);

        runtime.notify_ready().await.unwrap();
        assert_eq!(reports.recv().await.unwrap(), Some(GenerationReport::Ready));
    }

    #[tokio::test]
    async fn test_push_reaches_successor_and_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let relay_path = dir.path().join("relay.sock");
        let (mut reports, _commands, control_fd) = control_pair();

        let old = AgentRuntime::from_parts(
            StartupEnv::default(),
            InheritedHandles::new(None, Some(control_fd)),
        )
        .unwrap();
        let pusher = old.pusher();
        let push_path = relay_path.clone();
        let push = tokio::spawn(async move {
            pusher
                .push(
                    &push_path,
                    StateSnapshot::new(&b"memory"[..]),
                    &CancellationToken::new(),
                )
                .await
        });

        assert_eq!(reports.recv().await.unwrap(), Some(GenerationReport::RelayOpen));

        let mut new = AgentRuntime::from_parts(
            StartupEnv {
                relay_path: Some(relay_path),
                relay_timeout: TIMEOUT,
                ..StartupEnv::default()
            },
            InheritedHandles::none(),
        )
        .unwrap();
        let state = new.prior_state().await.unwrap();
        assert_eq!(state.into_snapshot().payload(), b"memory");

        assert_eq!(push.await.unwrap().unwrap(), 6);
        assert_eq!(
            reports.recv().await.unwrap(),
            Some(GenerationReport::StateSent { bytes: 6 })
        );
    }

    #[tokio::test]
    async fn test_cancelled_push_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let relay_path = dir.path().join("relay.sock");
        let (mut reports, _commands, control_fd) = control_pair();

        let runtime = AgentRuntime::from_parts(
            StartupEnv::default(),
            InheritedHandles::new(None, Some(control_fd)),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runtime
            .pusher()
            .push(&relay_path, StateSnapshot::new(&b"x"[..]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Relay(RelayError::Cancelled)));

        assert_eq!(reports.recv().await.unwrap(), Some(GenerationReport::RelayOpen));
        assert!(matches!(
            reports.recv().await.unwrap(),
            Some(GenerationReport::RelayFailed { .. })
        ));
        assert!(!relay_path.exists());
    }

    #[tokio::test]
    async fn test_abandoned_push_reports_failure_only() {
        let (mut reports, _commands, control_fd) = control_pair();
        let runtime = AgentRuntime::from_parts(
            StartupEnv::default(),
            InheritedHandles::new(None, Some(control_fd)),
        )
        .unwrap();

        runtime.pusher().abandon("snapshot failed").await;

        assert_eq!(
            reports.recv().await.unwrap(),
            Some(GenerationReport::RelayFailed {
                reason: "snapshot failed".into()
            })
        );
    }

    #[tokio::test]
    async fn test_lifecycle_yields_supervisor_commands() {
        let (_reports, mut commands, control_fd) = control_pair();
        let mut runtime = AgentRuntime::from_parts(
            StartupEnv::default(),
            InheritedHandles::new(None, Some(control_fd)),
        )
        .unwrap();
        let mut lifecycle = runtime.lifecycle().unwrap();
        assert!(matches!(runtime.lifecycle(), Err(RuntimeError::LifecycleTaken)));

        commands
            .send(&SupervisorCommand::Handoff {
                relay_path: PathBuf::from("/tmp/relay.sock"),
            })
            .await
            .unwrap();
        commands.send(&SupervisorCommand::AbortHandoff).await.unwrap();
        commands.send(&SupervisorCommand::Drain).await.unwrap();

        assert_eq!(
            lifecycle.next().await,
            LifecycleEvent::Handoff {
                relay_path: PathBuf::from("/tmp/relay.sock")
            }
        );
        assert_eq!(lifecycle.next().await, LifecycleEvent::AbortHandoff);
        assert_eq!(lifecycle.next().await, LifecycleEvent::Drain);
    }

    #[tokio::test]
    async fn test_lifecycle_survives_closed_control_channel() {
        let (reports, commands, control_fd) = control_pair();
        let mut runtime = AgentRuntime::from_parts(
            StartupEnv::default(),
            InheritedHandles::new(None, Some(control_fd)),
        )
        .unwrap();
        let mut lifecycle = runtime.lifecycle().unwrap();

        drop(commands);
        drop(reports);

        let next = tokio::time::timeout(Duration::from_millis(100), lifecycle.next()).await;
        assert!(next.is_err());
        assert!(lifecycle.commands.is_none());
    }

    #[tokio::test]
    async fn test_unsupervised_reporter_is_noop() {
        let runtime =
            AgentRuntime::from_parts(StartupEnv::default(), InheritedHandles::none()).unwrap();
        assert!(!runtime.reporter().is_supervised());
        runtime
            .reporter()
            .send(GenerationReport::RelayOpen)
            .await
            .unwrap();
    }
}
