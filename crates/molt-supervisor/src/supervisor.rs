//! The generation supervisor.
//!
//! Owns the service listener for its whole lifetime and moves traffic from
//! one generation of the service to the next:
//!
//! 1. run pre-flight hooks
//! 2. allocate a relay channel and send `handoff` to the active generation
//! 3. wait for `relay_open`, then spawn the successor with the listener and
//!    the relay path
//! 4. wait for `ready` (or exit, cancellation, `relay_failed`, timeout)
//! 5. promote the successor, tell the old generation to drain, and reap it
//!    within the exit grace period
//!
//! Any failure before step 5 kills the successor and tells the old
//! generation to carry on; the old generation is never touched otherwise.
//! Post-process hooks run once the outcome is settled.

use std::net::SocketAddr;
use std::os::unix::io::AsFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use molt_ecdysis::{GenerationReport, ListenerHandle, RelayChannel, SupervisorCommand};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::generation::{Generation, GenerationId, GenerationTable, StartKind};
use crate::hooks::{self, HandoffReport};
use crate::metrics::{MetricsServer, RelayMetrics};
use crate::ops::OpsServer;
use crate::process::{self, GenerationProcess, SpawnSpec};

/// Parameters of one handoff.
#[derive(Debug, Clone, Default)]
pub struct RelayRequest {
    /// Replacement command for the successor. Becomes the default for later
    /// handoffs once the successor is active.
    pub command: Option<Vec<String>>,
}

/// How a handoff ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl HandoffOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Handoff counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub forced_terminations: u64,
    pub last_handoff_ms: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub service: String,
    pub listen_addr: SocketAddr,
    pub active: Option<GenerationId>,
    pub handoff_pending: bool,
    pub generations: Vec<Generation>,
    pub relays: RelayStats,
}

impl StatusReport {
    pub fn generation(&self, id: GenerationId) -> Option<&Generation> {
        self.generations.iter().find(|g| g.id == id)
    }
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    listener: ListenerHandle,
    command: RwLock<Vec<String>>,
    table: RwLock<GenerationTable>,
    current: RwLock<Option<Arc<GenerationProcess>>>,
    handoff_lock: Arc<Mutex<()>>,
    pending: Mutex<Option<CancellationToken>>,
    stats: Mutex<RelayStats>,
    metrics: Arc<RelayMetrics>,
    shutdown: CancellationToken,
    lost_active: CancellationToken,
}

impl Supervisor {
    /// Bind the listener and bring up the first generation.
    pub async fn start(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        config.validate()?;
        let metrics = Arc::new(RelayMetrics::new()?);

        let listener = ListenerHandle::bind(config.listener.address, config.listener.backlog).await?;
        info!(
            service = %config.service_name(),
            addr = %listener.local_addr(),
            "Service listener bound"
        );

        let supervisor = Self {
            inner: Arc::new(Inner {
                command: RwLock::new(config.service.command.clone()),
                config,
                listener,
                table: RwLock::new(GenerationTable::default()),
                current: RwLock::new(None),
                handoff_lock: Arc::new(Mutex::new(())),
                pending: Mutex::new(None),
                stats: Mutex::new(RelayStats::default()),
                metrics,
                shutdown: CancellationToken::new(),
                lost_active: CancellationToken::new(),
            }),
        };
        supervisor.boot().await?;
        Ok(supervisor)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.listener.local_addr()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.inner.metrics
    }

    async fn boot(&self) -> Result<(), SupervisorError> {
        let command = self.inner.command.read().await.clone();
        let process = self.spawn(StartKind::Cold, &command, None).await?;

        if let Err(err) = self.wait_ready(&process, None, &self.inner.shutdown).await {
            self.discard(&process, &err.to_string()).await;
            return Err(err);
        }

        self.inner.table.write().await.promote(process.id())?;
        info!(generation = %process.id(), pid = process.pid(), "First generation active");
        self.inner.metrics.set_active(Some(process.id()));
        *self.inner.current.write().await = Some(process);
        Ok(())
    }

    /// Replace the active generation. Only one handoff runs at a time.
    pub async fn relay(&self, request: RelayRequest) -> Result<GenerationId, SupervisorError> {
        let guard = Arc::clone(&self.inner.handoff_lock)
            .try_lock_owned()
            .map_err(|_| SupervisorError::HandoffInProgress)?;
        if self.inner.shutdown.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }

        let old = self
            .inner
            .current
            .read()
            .await
            .clone()
            .filter(|process| process.exit_status().is_none())
            .ok_or(SupervisorError::NoActiveGeneration)?;

        let cancel = self.inner.shutdown.child_token();
        *self.inner.pending.lock().await = Some(cancel.clone());

        info!(from = %old.id(), "Starting handoff");
        let started = Instant::now();
        let result = self.handoff(&old, request, &cancel).await;
        *self.inner.pending.lock().await = None;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        let outcome = match &result {
            Ok(_) => HandoffOutcome::Succeeded,
            Err(SupervisorError::Cancelled) => HandoffOutcome::Cancelled,
            Err(_) => HandoffOutcome::Failed,
        };
        self.inner.metrics.handoff_finished(outcome, elapsed);

        let mut stats = self.inner.stats.lock().await;
        match result {
            Ok(new) => {
                stats.succeeded += 1;
                stats.last_handoff_ms = Some(elapsed_ms);
                drop(stats);
                info!(from = %old.id(), to = %new.id(), elapsed_ms, "Handoff complete");

                old.request_drain().await;
                let report = HandoffReport {
                    outcome,
                    from: old.id(),
                    to: Some(new.id()),
                    error: None,
                };
                self.retire(old, report, guard);
                Ok(new.id())
            }
            Err(err) => {
                if outcome == HandoffOutcome::Cancelled {
                    stats.cancelled += 1;
                    warn!(from = %old.id(), elapsed_ms, "Handoff cancelled, previous generation stays active");
                } else {
                    stats.failed += 1;
                    stats.last_error = Some(err.to_string());
                    error!(from = %old.id(), elapsed_ms, error = %err, "Handoff failed, previous generation stays active");
                }
                drop(stats);

                let report = HandoffReport {
                    outcome,
                    from: old.id(),
                    to: None,
                    error: Some(err.to_string()),
                };
                hooks::run_post_process(&self.inner.config.post_process, &report).await;
                drop(guard);
                Err(err)
            }
        }
    }

    async fn handoff(
        &self,
        old: &GenerationProcess,
        request: RelayRequest,
        cancel: &CancellationToken,
    ) -> Result<Arc<GenerationProcess>, SupervisorError> {
        tokio::select! {
            result = hooks::run_preflight(&self.inner.config.pre_flight) => result?,
            _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
        }

        let channel = RelayChannel::allocate(&self.inner.config.handoff.runtime_dir)?;

        old.discard_stale_reports().await;
        old.send(SupervisorCommand::Handoff {
            relay_path: channel.path().to_path_buf(),
        })
        .await?;
        if let Err(err) = self.wait_relay_open(old, cancel).await {
            abort_handoff(old).await;
            return Err(err);
        }

        let command = match request.command {
            Some(command) if !command.is_empty() => command,
            _ => self.inner.command.read().await.clone(),
        };
        let new = match self.spawn(StartKind::Relay, &command, Some(channel.path())).await {
            Ok(new) => new,
            Err(err) => {
                abort_handoff(old).await;
                return Err(err);
            }
        };

        if let Err(err) = self.wait_ready(&new, Some(old), cancel).await {
            self.discard(&new, &err.to_string()).await;
            abort_handoff(old).await;
            return Err(err);
        }

        let promoted = self.inner.table.write().await.promote(new.id());
        if let Err(err) = promoted {
            self.discard(&new, &err.to_string()).await;
            abort_handoff(old).await;
            return Err(err.into());
        }
        *self.inner.current.write().await = Some(Arc::clone(&new));
        *self.inner.command.write().await = command;
        self.inner.metrics.set_active(Some(new.id()));

        drop(channel);
        Ok(new)
    }

    async fn spawn(
        &self,
        kind: StartKind,
        command: &[String],
        relay_path: Option<&Path>,
    ) -> Result<Arc<GenerationProcess>, SupervisorError> {
        let config = &self.inner.config;
        let id = self.inner.table.write().await.register(kind);

        let spawned = process::spawn_generation(SpawnSpec {
            id,
            command,
            env: &config.service.env,
            working_dir: config.service.working_dir.as_deref(),
            listener: self.inner.listener.as_fd(),
            relay_path,
            max_state_bytes: config.handoff.max_state_bytes,
            relay_timeout: config.handoff.relay_timeout(),
            drain_timeout: config.handoff.drain_timeout(),
        });
        let process = match spawned {
            Ok(process) => Arc::new(process),
            Err(err) => {
                self.fail_generation(id, &err.to_string()).await;
                return Err(err);
            }
        };

        self.inner
            .table
            .write()
            .await
            .mark_started(id, process.pid())?;
        self.watch_exit(Arc::clone(&process));
        Ok(process)
    }

    /// Record the exit of `process` and flag the loss of an active generation.
    fn watch_exit(&self, process: Arc<GenerationProcess>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let summary = process.wait_exit().await;
            let was_active = inner
                .table
                .write()
                .await
                .record_exit(process.id(), &summary.to_string());

            if was_active {
                inner.metrics.set_active(None);
            }
            if was_active && !inner.shutdown.is_cancelled() {
                error!(
                    generation = %process.id(),
                    status = %summary,
                    "Active generation exited outside a handoff"
                );
                inner.lost_active.cancel();
            }
        });
    }

    async fn wait_relay_open(
        &self,
        old: &GenerationProcess,
        cancel: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        let timeout = self.inner.config.handoff.relay_open_timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(SupervisorError::Timeout {
                        generation: old.id(),
                        expected: "relay_open",
                        timeout,
                    });
                }
                _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
                report = old.next_report() => match report {
                    Some(GenerationReport::RelayOpen) => {
                        debug!(generation = %old.id(), "Relay endpoint open");
                        return Ok(());
                    }
                    Some(GenerationReport::RelayFailed { reason }) => {
                        return Err(SupervisorError::RelayFailed { generation: old.id(), reason });
                    }
                    Some(other) => debug!(generation = %old.id(), ?other, "Ignoring report"),
                    None => return Err(SupervisorError::ControlClosed { generation: old.id() }),
                },
            }
        }
    }

    /// Wait for `new` to report ready. While a handoff is pending, the old
    /// generation's reports are watched too: a failed relay aborts.
    async fn wait_ready(
        &self,
        new: &GenerationProcess,
        old: Option<&GenerationProcess>,
        cancel: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        let timeout = self.inner.config.handoff.ready_timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut new_reports = Some(new);
        let mut old_reports = old;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(SupervisorError::Timeout {
                        generation: new.id(),
                        expected: "ready",
                        timeout,
                    });
                }
                _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
                summary = new.wait_exit() => {
                    return Err(SupervisorError::ExitedEarly {
                        generation: new.id(),
                        status: summary.to_string(),
                    });
                }
                report = next_report(new_reports) => match report {
                    Some(GenerationReport::Ready) => {
                        info!(generation = %new.id(), pid = new.pid(), "Generation ready");
                        return Ok(());
                    }
                    Some(other) => debug!(generation = %new.id(), ?other, "Ignoring report while starting"),
                    // The exit branch reports why.
                    None => new_reports = None,
                },
                report = next_report(old_reports) => match (report, old_reports) {
                    (Some(GenerationReport::RelayFailed { reason }), Some(old)) => {
                        return Err(SupervisorError::RelayFailed { generation: old.id(), reason });
                    }
                    (Some(GenerationReport::StateSent { bytes }), Some(old)) => {
                        info!(generation = %old.id(), bytes, "State relayed to successor");
                    }
                    (Some(other), _) => debug!(?other, "Ignoring report from outgoing generation"),
                    (None, _) => old_reports = None,
                },
            }
        }
    }

    /// Reap the draining generation, then run the success hooks. Holds the
    /// handoff lock until both are done.
    fn retire(&self, old: Arc<GenerationProcess>, report: HandoffReport, guard: OwnedMutexGuard<()>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let grace = inner.config.handoff.exit_grace();
            let (summary, forced) = old.await_exit_or_kill(grace).await;
            if forced {
                warn!(
                    generation = %old.id(),
                    status = %summary,
                    "Draining generation ignored the exit grace period and was killed"
                );
                record_forced(&inner, old.id(), "retire").await;
            } else {
                info!(generation = %old.id(), status = %summary, "Previous generation retired");
            }

            hooks::run_post_process(&inner.config.post_process, &report).await;
            drop(guard);
        });
    }

    async fn discard(&self, process: &GenerationProcess, reason: &str) {
        warn!(generation = %process.id(), %reason, "Discarding generation");
        self.fail_generation(process.id(), reason).await;
        process.kill();
        process.wait_exit().await;
    }

    async fn fail_generation(&self, id: GenerationId, reason: &str) {
        if let Err(err) = self.inner.table.write().await.mark_failed(id, reason) {
            debug!(generation = %id, error = %err, "Generation already finished");
        }
    }

    /// Cancel the pending handoff. Returns `false` if none was pending.
    pub async fn cancel_pending(&self) -> bool {
        match self.inner.pending.lock().await.as_ref() {
            Some(token) => {
                info!("Cancelling pending handoff");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn status(&self) -> StatusReport {
        let (active, generations) = {
            let table = self.inner.table.read().await;
            (table.active_id(), table.snapshot())
        };
        StatusReport {
            service: self.inner.config.service_name().to_string(),
            listen_addr: self.local_addr(),
            active,
            handoff_pending: self.inner.pending.lock().await.is_some(),
            generations,
            relays: self.inner.stats.lock().await.clone(),
        }
    }

    /// Serve operator requests and signals until told to stop or the active
    /// generation is lost, then shut down.
    ///
    /// The first generation is already running, so a failure to set up the
    /// signal handlers, the control socket or the metrics endpoint still
    /// stops it before returning.
    pub async fn run(&self) -> Result<(), SupervisorError> {
        let RunHandles {
            mut sigterm,
            mut sigint,
            mut sighup,
            ops,
            metrics,
        } = match self.run_handles().await {
            Ok(handles) => handles,
            Err(err) => {
                error!(error = %err, "Supervisor could not start serving");
                self.shutdown().await;
                return Err(err);
            }
        };
        let ops_task = tokio::spawn(ops.serve(self.clone(), self.inner.shutdown.clone()));
        let metrics_task = metrics.map(|server| tokio::spawn(server.serve(self.inner.shutdown.clone())));

        let result = loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("Received SIGHUP, starting handoff");
                    let supervisor = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = supervisor.relay(RelayRequest::default()).await {
                            warn!(error = %err, "SIGHUP handoff did not complete");
                        }
                    });
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break Ok(());
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break Ok(());
                }
                _ = self.inner.lost_active.cancelled() => {
                    break Err(SupervisorError::ActiveGenerationLost);
                }
            }
        };

        self.shutdown().await;
        if let Err(err) = ops_task.await {
            warn!(error = %err, "Control socket task failed");
        }
        if let Some(task) = metrics_task {
            if let Err(err) = task.await {
                warn!(error = %err, "Metrics task failed");
            }
        }
        result
    }

    async fn run_handles(&self) -> Result<RunHandles, SupervisorError> {
        let metrics = match self.inner.config.observability.metrics_addr {
            Some(addr) => Some(MetricsServer::bind(addr, Arc::clone(&self.inner.metrics)).await?),
            None => None,
        };
        Ok(RunHandles {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sighup: signal(SignalKind::hangup())?,
            ops: OpsServer::bind(&self.inner.config.control_socket_path())?,
            metrics,
        })
    }

    /// Cancel any pending handoff, drain the active generation and reap it.
    pub async fn shutdown(&self) {
        info!("Supervisor shutting down");
        self.inner.shutdown.cancel();

        // Waits out a pending handoff's rollback or a retirement.
        let _guard = self.inner.handoff_lock.lock().await;

        let Some(process) = self.inner.current.write().await.take() else {
            return;
        };
        if process.exit_status().is_some() {
            return;
        }

        process.request_drain().await;
        let (summary, forced) = process
            .await_exit_or_kill(self.inner.config.handoff.exit_grace())
            .await;
        if forced {
            record_forced(&self.inner, process.id(), "shutdown").await;
        }
        info!(generation = %process.id(), status = %summary, "Generation stopped");
    }
}

struct RunHandles {
    sigterm: Signal,
    sigint: Signal,
    sighup: Signal,
    ops: OpsServer,
    metrics: Option<MetricsServer>,
}

async fn record_forced(inner: &Inner, id: GenerationId, phase: &str) {
    inner.table.write().await.mark_forced(id);
    inner.stats.lock().await.forced_terminations += 1;
    inner.metrics.forced_termination(phase);
}

async fn next_report(process: Option<&GenerationProcess>) -> Option<GenerationReport> {
    match process {
        Some(process) => process.next_report().await,
        None => std::future::pending().await,
    }
}

async fn abort_handoff(old: &GenerationProcess) {
    if let Err(err) = old.send(SupervisorCommand::AbortHandoff).await {
        warn!(generation = %old.id(), error = %err, "Could not tell generation the handoff was aborted");
    }
}
