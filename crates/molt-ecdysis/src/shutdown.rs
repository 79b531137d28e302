//! Graceful drain coordinator.
//!
//! A generation told to drain (by the supervisor or by a signal) stops
//! accepting, waits for in-flight requests to finish within the drain
//! timeout, then exits. `CancellationToken` stops the accept loop and
//! `ConnectionGuard`s count what is still in flight.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::env::DRAIN_TIMEOUT_ENV;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Signal that asked the generation to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM: drain and exit.
    Terminate,
    /// SIGINT: drain and exit.
    Interrupt,
}

/// SIGTERM/SIGINT handlers, registered once.
pub struct ShutdownSignals {
    sigterm: Signal,
    sigint: Signal,
}

impl ShutdownSignals {
    /// Must run inside a Tokio runtime.
    pub fn register() -> io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    pub async fn recv(&mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                ShutdownSignal::Terminate
            }
            _ = self.sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
                ShutdownSignal::Interrupt
            }
        }
    }
}

/// Tracks one in-flight request for drain coordination.
///
/// The coordinator waits for all `ConnectionGuard`s to drop before
/// considering drain complete.
#[derive(Clone)]
pub struct ConnectionGuard {
    _drop_notifier: Arc<DropNotifier>,
}

struct DropNotifier {
    counter: Arc<AtomicUsize>,
    notify: Arc<tokio::sync::Notify>,
}

impl Drop for DropNotifier {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// Coordinator for graceful shutdown with connection draining.
#[derive(Clone)]
pub struct GracefulShutdown {
    /// Cancelled when the server should stop accepting new connections.
    stop_accepting: CancellationToken,

    /// In-flight counter.
    connection_count: Arc<AtomicUsize>,

    /// Notified when the last connection drains.
    drain_notify: Arc<tokio::sync::Notify>,

    drain_timeout: Duration,
}

impl GracefulShutdown {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            stop_accepting: CancellationToken::new(),
            connection_count: Arc::new(AtomicUsize::new(0)),
            drain_notify: Arc::new(tokio::sync::Notify::new()),
            drain_timeout,
        }
    }

    /// Drain timeout from `MOLT_DRAIN_TIMEOUT_MS`, or 30s.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let timeout = lookup(DRAIN_TIMEOUT_ENV)
            .and_then(|v| v.trim().parse().ok())
            .map_or(DEFAULT_DRAIN_TIMEOUT, Duration::from_millis);
        Self::new(timeout)
    }

    /// Token that fires when the accept loop should stop.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop_accepting.clone()
    }

    /// Increments the counter on creation, decrements on drop.
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            _drop_notifier: Arc::new(DropNotifier {
                counter: Arc::clone(&self.connection_count),
                notify: Arc::clone(&self.drain_notify),
            }),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Stop accepting new connections.
    pub fn trigger_stop(&self) {
        self.stop_accepting.cancel();
    }

    /// Wait for all in-flight work to complete or the timeout to expire.
    ///
    /// Returns `true` if everything drained, `false` if timed out.
    pub async fn drain(&self) -> bool {
        let active = self.active_connections();
        if active == 0 {
            info!("No active connections, drain complete");
            return true;
        }

        info!(
            active_connections = active,
            timeout_ms = self.drain_timeout.as_millis() as u64,
            "Draining active connections"
        );

        tokio::select! {
            _ = self.wait_for_drain() => {
                info!("All connections drained cleanly");
                true
            }
            _ = tokio::time::sleep(self.drain_timeout) => {
                warn!(
                    remaining_connections = self.active_connections(),
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    "Drain timeout expired, exiting with requests in flight"
                );
                false
            }
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            let notified = self.drain_notify.notified();
            if self.connection_count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting, then drain.
    pub async fn shutdown(&self) -> bool {
        info!("Stopping accept loop");
        self.trigger_stop();
        self.drain().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_then_drain_after_requests_finish() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(5));
        let accept_loop = shutdown.stop_token();

        let handoff_push = shutdown.connection_guard();
        let http_request = handoff_push.clone();
        assert_eq!(shutdown.active_connections(), 1);

        shutdown.trigger_stop();
        assert!(accept_loop.is_cancelled());

        // Clones share one slot.
        drop(handoff_push);
        assert_eq!(shutdown.active_connections(), 1);
        drop(http_request);

        assert!(shutdown.drain().await);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_request() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(5));
        let guard = shutdown.connection_guard();

        let request = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(shutdown.shutdown().await);
        assert!(shutdown.stop_token().is_cancelled());
        request.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_timeout() {
        let shutdown = GracefulShutdown::new(Duration::from_millis(100));

        let _guard = shutdown.connection_guard();
        shutdown.trigger_stop();

        assert!(!shutdown.drain().await);
        assert_eq!(shutdown.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_drain_wakes_on_last_of_many() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(5));
        let guards: Vec<_> = (0..8).map(|_| shutdown.connection_guard()).collect();
        assert_eq!(shutdown.active_connections(), 8);

        let workers: Vec<_> = guards
            .into_iter()
            .enumerate()
            .map(|(i, guard)| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(5 * i as u64)).await;
                    drop(guard);
                })
            })
            .collect();

        assert!(shutdown.drain().await);
        assert_eq!(shutdown.active_connections(), 0);
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[test]
    fn test_drain_timeout_from_lookup() {
        let shutdown = GracefulShutdown::from_lookup(|_| None);
        assert_eq!(shutdown.drain_timeout(), DEFAULT_DRAIN_TIMEOUT);

        let shutdown = GracefulShutdown::from_lookup(|key| {
            (key == DRAIN_TIMEOUT_ENV).then(|| "1500".to_string())
        });
        assert_eq!(shutdown.drain_timeout(), Duration::from_millis(1500));
    }
}
