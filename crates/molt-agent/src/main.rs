//! Reference agent: an HTTP service whose conversation memory survives
//! hot relays.
//!
//! `GET /` reports the memory, `POST /` appends the request body to it.
//! Run cold it binds `MOLT_AGENT_ADDR` (default `0.0.0.0:8080`); under the
//! supervisor it adopts the inherited listener and the predecessor's memory.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use molt_ecdysis::{AgentRuntime, GracefulShutdown, LifecycleEvent, StatePusher};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod memory;

use memory::{MemoryContext, Restored};

const ADDR_ENV: &str = "MOLT_AGENT_ADDR";
const DEFAULT_ADDR: &str = "0.0.0.0:8080";

struct AppState {
    memory: RwLock<MemoryContext>,
    generation: Option<u64>,
    shutdown: GracefulShutdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry().map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    let mut runtime = AgentRuntime::from_env().context("Failed to read startup environment")?;
    info!(
        generation = ?runtime.generation(),
        relay = runtime.is_relay(),
        pid = std::process::id(),
        "Molt agent starting"
    );

    let cold_addr: SocketAddr = std::env::var(ADDR_ENV)
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()
        .with_context(|| format!("Invalid {ADDR_ENV}"))?;
    let listener = runtime
        .listener(cold_addr)
        .await
        .context("Failed to obtain listener")?;
    let origin = listener.origin();
    let listener = listener.into_tokio()?;

    let prior = match runtime.prior_state().await {
        Ok(prior) => prior,
        Err(err) => {
            error!(error = %err, "Could not receive prior state, starting with empty memory");
            molt_ecdysis::PriorState::Absent
        }
    };
    let (memory, restored) = MemoryContext::restore(prior);
    match &restored {
        Restored::Resumed { from_version } => info!(
            session_id = %memory.session_id,
            messages = memory.len(),
            from = %from_version,
            "Memory restored, resuming conversation"
        ),
        Restored::Discarded { reason } => warn!(%reason, "Serving with empty memory"),
        Restored::Fresh | Restored::Empty => {}
    }

    let shutdown = GracefulShutdown::from_env();
    let state = Arc::new(AppState {
        memory: RwLock::new(memory),
        generation: runtime.generation(),
        shutdown: shutdown.clone(),
    });

    let app = Router::new()
        .route("/", get(recall).post(remember))
        .with_state(Arc::clone(&state));

    info!(addr = %listener.local_addr()?, ?origin, "Serving");
    let stop_token = shutdown.stop_token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                stop_token.cancelled().await;
                info!("HTTP server received shutdown signal, draining connections");
            })
            .await
    });

    runtime.notify_ready().await?;

    let mut lifecycle = runtime.lifecycle()?;
    let pusher = runtime.pusher();
    let mut handoff: Option<CancellationToken> = None;

    loop {
        match lifecycle.next().await {
            LifecycleEvent::Handoff { relay_path } => {
                if let Some(previous) = handoff.take() {
                    previous.cancel();
                }
                let snapshot = state.memory.read().await.to_snapshot();
                match snapshot {
                    Ok(snapshot) => {
                        let cancel = CancellationToken::new();
                        handoff = Some(cancel.clone());
                        tokio::spawn(push_state(pusher.clone(), relay_path, snapshot, cancel));
                    }
                    Err(err) => {
                        error!(error = %err, "Could not snapshot memory, refusing handoff");
                        pusher.abandon(format!("memory snapshot failed: {err}")).await;
                    }
                }
            }
            LifecycleEvent::AbortHandoff => {
                if let Some(cancel) = handoff.take() {
                    info!("Handoff aborted, resuming as active generation");
                    cancel.cancel();
                }
            }
            LifecycleEvent::Drain => {
                info!("Supervisor requested drain");
                break;
            }
            LifecycleEvent::Signal(signal) => {
                info!(?signal, "Received shutdown signal");
                break;
            }
        }
    }

    if !shutdown.shutdown().await {
        warn!("Exiting with requests in flight");
    }
    match tokio::time::timeout(shutdown.drain_timeout(), server).await {
        Ok(Ok(Ok(()))) => info!("HTTP server stopped"),
        Ok(Ok(Err(err))) => error!(error = %err, "HTTP server failed"),
        Ok(Err(err)) => error!(error = %err, "HTTP server task failed"),
        Err(_) => warn!("HTTP server did not stop in time"),
    }

    info!("Molt agent stopped");
    Ok(())
}

async fn push_state(
    pusher: StatePusher,
    relay_path: std::path::PathBuf,
    snapshot: molt_ecdysis::StateSnapshot,
    cancel: CancellationToken,
) {
    match pusher.push(&relay_path, snapshot, &cancel).await {
        Ok(bytes) => info!(bytes, "Memory handed to successor"),
        Err(err) => warn!(error = %err, "Memory handoff did not complete"),
    }
}

async fn recall(State(state): State<Arc<AppState>>) -> Json<Value> {
    let _guard = state.shutdown.connection_guard();
    let memory = state.memory.read().await;
    Json(json!({
        "status": "alive",
        "memory_size": memory.len(),
        "history": memory.conversation,
        "session_id": memory.session_id,
        "model_version": memory.model_version,
        "generation": state.generation,
        "pid": std::process::id(),
    }))
}

async fn remember(State(state): State<Arc<AppState>>, body: String) -> &'static str {
    let _guard = state.shutdown.connection_guard();
    state.memory.write().await.append(body);
    "Message added to memory."
}

fn init_telemetry() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("MOLT_LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).try_init()?;
    } else {
        registry.with(fmt::layer()).try_init()?;
    }
    Ok(())
}
