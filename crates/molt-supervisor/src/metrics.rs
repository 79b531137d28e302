//! Prometheus metrics for handoffs.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `molt_handoff_duration_seconds` | Histogram | `outcome` |
//! | `molt_relays_total` | Counter | `outcome` |
//! | `molt_forced_terminations_total` | Counter | `phase` |
//! | `molt_active_generation` | Gauge | |
//!
//! `outcome` is one of `succeeded`, `failed` or `cancelled`; `phase` is
//! `retire` (after a handoff) or `shutdown`.
//!
//! Served as text at `GET /metrics` on `observability.metrics_addr`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::generation::GenerationId;
use crate::supervisor::HandoffOutcome;

/// Handoffs range from milliseconds (tiny state) to the ready timeout.
pub const HANDOFF_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),

    #[error("failed to bind metrics endpoint {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Handoff metric families, registered in their own registry.
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    handoff_duration: HistogramVec,
    relays_total: IntCounterVec,
    forced_terminations_total: IntCounterVec,
    active_generation: IntGauge,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let handoff_duration = HistogramVec::new(
            HistogramOpts::new(
                "molt_handoff_duration_seconds",
                "Time from handoff start to promotion or rollback",
            )
            .buckets(HANDOFF_BUCKETS.to_vec()),
            &["outcome"],
        )?;
        registry.register(Box::new(handoff_duration.clone()))?;

        let relays_total = IntCounterVec::new(
            Opts::new("molt_relays_total", "Handoffs attempted, by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(relays_total.clone()))?;

        let forced_terminations_total = IntCounterVec::new(
            Opts::new(
                "molt_forced_terminations_total",
                "Generations killed after outliving the exit grace period",
            ),
            &["phase"],
        )?;
        registry.register(Box::new(forced_terminations_total.clone()))?;

        let active_generation = IntGauge::new(
            "molt_active_generation",
            "Id of the generation currently serving, 0 when none",
        )?;
        registry.register(Box::new(active_generation.clone()))?;

        Ok(Self {
            registry,
            handoff_duration,
            relays_total,
            forced_terminations_total,
            active_generation,
        })
    }

    pub fn handoff_finished(&self, outcome: HandoffOutcome, elapsed: Duration) {
        let label = [outcome.as_str()];
        self.handoff_duration
            .with_label_values(&label)
            .observe(elapsed.as_secs_f64());
        self.relays_total.with_label_values(&label).inc();
    }

    pub fn forced_termination(&self, phase: &str) {
        self.forced_terminations_total.with_label_values(&[phase]).inc();
    }

    pub fn set_active(&self, generation: Option<GenerationId>) {
        let id = generation.map_or(0, |id| id.get());
        self.active_generation.set(i64::try_from(id).unwrap_or(i64::MAX));
    }

    pub fn relay_count(&self, outcome: HandoffOutcome) -> u64 {
        self.relays_total.with_label_values(&[outcome.as_str()]).get()
    }

    pub fn forced_count(&self, phase: &str) -> u64 {
        self.forced_terminations_total.with_label_values(&[phase]).get()
    }

    pub fn handoff_samples(&self, outcome: HandoffOutcome) -> u64 {
        self.handoff_duration
            .with_label_values(&[outcome.as_str()])
            .get_sample_count()
    }

    /// Prometheus text exposition of every family.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

/// The bound scrape endpoint.
pub struct MetricsServer {
    listener: TcpListener,
    metrics: Arc<RelayMetrics>,
}

impl MetricsServer {
    pub async fn bind(addr: SocketAddr, metrics: Arc<RelayMetrics>) -> Result<Self, MetricsError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| MetricsError::Bind { addr, source })?;
        Ok(Self { listener, metrics })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve `GET /metrics` until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) {
        let app = Router::new()
            .route("/metrics", get(scrape))
            .with_state(self.metrics);

        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "Metrics endpoint listening");
        }
        let served = axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(err) = served {
            error!(error = %err, "Metrics endpoint failed");
        }
    }
}

async fn scrape(State(metrics): State<Arc<RelayMetrics>>) -> Response {
    match metrics.encode_text() {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response(),
        Err(err) => {
            error!(error = %err, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handoffs_are_counted_by_outcome() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.handoff_finished(HandoffOutcome::Succeeded, Duration::from_millis(120));
        metrics.handoff_finished(HandoffOutcome::Succeeded, Duration::from_millis(80));
        metrics.handoff_finished(HandoffOutcome::Failed, Duration::from_secs(3));

        assert_eq!(metrics.relay_count(HandoffOutcome::Succeeded), 2);
        assert_eq!(metrics.relay_count(HandoffOutcome::Failed), 1);
        assert_eq!(metrics.relay_count(HandoffOutcome::Cancelled), 0);
        assert_eq!(metrics.handoff_samples(HandoffOutcome::Succeeded), 2);
    }

    #[test]
    fn test_text_exposition() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.handoff_finished(HandoffOutcome::Cancelled, Duration::from_millis(10));
        metrics.forced_termination("retire");
        metrics.set_active(Some(GenerationId::new(7)));

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("molt_handoff_duration_seconds_bucket{outcome=\"cancelled\",le=\"0.05\"} 1"));
        assert!(text.contains("molt_relays_total{outcome=\"cancelled\"} 1"));
        assert!(text.contains("molt_forced_terminations_total{phase=\"retire\"} 1"));
        assert!(text.contains("molt_active_generation 7"));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = RelayMetrics::new().unwrap();
        let second = RelayMetrics::new().unwrap();
        first.forced_termination("shutdown");

        assert_eq!(first.forced_count("shutdown"), 1);
        assert_eq!(second.forced_count("shutdown"), 0);
    }

    #[tokio::test]
    async fn test_scrape_endpoint() {
        let metrics = Arc::new(RelayMetrics::new().unwrap());
        metrics.set_active(Some(GenerationId::FIRST));

        let server = MetricsServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&metrics))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(shutdown.clone()));

        let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/plain")));
        let body = response.text().await.unwrap();
        assert!(body.contains("molt_active_generation 1"));

        shutdown.cancel();
        task.await.unwrap();
    }
}
