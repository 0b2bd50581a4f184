//! Probe and metrics HTTP server.
//!
//! `/healthz` answers while the process is alive, `/readyz` once the cold
//! start has finished, and `/metrics` renders the telemetry counters.

use crate::telemetry::Telemetry;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// State shared by the probe handlers
pub struct ProbeState {
    ready: Arc<AtomicBool>,
    telemetry: Arc<Telemetry>,
    registry: Registry,
    resources: IntGaugeVec,
    publishes: IntCounter,
    publish_failures: IntCounter,
}

impl std::fmt::Debug for ProbeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeState")
            .field("ready", &self.ready.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ProbeState {
    /// Registers the metrics in a fresh registry
    pub fn new(ready: Arc<AtomicBool>, telemetry: Arc<Telemetry>) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let resources = IntGaugeVec::new(
            Opts::new("lbops_resources", "Watched intent resources by kind and namespace"),
            &["kind", "namespace"],
        )?;
        let publishes = IntCounter::new("lbops_publishes_total", "Configurations handed to the publisher")?;
        let publish_failures = IntCounter::new("lbops_publish_failures_total", "Configurations the publisher rejected")?;
        registry.register(Box::new(resources.clone()))?;
        registry.register(Box::new(publishes.clone()))?;
        registry.register(Box::new(publish_failures.clone()))?;
        Ok(Self {
            ready,
            telemetry,
            registry,
            resources,
            publishes,
            publish_failures,
        })
    }

    /// Refresh the metrics from the telemetry counters and encode them
    pub fn render_metrics(&self) -> Result<String, prometheus::Error> {
        let snapshot = self.telemetry.snapshot();
        self.resources.reset();
        for ((kind, namespace), count) in &snapshot.resources {
            self.resources
                .with_label_values(&[kind.as_str(), namespace.as_str()])
                .set(*count);
        }
        // Counters only move forward, so catch up by the difference
        self.publishes
            .inc_by(snapshot.publishes.saturating_sub(self.publishes.get()));
        self.publish_failures
            .inc_by(snapshot.publish_failures.saturating_sub(self.publish_failures.get()));

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Serve probes until the listener fails
pub async fn run_probe_server(state: Arc<ProbeState>, addr: SocketAddr) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Probe server listening");
    axum::serve(listener, app).await
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<ProbeState>>) -> StatusCode {
    if state.ready.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        debug!("Readiness probe: cold start not finished");
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<Arc<ProbeState>>) -> (StatusCode, String) {
    match state.render_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            warn!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}
