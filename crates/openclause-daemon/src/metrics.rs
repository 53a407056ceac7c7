//! Prometheus metrics for the services.
//!
//! Metrics are served from a separate internal-only listener, never from
//! the public surface.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Connector latency buckets in seconds.
const CONNECTOR_LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Errors during metrics setup or encoding.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Registration or encoding failed.
    #[error("metrics error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// The service metric families.
pub struct Metrics {
    registry: Registry,
    /// Tool-call decisions by outcome.
    pub toolcall_decisions: IntCounterVec,
    /// HTTP requests by endpoint and status.
    pub http_requests: IntCounterVec,
    /// Notification deliveries by kind and outcome.
    pub notifications: IntCounterVec,
    /// Connector call latency by tool and status.
    pub connector_latency: HistogramVec,
}

impl Metrics {
    /// Creates and registers the metric families.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails (duplicate registration).
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let toolcall_decisions = IntCounterVec::new(
            Opts::new("oc_toolcall_decisions_total", "Tool-call decisions by outcome"),
            &["decision"],
        )?;
        registry.register(Box::new(toolcall_decisions.clone()))?;

        let http_requests = IntCounterVec::new(
            Opts::new("oc_http_requests_total", "HTTP requests by endpoint and status"),
            &["endpoint", "status"],
        )?;
        registry.register(Box::new(http_requests.clone()))?;

        let notifications = IntCounterVec::new(
            Opts::new(
                "oc_notification_deliveries_total",
                "Notification delivery outcomes by kind",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(notifications.clone()))?;

        let connector_latency = HistogramVec::new(
            HistogramOpts::new("oc_connector_latency_seconds", "Connector call latency")
                .buckets(CONNECTOR_LATENCY_BUCKETS.to_vec()),
            &["tool", "status"],
        )?;
        registry.register(Box::new(connector_latency.clone()))?;

        Ok(Self { registry, toolcall_decisions, http_requests, notifications, connector_latency })
    }

    /// Renders the registry in Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.encode_text().unwrap_or_else(|e| {
        tracing::error!(error = %e, "metrics encoding failed");
        String::new()
    })
}

/// Serves `GET /metrics` on the internal listener until the process
/// exits.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn serve(addr: &str, metrics: Arc<Metrics>) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler)).with_state(metrics);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr, "metrics server starting");
    axum::serve(listener, app).await?;
    Ok(())
}
