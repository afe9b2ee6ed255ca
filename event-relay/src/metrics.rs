//! Prometheus collectors of the relay and the `/metrics` endpoint serving them.
use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use lazy_static::lazy_static;
use log::{error, info};
use prometheus::{
    register_int_counter,
    register_int_counter_vec,
    register_int_gauge,
    Encoder,
    IntCounter,
    IntCounterVec,
    IntGauge,
    TextEncoder,
};
use snafu::{ResultExt, Snafu};
use tokio::net::TcpListener;

lazy_static! {
    /// Block scans by final status
    pub static ref SCAN_RESULTS: IntCounterVec = register_int_counter_vec!(
        "event_relay_scan_results_total",
        "Block scans by final status",
        &["status"]
    )
    .unwrap();

    /// Events by how the resolving step left them
    pub static ref EVENT_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "event_relay_events_total",
        "Events resolved, by outcome",
        &["outcome"]
    )
    .unwrap();

    /// Failed cycles by cause
    pub static ref CYCLE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "event_relay_cycle_failures_total",
        "Failed processing cycles, by cause",
        &["kind"]
    )
    .unwrap();

    /// Blocks checkpointed
    pub static ref BLOCKS_ADVANCED: IntCounter = register_int_counter!(
        "event_relay_blocks_advanced_total",
        "Blocks fully drained and checkpointed"
    )
    .unwrap();

    /// Next height to drain
    pub static ref CURRENT_HEIGHT: IntGauge = register_int_gauge!(
        "event_relay_current_height",
        "Next block height to be drained"
    )
    .unwrap();

    /// 0 closed, 1 open, 2 half-open
    pub static ref CIRCUIT_STATE: IntGauge = register_int_gauge!(
        "event_relay_circuit_state",
        "State of the cycle circuit breaker (0 closed, 1 open, 2 half-open)"
    )
    .unwrap();
}

/// Errors serving metrics.
#[derive(Debug, Snafu)]
pub enum MetricsError {
    /// The metrics address could not be bound.
    #[snafu(display("could not bind metrics server to {addr}: {source}"))]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// The underlying io error.
        source: std::io::Error,
    },

    /// The metrics server stopped.
    #[snafu(display("metrics server failed: {source}"))]
    Serve {
        /// The underlying io error.
        source: std::io::Error,
    },
}

/// Serve prometheus metrics
pub async fn serve_metrics(bind_addr: SocketAddr) -> Result<(), MetricsError> {
    let app = Router::new().route("/metrics", get(metrics_handler));

    let listener = TcpListener::bind(bind_addr)
        .await
        .context(BindSnafu { addr: bind_addr })?;
    info!("Prometheus metrics server running on http://{}", bind_addr);

    axum::serve(listener, app).await.context(ServeSnafu)?;
    Ok(())
}

/// Renders every registered collector in the text exposition format.
fn render() -> Result<String, String> {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}

/// `GET /metrics`
async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| {
        error!("Could not encode metrics: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e)
    })
}
