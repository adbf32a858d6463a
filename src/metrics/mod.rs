//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status
//! - Event ingestion and dedup
//! - Transfer dispatch outcomes and retries

use crate::chain::ChainId;
use crate::error::RelayResult;
use crate::events::EventKind;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "crosschain_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "crosschain_events_received_total",
        "Total events received by kind",
        &["chain", "event_kind"]
    ).unwrap();

    pub static ref EVENTS_DEDUPLICATED: CounterVec = register_counter_vec!(
        "crosschain_events_deduplicated_total",
        "Duplicate events dropped by the watchers",
        &["chain", "event_kind"]
    ).unwrap();

    pub static ref SUBSCRIPTION_ERRORS: CounterVec = register_counter_vec!(
        "crosschain_subscription_errors_total",
        "Subscription failures triggering backoff resubscription",
        &["chain"]
    ).unwrap();

    // Transfer metrics
    pub static ref TRANSFERS_OBSERVED: CounterVec = register_counter_vec!(
        "crosschain_transfers_observed_total",
        "Transfers observed from send events",
        &["source_chain"]
    ).unwrap();

    pub static ref TRANSFERS_SETTLED: CounterVec = register_counter_vec!(
        "crosschain_transfers_settled_total",
        "Transfers settled on the counterpart chain",
        &["destination_chain"]
    ).unwrap();

    pub static ref TRANSFERS_FAILED: CounterVec = register_counter_vec!(
        "crosschain_transfers_failed_total",
        "Transfers that exhausted retries or were rejected",
        &["destination_chain"]
    ).unwrap();

    pub static ref SUBMISSION_RETRIES: CounterVec = register_counter_vec!(
        "crosschain_submission_retries_total",
        "Transient settlement submission failures",
        &["destination_chain"]
    ).unwrap();

    pub static ref DISPATCH_LATENCY: HistogramVec = register_histogram_vec!(
        "crosschain_dispatch_latency_seconds",
        "Observation-to-settlement latency",
        &["destination_chain"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "crosschain_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::error::RelayError::Internal(e.to_string()))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::RelayError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// Helper functions to record metrics

pub fn record_chain_health(chain: ChainId, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain.as_str()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_event(chain: ChainId, kind: EventKind) {
    EVENTS_RECEIVED
        .with_label_values(&[chain.as_str(), kind.name()])
        .inc();
}

pub fn record_duplicate_event(chain: ChainId, kind: EventKind) {
    EVENTS_DEDUPLICATED
        .with_label_values(&[chain.as_str(), kind.name()])
        .inc();
}

pub fn record_subscription_error(chain: ChainId) {
    SUBSCRIPTION_ERRORS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_transfer_observed(source_chain: ChainId) {
    TRANSFERS_OBSERVED
        .with_label_values(&[source_chain.as_str()])
        .inc();
}

pub fn record_transfer_settled(destination_chain: ChainId) {
    TRANSFERS_SETTLED
        .with_label_values(&[destination_chain.as_str()])
        .inc();
}

pub fn record_transfer_failed(destination_chain: ChainId) {
    TRANSFERS_FAILED
        .with_label_values(&[destination_chain.as_str()])
        .inc();
}

pub fn record_submission_retry(destination_chain: ChainId) {
    SUBMISSION_RETRIES
        .with_label_values(&[destination_chain.as_str()])
        .inc();
}

pub fn record_dispatch_latency(destination_chain: ChainId, latency_secs: f64) {
    DISPATCH_LATENCY
        .with_label_values(&[destination_chain.as_str()])
        .observe(latency_secs);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}
