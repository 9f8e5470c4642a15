//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain health and block height
//! - Transaction lifecycle transitions
//! - Simulation failures

use crate::error::{TxError, TxResult};
use crate::state::{ChainSelector, TxType};

use axum::{http::StatusCode, routing::get, Router};
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
        "wallet_tx_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "wallet_tx_chain_block_height",
        "Latest block height seen per chain",
        &["chain"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_ADDED: CounterVec = register_counter_vec!(
        "wallet_tx_transactions_added_total",
        "Total transaction requests recorded",
        &["chain", "tx_type"]
    ).unwrap();

    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "wallet_tx_transactions_submitted_total",
        "Total transactions published",
        &["chain"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "wallet_tx_transactions_confirmed_total",
        "Total transactions confirmed",
        &["chain"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "wallet_tx_transactions_failed_total",
        "Total transactions failed",
        &["chain"]
    ).unwrap();

    pub static ref TX_DROPPED: CounterVec = register_counter_vec!(
        "wallet_tx_transactions_dropped_total",
        "Total transactions dropped",
        &["chain"]
    ).unwrap();

    pub static ref TX_RESUBMITTED: CounterVec = register_counter_vec!(
        "wallet_tx_transactions_resubmitted_total",
        "Total rebroadcasts of pending transactions",
        &["chain"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "wallet_tx_confirmation_latency_seconds",
        "Time from submission to confirmation",
        &["chain"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0, 3600.0]
    ).unwrap();

    pub static ref SIMULATION_FAILURES: CounterVec = register_counter_vec!(
        "wallet_tx_simulation_failures_total",
        "Total failed dry runs",
        &["chain"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "wallet_tx_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "wallet_tx_health_check_failure_total",
        "Total failed health checks",
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

    pub async fn run(&self) -> TxResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| TxError::Config(format!("cannot bind metrics port {}: {}", self.port, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TxError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain: &ChainSelector, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain.as_str()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_block_height(chain: &ChainSelector, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[chain.as_str()])
        .set(block_number as f64);
}

pub fn record_tx_added(chain: &ChainSelector, tx_type: TxType) {
    TX_ADDED
        .with_label_values(&[chain.as_str(), tx_type.as_str()])
        .inc();
}

pub fn record_tx_submitted(chain: &ChainSelector) {
    TX_SUBMITTED.with_label_values(&[chain.as_str()]).inc();
}

/// Count a confirmation, observing latency when the submission time is known
pub fn record_tx_confirmed(chain: &ChainSelector, latency_secs: Option<f64>) {
    TX_CONFIRMED.with_label_values(&[chain.as_str()]).inc();
    if let Some(latency) = latency_secs {
        TX_LATENCY
            .with_label_values(&[chain.as_str()])
            .observe(latency);
    }
}

pub fn record_tx_failed(chain: &ChainSelector) {
    TX_FAILED.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_tx_dropped(chain: &ChainSelector) {
    TX_DROPPED.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_tx_resubmitted(chain: &ChainSelector) {
    TX_RESUBMITTED.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_simulation_failure(chain: &ChainSelector) {
    SIMULATION_FAILURES
        .with_label_values(&[chain.as_str()])
        .inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_are_exported() {
        let chain = ChainSelector::from("metrics:test");
        record_tx_added(&chain, TxType::Transfer);
        record_tx_confirmed(&chain, Some(2.0));
        record_block_height(&chain, 42);

        let body = metrics_handler().await.unwrap();
        assert!(body.contains("wallet_tx_transactions_added_total"));
        assert!(body.contains("wallet_tx_confirmation_latency_seconds"));
        assert!(body.contains("metrics:test"));
    }
}
