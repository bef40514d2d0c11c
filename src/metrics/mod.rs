//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and head height
//! - Transaction lifecycle transitions
//! - Fee bumps, reorgs, resends and reaping

use crate::error::{TxmError, TxmResult};
use crate::events::TxEvent;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "txm_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_HEAD: GaugeVec = register_gauge_vec!(
        "txm_chain_head",
        "Latest observed head per chain",
        &["chain_id"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_ENQUEUED: CounterVec = register_counter_vec!(
        "txm_transactions_enqueued_total",
        "Total transactions enqueued",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_BROADCAST: CounterVec = register_counter_vec!(
        "txm_transactions_broadcast_total",
        "Total transactions broadcast for the first time",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "txm_transactions_confirmed_total",
        "Total transactions confirmed",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FINALIZED: CounterVec = register_counter_vec!(
        "txm_transactions_finalized_total",
        "Total transactions finalized",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FATAL: CounterVec = register_counter_vec!(
        "txm_transactions_fatal_total",
        "Total transactions marked fatal",
        &["chain_id", "reason"]
    ).unwrap();

    pub static ref FEE_BUMPS: CounterVec = register_counter_vec!(
        "txm_fee_bumps_total",
        "Total replacement attempts at a higher fee",
        &["chain_id"]
    ).unwrap();

    pub static ref REORGS: CounterVec = register_counter_vec!(
        "txm_reorgs_total",
        "Total confirmed transactions reverted by a reorg",
        &["chain_id"]
    ).unwrap();

    pub static ref RESENDS: CounterVec = register_counter_vec!(
        "txm_resends_total",
        "Total attempts resubmitted by the resender",
        &["chain_id"]
    ).unwrap();

    pub static ref REAPED: CounterVec = register_counter_vec!(
        "txm_reaped_total",
        "Total terminal transactions deleted",
        &["chain_id"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "txm_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "txm_health_check_failure_total",
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

    pub async fn run(&self) -> TxmResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| TxmError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TxmError::Internal(format!("Metrics server failed: {}", e)))?;

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

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_head(chain_id: u64, block_number: u64) {
    CHAIN_HEAD
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_enqueued(chain_id: u64) {
    TX_ENQUEUED.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_resend(chain_id: u64, count: usize) {
    RESENDS
        .with_label_values(&[&chain_id.to_string()])
        .inc_by(count as f64);
}

/// Count a lifecycle event
pub fn record_event(event: &TxEvent) {
    let chain_id = event.chain_id().to_string();
    match event {
        TxEvent::Broadcast { .. } => TX_BROADCAST.with_label_values(&[&chain_id]).inc(),
        TxEvent::Confirmed { .. } => TX_CONFIRMED.with_label_values(&[&chain_id]).inc(),
        TxEvent::Finalized { .. } => TX_FINALIZED.with_label_values(&[&chain_id]).inc(),
        TxEvent::Fatal { reason, .. } => TX_FATAL
            .with_label_values(&[&chain_id, fatal_label(reason)])
            .inc(),
        TxEvent::FeeBumped { .. } => FEE_BUMPS.with_label_values(&[&chain_id]).inc(),
        TxEvent::ReorgDetected { .. } => REORGS.with_label_values(&[&chain_id]).inc(),
        TxEvent::Reaped { count, .. } => REAPED
            .with_label_values(&[&chain_id])
            .inc_by(*count as f64),
    }
}

/// Bounded label set for fatal reasons
fn fatal_label(reason: &str) -> &'static str {
    if reason.contains("fee ceiling reached") {
        "fee_ceiling"
    } else if reason.contains("bump depth reached") {
        "bump_depth"
    } else if reason.contains("signing") {
        "signing"
    } else {
        "rejected"
    }
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
