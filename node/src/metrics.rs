//! # Prometheus Metrics
//!
//! Operational metrics for a miner, registered in a dedicated
//! [`prometheus::Registry`] under the `rfs` namespace and served at
//! `/metrics` by the status API.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use rfs_protocol::network::{FloodReport, MinerNode, NodeStatus};

/// Metric handles for one miner. Handles are reference-counted inside
/// `prometheus`, so cloning is cheap.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Length of the canonical chain, genesis excluded.
    pub chain_height: IntGauge,
    /// Every block in the tree, forks included.
    pub known_blocks: IntGauge,
    /// Leaves of the block tree.
    pub forks: IntGauge,
    /// Client and peer requests served, by kind.
    pub requests_total: IntCounterVec,
    /// Requests answered with an error, by kind.
    pub request_errors_total: IntCounterVec,
    /// Peers a block could not be delivered to.
    pub flood_failures_total: IntCounter,
    /// Seconds from a write request arriving until its block is confirmed.
    pub op_confirmation_seconds: Histogram,
}

impl NodeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("rfs".into()), None)?;

        let chain_height = IntGauge::new("chain_height", "Height of the canonical tip")?;
        registry.register(Box::new(chain_height.clone()))?;

        let known_blocks = IntGauge::new("known_blocks", "Blocks in the tree, forks included")?;
        registry.register(Box::new(known_blocks.clone()))?;

        let forks = IntGauge::new("forks", "Leaf blocks of the tree")?;
        registry.register(Box::new(forks.clone()))?;

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Requests served, by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_errors_total = IntCounterVec::new(
            Opts::new("request_errors_total", "Requests answered with an error, by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(request_errors_total.clone()))?;

        let flood_failures_total = IntCounter::new(
            "flood_failures_total",
            "Block deliveries to peers that failed",
        )?;
        registry.register(Box::new(flood_failures_total.clone()))?;

        let op_confirmation_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "op_confirmation_seconds",
                "Time from a write request to the required confirmations",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;
        registry.register(Box::new(op_confirmation_seconds.clone()))?;

        Ok(Self {
            registry,
            chain_height,
            known_blocks,
            forks,
            requests_total,
            request_errors_total,
            flood_failures_total,
            op_confirmation_seconds,
        })
    }

    /// Refresh the chain gauges from a status sample.
    pub fn observe_status(&self, status: &NodeStatus) {
        self.chain_height.set(status.height as i64);
        self.known_blocks.set(status.known_blocks as i64);
        self.forks.set(status.forks as i64);
    }

    pub fn observe_request(&self, kind: &str, failed: bool) {
        self.requests_total.with_label_values(&[kind]).inc();
        if failed {
            self.request_errors_total.with_label_values(&[kind]).inc();
        }
    }

    pub fn observe_flood(&self, report: &FloodReport) {
        self.flood_failures_total.inc_by(report.failures.len() as u64);
    }

    /// Render every registered metric in the text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// `GET /metrics`.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

/// Keep the chain gauges in step with the canonical tip until the node
/// shuts down.
pub async fn track_chain(node: Arc<MinerNode>, metrics: SharedMetrics) {
    let mut tip = node.miner().subscribe_tip();
    let mut shutdown = node.subscribe_shutdown();
    loop {
        metrics.observe_status(&node.status());
        tokio::select! {
            changed = tip.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }
}
