//! # Status API
//!
//! Read-only HTTP view of a running miner, served on `http_addr`. Client
//! operations do not go through here; they use the framed TCP client port.
//!
//! ## Endpoints
//!
//! | Method | Path             | Description                              |
//! |--------|------------------|------------------------------------------|
//! | GET    | `/health`        | Liveness probe                           |
//! | GET    | `/status`        | Height, tip, mining state, balance       |
//! | GET    | `/chain`         | Most recent canonical blocks and forks   |
//! | GET    | `/blocks/:hash`  | One block by hex hash                    |
//! | GET    | `/metrics`       | Prometheus text format                   |

use axum::{
    extract::{FromRef, Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use rfs_protocol::crypto::parse_hash;
use rfs_protocol::network::{MinerNode, NodeStatus};
use rfs_protocol::storage::{Block, OpType};

use crate::metrics::{metrics_handler, SharedMetrics};

/// Blocks returned by `/chain` when no `limit` is given.
const DEFAULT_CHAIN_LIMIT: usize = 50;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub node: Arc<MinerNode>,
    pub metrics: SharedMetrics,
}

impl FromRef<AppState> for SharedMetrics {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/chain", get(chain_handler))
        .route("/blocks/:hash", get(block_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    #[serde(flatten)]
    pub node: StatusBody,
    /// RFC 3339 time of the sample.
    pub timestamp: String,
}

/// Mirror of [`NodeStatus`] that can be read back in tests.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusBody {
    pub miner_id: String,
    pub height: u64,
    pub tip: String,
    pub known_blocks: usize,
    pub forks: usize,
    pub mining_state: String,
    pub balance: u64,
    pub files: usize,
}

impl From<NodeStatus> for StatusBody {
    fn from(s: NodeStatus) -> Self {
        Self {
            miner_id: s.miner_id,
            height: s.height,
            tip: s.tip,
            known_blocks: s.known_blocks,
            forks: s.forks,
            mining_state: s.mining_state.to_string(),
            balance: s.balance,
            files: s.files,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpView {
    pub uuid: String,
    pub op_type: OpType,
    pub filename: String,
    pub miner_id: String,
    /// Payload size; record contents are read through the client port.
    pub payload_bytes: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockView {
    pub hash: String,
    pub prev_hash: String,
    pub depth: Option<u64>,
    pub miner_id: String,
    pub nonce: u32,
    pub extra_nonce: u32,
    pub is_op: bool,
    pub canonical: bool,
    /// Canonical descendants; absent for side-branch blocks.
    pub confirmations: Option<u64>,
    pub ops: Vec<OpView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ForkView {
    pub tip: String,
    pub length: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChainResponse {
    pub height: u64,
    /// Newest first.
    pub blocks: Vec<BlockView>,
    pub forks: Vec<ForkView>,
}

#[derive(Debug, Deserialize)]
pub struct ChainQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn block_view(node: &MinerNode, block: &Block) -> BlockView {
    let tree = node.tree();
    BlockView {
        hash: block.hash_hex(),
        prev_hash: block.prev_hash_hex(),
        depth: tree.depth(&block.hash),
        miner_id: block.miner_id.clone(),
        nonce: block.nonce,
        extra_nonce: block.extra_nonce,
        is_op: block.is_op,
        canonical: tree.is_canonical(&block.hash),
        confirmations: tree.confirmations(&block.hash),
        ops: block
            .ops
            .iter()
            .map(|op| OpView {
                uuid: op.uuid.to_string(),
                op_type: op.op_type,
                filename: op.filename.clone(),
                miner_id: op.miner_id.clone(),
                payload_bytes: op.payload.len(),
            })
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status`. Also refreshes the chain gauges, so a scrape after a
/// status call sees current values.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.node.status();
    state.metrics.observe_status(&status);
    Json(StatusResponse {
        version: state.version.clone(),
        node: status.into(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// `GET /chain?limit=N`
async fn chain_handler(
    Query(query): Query<ChainQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_CHAIN_LIMIT);
    let chain = state.node.tree().canonical_chain();
    let blocks = chain
        .iter()
        .rev()
        .take(limit)
        .map(|b| block_view(&state.node, b))
        .collect();
    let forks = state
        .node
        .forks()
        .into_iter()
        .map(|f| ForkView {
            tip: hex::encode(f.hash),
            length: f.length,
        })
        .collect();
    Json(ChainResponse {
        height: state.node.tree().height(),
        blocks,
        forks,
    })
}

/// `GET /blocks/:hash`
async fn block_handler(Path(hash): Path<String>, State(state): State<AppState>) -> Response {
    let hash = match parse_hash(&hash) {
        Ok(h) => h,
        Err(e) => return error(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match state.node.tree().get_block_by_hash(&hash) {
        Some(block) => Json(block_view(&state.node, &block)).into_response(),
        None => error(
            StatusCode::NOT_FOUND,
            format!("no block {}", hex::encode(hash)),
        ),
    }
}
