//! # Miner Node
//!
//! `MinerNode` ties the pieces together for one miner process: the block
//! tree, the derived ledger, the staging and mining actors, and the request
//! handlers the transport calls into. It knows nothing about sockets; the
//! node binary (or a test) moves envelopes in and responses out.
//!
//! ```text
//!   client ──▶ handle_client ──▶ StagingHandle ──▶ MiningCoordinator ──▶ BlockTree
//!                    │                                   │
//!                    └── waits for N confirmations ◀─────┘ tip watch
//!
//!   peer ────▶ handle_peer ───▶ MinerHandle::submit_block
//! ```
//!
//! A write request returns only after the block carrying the op is buried
//! under `confirmations_per_create` / `confirmations_per_append` canonical
//! descendants. If a competing branch buries it off-chain instead, the
//! client gets [`NodeError::OpOrphaned`].

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, MinerConfig};
use crate::crypto::hash::short_hex;
use crate::network::flood::{FloodReport, Flooder};
use crate::network::miner::{FloodRequest, MinerHandle, MiningCoordinator, MiningError};
use crate::network::pow::NoncePool;
use crate::network::rpc::{Envelope, Request, Response};
use crate::network::staging::{StagingCoordinator, StagingError, StagingHandle};
use crate::storage::block::{Block, OpRecord};
use crate::storage::filesystem::FsError;
use crate::storage::snapshot::{self, SnapshotError};
use crate::storage::state::{effect_on_chain, Economics, Ledger, OpEffect};
use crate::storage::tree::{AppendOutcome, BlockTree, ChainError, ChainParams, ForkTip};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Mining(#[from] MiningError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("block {block} was orphaned by a longer branch")]
    OpOrphaned { block: String },

    #[error("{0}")]
    Unsupported(&'static str),
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Point-in-time summary for the status API and logs.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub miner_id: String,
    pub height: u64,
    pub tip: String,
    pub known_blocks: usize,
    pub forks: usize,
    pub mining_state: &'static str,
    pub balance: u64,
    pub files: usize,
}

// ---------------------------------------------------------------------------
// MinerNode
// ---------------------------------------------------------------------------

pub struct MinerNode {
    config: MinerConfig,
    tree: Arc<BlockTree>,
    ledger: Arc<Ledger>,
    staging: StagingHandle,
    miner: MinerHandle,
    shutdown_tx: watch::Sender<bool>,
    /// Orders snapshot writes, so a later snapshot never lands before an
    /// earlier one.
    snapshot_lock: Mutex<()>,
}

/// A started node and the tasks driving it.
pub struct NodeRuntime {
    pub node: Arc<MinerNode>,
    floods: Option<mpsc::UnboundedReceiver<FloodRequest>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeRuntime {
    /// Start pushing accepted blocks to peers through `flooder`. Only the
    /// first call has an effect.
    pub fn spawn_flooder<F>(&mut self, flooder: Flooder, on_report: F)
    where
        F: FnMut(&FloodReport) + Send + 'static,
    {
        if let Some(floods) = self.floods.take() {
            self.tasks
                .push(tokio::spawn(run_flooder(floods, flooder, on_report)));
        }
    }

    /// Wait for every node task to finish. They stop once
    /// [`MinerNode::shutdown`] is called.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "node task ended abnormally");
            }
        }
    }
}

impl MinerNode {
    /// Validate `config`, build state from `restored` (or a fresh tree) and
    /// spawn the actors. Must be called inside a tokio runtime.
    pub fn start(config: MinerConfig, restored: Option<BlockTree>) -> Result<NodeRuntime, NodeError> {
        config.validate()?;

        let genesis = Block::genesis();
        if genesis.hash_hex() != config.common.genesis_block_hash.to_lowercase() {
            return Err(ChainError::GenesisMismatch {
                expected: config.common.genesis_block_hash.clone(),
                actual: genesis.hash_hex(),
            }
            .into());
        }

        let tree = Arc::new(
            restored.unwrap_or_else(|| BlockTree::new(ChainParams::from_config(&config))),
        );
        let ledger = Arc::new(Ledger::new(Economics::from_config(&config.common), &tree));

        let pool = Arc::new(NoncePool::new(config.mining.workers).map_err(MiningError::from)?);
        let (coordinator, miner, floods) = MiningCoordinator::new(
            &config.miner_id,
            tree.clone(),
            ledger.clone(),
            &config.mining,
            pool,
        );
        let (stager, staging) = StagingCoordinator::new(
            ledger.clone(),
            config.common.gen_op_block_timeout(),
            Arc::new(miner.clone()),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(coordinator.run(shutdown_rx.clone())),
            tokio::spawn(stager.run(shutdown_rx)),
        ];

        info!(
            miner_id = %config.miner_id,
            height = tree.height(),
            blocks = tree.len(),
            peers = config.peer_addresses.len(),
            "miner node started"
        );

        let node = Arc::new(Self {
            config,
            tree,
            ledger,
            staging,
            miner,
            shutdown_tx,
            snapshot_lock: Mutex::new(()),
        });
        Ok(NodeRuntime {
            node,
            floods: Some(floods),
            tasks,
        })
    }

    pub fn config(&self) -> &MinerConfig {
        &self.config
    }

    pub fn tree(&self) -> &Arc<BlockTree> {
        &self.tree
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn miner(&self) -> &MinerHandle {
        &self.miner
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.config.snapshot_path()
    }

    pub fn status(&self) -> NodeStatus {
        let tip = self.tree.tip_hash();
        NodeStatus {
            miner_id: self.config.miner_id.clone(),
            height: self.tree.height(),
            tip: hex::encode(tip),
            known_blocks: self.tree.len(),
            forks: self.tree.forks().len(),
            mining_state: self.miner.state().name(),
            balance: self.ledger.balance(&self.config.miner_id),
            files: self.ledger.read(|s| s.fs.file_count()),
        }
    }

    pub fn forks(&self) -> Vec<ForkTip> {
        self.tree.forks()
    }

    /// Snapshot the whole tree to the configured path.
    pub fn store_snapshot(&self) -> Result<usize, SnapshotError> {
        let _guard = self.snapshot_lock.lock();
        snapshot::store(&self.tree, &self.snapshot_path())
    }

    /// Ask every actor to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Request handling
    // -----------------------------------------------------------------------

    /// Serve one request from the client port.
    pub async fn handle_client(&self, envelope: Envelope) -> Response {
        let kind = envelope.request.kind();
        let result = match envelope.request {
            Request::Block { .. } => Err(NodeError::Unsupported(
                "blocks are accepted on the miners port only",
            )),
            request => self.dispatch_client(request).await,
        };
        into_response(kind, result)
    }

    /// Serve one request from the miners port. Peers only exchange blocks.
    pub async fn handle_peer(&self, envelope: Envelope) -> Response {
        let kind = envelope.request.kind();
        let result = match envelope.request {
            Request::Block { block } => self.accept_block(block, envelope.origin).await,
            _ => Err(NodeError::Unsupported("peers may only send blocks")),
        };
        into_response(kind, result)
    }

    async fn dispatch_client(&self, request: Request) -> Result<Response, NodeError> {
        match request {
            Request::CreateFile { filename } => {
                let op = OpRecord::create_file(&self.config.miner_id, &filename);
                let (block, _) = self
                    .submit_op(op, self.config.common.confirmations_per_create)
                    .await?;
                Ok(Response::FileCreated {
                    block_hash: block.hash_hex(),
                })
            }
            Request::AppendRecord { filename, record } => {
                let op = OpRecord::append_record(&self.config.miner_id, &filename, record);
                let (block, effect) = self
                    .submit_op(op, self.config.common.confirmations_per_append)
                    .await?;
                let index = match effect {
                    OpEffect::RecordAppended { index } => index,
                    OpEffect::FileCreated => 0,
                };
                Ok(Response::RecordAppended {
                    index,
                    block_hash: block.hash_hex(),
                })
            }
            Request::ListFiles => Ok(Response::Files {
                files: self.ledger.read(|s| s.fs.list_files()),
            }),
            Request::TotalRecords { filename } => {
                let count = self.ledger.read(|s| s.fs.total_records(&filename))?;
                Ok(Response::TotalRecords { count })
            }
            Request::ReadRecord { filename, index } => {
                let record = self
                    .ledger
                    .read(|s| s.fs.read_record(&filename, index).map(<[u8]>::to_vec))?;
                Ok(Response::Record { record })
            }
            Request::StoreAndStop => {
                let blocks = self.store_snapshot()?;
                info!(blocks, "store-and-stop requested");
                self.shutdown();
                Ok(Response::Stored { blocks })
            }
            Request::Block { .. } => Err(NodeError::Unsupported(
                "blocks are accepted on the miners port only",
            )),
        }
    }

    async fn accept_block(
        &self,
        block: Block,
        origin: Option<String>,
    ) -> Result<Response, NodeError> {
        let outcome = self.miner.submit_block(block, origin).await?;
        Ok(Response::BlockAccepted {
            known: outcome == AppendOutcome::AlreadyKnown,
        })
    }

    /// Stage `op`, wait for its block, then for `confirmations` descendants.
    /// Returns the block and the op's effect as committed on chain.
    pub async fn submit_op(
        &self,
        op: OpRecord,
        confirmations: u64,
    ) -> Result<(Block, OpEffect), NodeError> {
        let op_id = op.uuid;
        let ready = self.staging.try_stage_op(op).await?;
        let staged = ready.effect;
        let block = ready.wait().await?;
        debug!(op = %op_id, block = %short_hex(&block.hash), "op mined, awaiting confirmations");

        self.await_confirmations(&block, confirmations).await?;

        // The staging index is a forecast; the chain has the final say.
        let chain = self.tree.canonical_chain();
        let effect = effect_on_chain(&chain, self.ledger.economics(), &op_id).unwrap_or(staged);
        Ok((block, effect))
    }

    async fn await_confirmations(&self, block: &Block, required: u64) -> Result<(), NodeError> {
        let mut tip = self.miner.subscribe_tip();
        let depth = self.tree.depth(&block.hash).ok_or_else(|| NodeError::OpOrphaned {
            block: block.hash_hex(),
        })?;

        loop {
            match self.tree.confirmations(&block.hash) {
                Some(have) if have >= required => return Ok(()),
                Some(_) => {}
                None if self.tree.height() >= depth + required => {
                    warn!(block = %short_hex(&block.hash), "op block orphaned");
                    return Err(NodeError::OpOrphaned {
                        block: block.hash_hex(),
                    });
                }
                None => {}
            }
            if tip.changed().await.is_err() {
                return Err(StagingError::Shutdown.into());
            }
        }
    }
}

fn into_response(kind: &'static str, result: Result<Response, NodeError>) -> Response {
    match result {
        Ok(response) => response,
        Err(e) => {
            debug!(request = kind, error = %e, "request failed");
            Response::error(e)
        }
    }
}

/// Push every block from `floods` to peers, in order, until the mining
/// coordinator stops. `on_report` sees the outcome of each flood.
pub async fn run_flooder<F>(
    mut floods: mpsc::UnboundedReceiver<FloodRequest>,
    flooder: Flooder,
    mut on_report: F,
) where
    F: FnMut(&FloodReport) + Send,
{
    while let Some(FloodRequest { block, origin }) = floods.recv().await {
        let report = flooder.flood(&block, origin.as_deref()).await;
        on_report(&report);
    }
    debug!("flooder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(miner_id: &str) -> MinerConfig {
        let mut config = MinerConfig::devnet(miner_id);
        config.common.op_difficulty = 1;
        config.common.noop_difficulty = 3;
        config.common.gen_op_block_timeout_ms = 20;
        config.common.cost_per_file_create = 0;
        config.common.confirmations_per_create = 1;
        config.common.confirmations_per_append = 1;
        config
    }

    #[tokio::test]
    async fn genesis_mismatch_refuses_to_start() {
        let mut cfg = config("m1");
        cfg.common.genesis_block_hash = "ab".repeat(32);
        let err = MinerNode::start(cfg, None).err().unwrap();
        assert!(matches!(err, NodeError::Chain(ChainError::GenesisMismatch { .. })));
    }

    #[tokio::test]
    async fn invalid_config_refuses_to_start() {
        let mut cfg = config("m1");
        cfg.miner_id.clear();
        assert!(matches!(MinerNode::start(cfg, None), Err(NodeError::Config(_))));
    }

    #[tokio::test]
    async fn client_reads_and_write() {
        let rt = MinerNode::start(config("m1"), None).unwrap();
        let node = rt.node.clone();

        let resp = node
            .handle_client(Envelope::client(Request::CreateFile {
                filename: "notes".into(),
            }))
            .await;
        assert!(matches!(resp, Response::FileCreated { .. }), "{resp:?}");

        let resp = node
            .handle_client(Envelope::client(Request::AppendRecord {
                filename: "notes".into(),
                record: b"hello".to_vec(),
            }))
            .await;
        assert!(matches!(resp, Response::RecordAppended { index: 0, .. }), "{resp:?}");

        assert_eq!(
            node.handle_client(Envelope::client(Request::ListFiles)).await,
            Response::Files {
                files: vec!["notes".into()]
            }
        );
        assert_eq!(
            node.handle_client(Envelope::client(Request::ReadRecord {
                filename: "notes".into(),
                index: 0
            }))
            .await,
            Response::Record {
                record: b"hello".to_vec()
            }
        );
        assert!(node
            .handle_client(Envelope::client(Request::TotalRecords {
                filename: "missing".into()
            }))
            .await
            .is_error());

        node.shutdown();
        rt.join().await;
    }

    #[tokio::test]
    async fn ports_reject_foreign_requests() {
        let rt = MinerNode::start(config("m1"), None).unwrap();
        let node = rt.node.clone();

        let resp = node
            .handle_client(Envelope::client(Request::Block {
                block: Block::genesis(),
            }))
            .await;
        assert!(resp.is_error());
        let resp = node
            .handle_peer(Envelope::from_peer("p:1", Request::ListFiles))
            .await;
        assert!(resp.is_error());

        node.shutdown();
        rt.join().await;
    }

    #[tokio::test]
    async fn store_and_stop_writes_snapshot_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config("m1");
        cfg.snapshot.path = Some(dir.path().join("data.bin"));
        let rt = MinerNode::start(cfg, None).unwrap();
        let node = rt.node.clone();

        let resp = node
            .handle_client(Envelope::client(Request::StoreAndStop))
            .await;
        assert!(matches!(resp, Response::Stored { .. }));
        assert!(node.is_shutting_down());
        rt.join().await;
        assert!(dir.path().join("data.bin").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_snapshot_writes_stay_restorable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut cfg = config("m1");
        cfg.snapshot.path = Some(path.clone());
        let rt = MinerNode::start(cfg, None).unwrap();

        let writers: Vec<_> = (0..6)
            .map(|_| {
                let node = rt.node.clone();
                tokio::task::spawn_blocking(move || node.store_snapshot())
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let restored = snapshot::restore(&path, ChainParams::from_config(&rt.node.config)).unwrap();
        assert!(restored.contains(&Block::genesis().hash));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        rt.node.shutdown();
        rt.join().await;
    }
}
