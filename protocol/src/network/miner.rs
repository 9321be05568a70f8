//! # Mining Coordinator
//!
//! A single task owns the mining loop. It decides what to mine next, runs
//! the nonce search, and arbitrates between its own work and blocks that
//! arrive from peers. Everything that changes the tree on this node goes
//! through it, so "is my solution still on the tip?" is a plain comparison.
//!
//! ## State Machine
//!
//! ```text
//!              ┌──────────── tip moved / solved ─────────────┐
//!              ▼                                             │
//!   ┌──────────────────┐   batch sealed    ┌────────┐        │
//!   │ MiningNoop{tip}  │ ────────────────▶ │ Paused │        │
//!   └──────────────────┘                   └────────┘        │
//!        ▲                                      │ re-validate│
//!        │ batch done / failed                  ▼            │
//!        │                          ┌──────────────────────┐ │
//!        └───────────────────────── │ MiningOp{tip, n, k}  │─┘
//!                                   └──────────────────────┘
//!                                      │ external block moved the tip
//!                                      └──▶ Paused ──▶ MiningOp{new tip, n', k+1}
//! ```
//!
//! An op block that is preempted more than `max_preemptions` times gives
//! up and its waiters get [`StagingError::MiningStalled`]. External blocks
//! that do not move the tip (side forks, duplicates) are stored without
//! interrupting the search.
//!
//! Batches sealed while an op block is in flight wait in a FIFO queue.
//! Their ops, together with the in-flight ones, form the ledger overlay.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{MiningTuning, MINER_QUEUE_CAPACITY};
use crate::crypto::hash::{short_hex, Hash};
use crate::network::pow::{self, CancelToken, NoncePool, PowError};
use crate::network::staging::{BatchSink, PendingOp, SealedBatch, StagingError};
use crate::storage::block::{Block, OpRecord};
use crate::storage::state::Ledger;
use crate::storage::tree::{AppendOutcome, BlockTree, ChainError, ChainParams};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiningState {
    MiningNoop { parent: Hash },
    MiningOp { parent: Hash, ops: usize, attempt: u32 },
    Paused,
    Stopped,
}

impl MiningState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MiningNoop { .. } => "mining_noop",
            Self::MiningOp { .. } => "mining_op",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }

    /// Block the current search builds on, if any.
    pub fn parent(&self) -> Option<Hash> {
        match self {
            Self::MiningNoop { parent } | Self::MiningOp { parent, .. } => Some(*parent),
            Self::Paused | Self::Stopped => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MiningError {
    #[error("mining coordinator has stopped")]
    Stopped,

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Pow(#[from] PowError),
}

/// A block that should be sent to peers. `origin` is the peer it came from,
/// which is skipped.
#[derive(Debug, Clone)]
pub struct FloodRequest {
    pub block: Block,
    pub origin: Option<String>,
}

#[derive(Debug)]
enum MinerCommand {
    Seal {
        batch: SealedBatch,
        ack: oneshot::Sender<()>,
    },
    External {
        block: Block,
        origin: Option<String>,
        reply: oneshot::Sender<Result<AppendOutcome, ChainError>>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MinerHandle {
    tx: mpsc::Sender<MinerCommand>,
    state: watch::Receiver<MiningState>,
    tip: watch::Receiver<Hash>,
}

impl MinerHandle {
    /// Hand a block received from `origin` to the coordinator for
    /// validation and storage.
    pub async fn submit_block(
        &self,
        block: Block,
        origin: Option<String>,
    ) -> Result<AppendOutcome, MiningError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MinerCommand::External { block, origin, reply })
            .await
            .map_err(|_| MiningError::Stopped)?;
        Ok(rx.await.map_err(|_| MiningError::Stopped)??)
    }

    pub fn state(&self) -> MiningState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MiningState> {
        self.state.clone()
    }

    pub fn tip(&self) -> Hash {
        *self.tip.borrow()
    }

    /// Changes every time the canonical tip moves.
    pub fn subscribe_tip(&self) -> watch::Receiver<Hash> {
        self.tip.clone()
    }
}

#[async_trait]
impl BatchSink for MinerHandle {
    /// Returns once the batch is queued and its ops are in the overlay, so
    /// the next staging snapshot already sees them.
    async fn submit(&self, batch: SealedBatch) -> Result<(), SealedBatch> {
        let (ack, acked) = oneshot::channel();
        if let Err(mpsc::error::SendError(cmd)) =
            self.tx.send(MinerCommand::Seal { batch, ack }).await
        {
            return match cmd {
                MinerCommand::Seal { batch, .. } => Err(batch),
                MinerCommand::External { .. } => Ok(()),
            };
        }
        // A dropped ack means the coordinator stopped and already failed
        // the batch while draining.
        let _ = acked.await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

enum RoundOutcome {
    Solved(Result<Block, PowError>),
    TipMoved,
    BatchQueued,
    Stop,
}

enum Commit {
    Appended(Block),
    Stale,
    Rejected(ChainError),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RoundKind {
    Noop,
    Op,
}

pub struct MiningCoordinator {
    miner_id: String,
    tree: Arc<BlockTree>,
    ledger: Arc<Ledger>,
    params: ChainParams,
    pool: Arc<NoncePool>,
    max_preemptions: u32,
    rx: mpsc::Receiver<MinerCommand>,
    state_tx: watch::Sender<MiningState>,
    tip_tx: watch::Sender<Hash>,
    flood_tx: mpsc::UnboundedSender<FloodRequest>,
    queue: VecDeque<SealedBatch>,
    in_flight: Vec<OpRecord>,
    /// Parent and next `extra_nonce` after an exhausted no-op search.
    noop_seed: Option<(Hash, u32)>,
}

impl MiningCoordinator {
    pub fn new(
        miner_id: impl Into<String>,
        tree: Arc<BlockTree>,
        ledger: Arc<Ledger>,
        tuning: &MiningTuning,
        pool: Arc<NoncePool>,
    ) -> (Self, MinerHandle, mpsc::UnboundedReceiver<FloodRequest>) {
        let (tx, rx) = mpsc::channel(MINER_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(MiningState::Paused);
        let (tip_tx, tip_rx) = watch::channel(tree.tip_hash());
        let (flood_tx, flood_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            miner_id: miner_id.into(),
            params: tree.params(),
            tree,
            ledger,
            pool,
            max_preemptions: tuning.max_preemptions,
            rx,
            state_tx,
            tip_tx,
            flood_tx,
            queue: VecDeque::new(),
            in_flight: Vec::new(),
            noop_seed: None,
        };
        let handle = MinerHandle {
            tx,
            state: state_rx,
            tip: tip_rx,
        };
        (coordinator, handle, flood_rx)
    }

    /// Mine until shutdown. Every waiter still pending at that point is
    /// resolved with [`StagingError::Shutdown`].
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            miner_id = %self.miner_id,
            workers = self.pool.workers(),
            op_difficulty = self.params.op_difficulty,
            noop_difficulty = self.params.noop_difficulty,
            "mining coordinator starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let keep_going = match self.queue.pop_front() {
                Some(batch) => self.mine_op_batch(batch, &mut shutdown).await,
                None => self.mine_noop_round(&mut shutdown).await,
            };
            if !keep_going {
                break;
            }
        }

        self.set_state(MiningState::Stopped);
        for batch in self.queue.drain(..) {
            batch.fail(StagingError::Shutdown);
        }
        self.rx.close();
        while let Ok(cmd) = self.rx.try_recv() {
            if let MinerCommand::Seal { batch, ack } = cmd {
                batch.fail(StagingError::Shutdown);
                let _ = ack.send(());
            }
        }
        info!(height = self.tree.height(), "mining coordinator stopped");
    }

    async fn mine_noop_round(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let parent = self.tree.tip_hash();
        self.set_state(MiningState::MiningNoop { parent });
        let candidate = self.noop_candidate(parent);

        match self
            .mine_round(candidate, self.params.noop_difficulty, RoundKind::Noop, shutdown)
            .await
        {
            RoundOutcome::Solved(Ok(block)) => {
                self.noop_seed = None;
                if let Commit::Rejected(e) = self.commit_mined(block) {
                    error!(error = %e, "own no-op block rejected");
                }
                true
            }
            RoundOutcome::Solved(Err(e)) => {
                warn!(error = %e, "no-op search failed");
                self.note_noop_failure(parent, &e);
                true
            }
            RoundOutcome::TipMoved | RoundOutcome::BatchQueued => true,
            RoundOutcome::Stop => false,
        }
    }

    /// No-op candidate on `parent`. After an exhausted search on the same
    /// parent it starts at the first `extra_nonce` not yet searched.
    fn noop_candidate(&self, parent: Hash) -> Block {
        let mut block = Block::noop(parent, &self.miner_id);
        if let Some((seeded, extra_nonce)) = self.noop_seed {
            if seeded == parent {
                block.extra_nonce = extra_nonce;
            }
        }
        block
    }

    fn note_noop_failure(&mut self, parent: Hash, error: &PowError) {
        if let PowError::NonceSpaceExhausted { extra_nonce } = error {
            self.noop_seed = Some((parent, extra_nonce.wrapping_add(1)));
        }
    }

    async fn mine_op_batch(
        &mut self,
        batch: SealedBatch,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let batch_id = batch.id;
        let mut entries = batch.entries;
        let mut attempt = 0u32;

        loop {
            self.set_state(MiningState::Paused);
            entries = self.revalidate(entries);
            if entries.is_empty() {
                debug!(batch = batch_id, "nothing left to mine in batch");
                self.finish_batch();
                return true;
            }
            self.in_flight = entries.iter().map(|e| e.op.clone()).collect();
            self.refresh_overlay();

            let parent = self.tree.tip_hash();
            self.set_state(MiningState::MiningOp {
                parent,
                ops: entries.len(),
                attempt,
            });
            let candidate = Block::op(parent, &self.miner_id, self.in_flight.clone());

            match self
                .mine_round(candidate, self.params.op_difficulty, RoundKind::Op, shutdown)
                .await
            {
                RoundOutcome::Solved(Ok(block)) => match self.commit_mined(block) {
                    Commit::Appended(block) => {
                        for entry in entries {
                            entry.resolve(Ok(block.clone()));
                        }
                        return true;
                    }
                    Commit::Stale => {}
                    Commit::Rejected(e) => {
                        error!(batch = batch_id, error = %e, "own op block rejected");
                        fail_all(entries, StagingError::MiningFailed(e.to_string()));
                        self.finish_batch();
                        return true;
                    }
                },
                RoundOutcome::Solved(Err(e)) => {
                    error!(batch = batch_id, error = %e, "op block search failed");
                    fail_all(entries, StagingError::MiningFailed(e.to_string()));
                    self.finish_batch();
                    return true;
                }
                RoundOutcome::TipMoved => {}
                RoundOutcome::BatchQueued => continue,
                RoundOutcome::Stop => {
                    fail_all(entries, StagingError::Shutdown);
                    return false;
                }
            }

            attempt += 1;
            if attempt > self.max_preemptions {
                warn!(batch = batch_id, attempts = attempt, "op block preempted too often, giving up");
                fail_all(entries, StagingError::MiningStalled { attempts: attempt });
                self.finish_batch();
                return true;
            }
            info!(batch = batch_id, attempt, "op block preempted, rebuilding on new tip");
        }
    }

    /// Run one nonce search while still serving commands.
    async fn mine_round(
        &mut self,
        candidate: Block,
        difficulty: u8,
        kind: RoundKind,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RoundOutcome {
        let cancel = CancelToken::new();
        let search = pow::mine(self.pool.clone(), candidate, difficulty, cancel.clone());
        tokio::pin!(search);

        loop {
            tokio::select! {
                result = &mut search => return RoundOutcome::Solved(result),
                cmd = self.rx.recv() => match cmd {
                    Some(MinerCommand::Seal { batch, ack }) => {
                        debug!(batch = batch.id, ops = batch.entries.len(), "batch queued");
                        self.queue.push_back(batch);
                        self.refresh_overlay();
                        let _ = ack.send(());
                        if kind == RoundKind::Noop {
                            cancel.cancel();
                            return RoundOutcome::BatchQueued;
                        }
                    }
                    Some(MinerCommand::External { block, origin, reply }) => {
                        let resume = self.state_tx.borrow().clone();
                        if kind == RoundKind::Noop {
                            self.set_state(MiningState::Paused);
                        }
                        let result = self.ingest(block, origin);
                        let moved = matches!(result, Ok(AppendOutcome::Inserted { tip_changed: true }));
                        let _ = reply.send(result);
                        if moved {
                            cancel.cancel();
                            return RoundOutcome::TipMoved;
                        }
                        self.set_state(resume);
                    }
                    None => {
                        cancel.cancel();
                        return RoundOutcome::Stop;
                    }
                },
                _ = shutdown.changed() => {
                    cancel.cancel();
                    return RoundOutcome::Stop;
                }
            }
        }
    }

    /// Drop ops that no longer apply on the current tip. Their waiters are
    /// told why.
    fn revalidate(&self, entries: Vec<PendingOp>) -> Vec<PendingOp> {
        let econ = *self.ledger.economics();
        let mut scratch = self.ledger.base();
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            match scratch.apply_op(&entry.op, &econ) {
                Ok(_) => kept.push(entry),
                Err(e) => {
                    info!(op = %entry.op.uuid, reason = %e, "op invalidated on new tip");
                    entry.resolve(Err(StagingError::Invalidated(e)));
                }
            }
        }
        kept
    }

    fn ingest(&mut self, block: Block, origin: Option<String>) -> Result<AppendOutcome, ChainError> {
        let hash = block.hash;
        let result = self.tree.append(block.clone());
        match &result {
            Ok(AppendOutcome::Inserted { tip_changed }) => {
                info!(
                    hash = %short_hex(&hash),
                    origin = origin.as_deref().unwrap_or("-"),
                    tip_changed,
                    "external block accepted"
                );
                if *tip_changed {
                    self.ledger.sync(&self.tree);
                    self.publish_tip();
                }
                self.flood(block, origin);
            }
            Ok(AppendOutcome::AlreadyKnown) => {
                debug!(hash = %short_hex(&hash), "external block already known");
            }
            Err(e) => {
                warn!(hash = %short_hex(&hash), error = %e, "external block rejected");
            }
        }
        result
    }

    fn commit_mined(&mut self, block: Block) -> Commit {
        if block.prev_hash != self.tree.tip_hash() {
            debug!(hash = %short_hex(&block.hash), "discarding stale solution");
            return Commit::Stale;
        }
        if let Err(e) = self.tree.append(block.clone()) {
            return Commit::Rejected(e);
        }
        self.in_flight.clear();
        self.ledger.sync_with_overlay(&self.tree, self.queued_ops());
        self.publish_tip();
        self.flood(block.clone(), None);
        info!(
            hash = %short_hex(&block.hash),
            height = self.tree.height(),
            is_op = block.is_op,
            ops = block.ops.len(),
            "mined block"
        );
        Commit::Appended(block)
    }

    fn finish_batch(&mut self) {
        self.in_flight.clear();
        self.refresh_overlay();
    }

    fn queued_ops(&self) -> Vec<OpRecord> {
        self.queue.iter().flat_map(|b| b.ops()).collect()
    }

    fn refresh_overlay(&self) {
        let mut ops = self.in_flight.clone();
        ops.extend(self.queued_ops());
        self.ledger.set_overlay(ops);
    }

    fn publish_tip(&self) {
        self.tip_tx.send_replace(self.tree.tip_hash());
    }

    fn flood(&self, block: Block, origin: Option<String>) {
        let _ = self.flood_tx.send(FloodRequest { block, origin });
    }

    fn set_state(&self, state: MiningState) {
        self.state_tx.send_replace(state);
    }
}

fn fail_all(entries: Vec<PendingOp>, error: StagingError) {
    for entry in entries {
        entry.resolve(Err(error.clone()));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
