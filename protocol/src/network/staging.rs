//! # Staging Coordinator
//!
//! Client ops are not mined one at a time. The staging actor collects them
//! into a batch, validates each against a private snapshot of the ledger
//! (so a batch can create a file and append to it in one go), and hands
//! the sealed batch to the miner when the batch window closes.
//!
//! ## Batch lifecycle
//!
//! ```text
//!   first accepted op ──▶ snapshot = ledger.visible(), deadline = now + timeout
//!          │
//!   more ops ─────────▶ applied to the snapshot; rejected ones leave it as is
//!          │
//!   deadline ─────────▶ batch sealed and submitted to the miner
//!                       snapshot dropped; the next op opens a fresh one
//! ```
//!
//! The actor owns the staging area outright. Submissions and the batch
//! timer are served from one task, so there is no lock to lose updates
//! under.
//!
//! Each accepted op gets a [`BlockReady`] handle. The miner resolves it with
//! the block that carries the op, or with an error explaining why it never
//! will: the op became invalid on a new tip, mining stalled or failed, or
//! the node shut down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::STAGING_QUEUE_CAPACITY;
use crate::storage::block::{Block, OpRecord};
use crate::storage::state::{Economics, Ledger, LedgerState, OpEffect, OpRejected};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StagingError {
    #[error("op rejected: {0}")]
    Rejected(#[from] OpRejected),

    #[error("op invalidated after the tip moved: {0}")]
    Invalidated(OpRejected),

    #[error("mining stalled after {attempts} preemptions")]
    MiningStalled { attempts: u32 },

    #[error("mining failed: {0}")]
    MiningFailed(String),

    #[error("node is shutting down")]
    Shutdown,
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

pub type BlockReply = oneshot::Sender<Result<Block, StagingError>>;

/// An accepted op and the channel its submitter is waiting on.
#[derive(Debug)]
pub struct PendingOp {
    pub op: OpRecord,
    pub reply: BlockReply,
}

impl PendingOp {
    pub fn resolve(self, result: Result<Block, StagingError>) {
        // The submitter may have given up waiting; that is fine.
        let _ = self.reply.send(result);
    }
}

/// A closed batch on its way to the miner. Ops keep submission order.
#[derive(Debug)]
pub struct SealedBatch {
    pub id: u64,
    pub entries: Vec<PendingOp>,
}

impl SealedBatch {
    pub fn ops(&self) -> Vec<OpRecord> {
        self.entries.iter().map(|e| e.op.clone()).collect()
    }

    /// Resolve every waiter with the same error.
    pub fn fail(self, error: StagingError) {
        for entry in self.entries {
            entry.resolve(Err(error.clone()));
        }
    }
}

/// Returned for each accepted op.
#[derive(Debug)]
pub struct BlockReady {
    /// What the op did to the staging snapshot. For an append this
    /// carries the record's index.
    pub effect: OpEffect,
    rx: oneshot::Receiver<Result<Block, StagingError>>,
}

impl BlockReady {
    /// Wait for the block that carries the op.
    pub async fn wait(self) -> Result<Block, StagingError> {
        self.rx.await.unwrap_or(Err(StagingError::Shutdown))
    }
}

/// Where sealed batches go. The mining coordinator in production; a plain
/// channel in tests.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Hand over a batch. Gives it back if the receiver is gone.
    async fn submit(&self, batch: SealedBatch) -> Result<(), SealedBatch>;
}

// ---------------------------------------------------------------------------
// StagingArea
// ---------------------------------------------------------------------------

/// The open batch: a ledger snapshot and the ops applied to it so far.
pub struct StagingArea {
    snapshot: LedgerState,
    pending: Vec<PendingOp>,
    deadline: Instant,
}

impl StagingArea {
    pub fn open(snapshot: LedgerState, deadline: Instant) -> Self {
        Self {
            snapshot,
            pending: Vec::new(),
            deadline,
        }
    }

    /// Apply `op` to the snapshot. On success the op joins the batch.
    pub fn try_stage(&mut self, op: OpRecord, econ: &Economics) -> Result<BlockReady, OpRejected> {
        let effect = self.snapshot.apply_op(&op, econ)?;
        let (reply, rx) = oneshot::channel();
        self.pending.push(PendingOp { op, reply });
        Ok(BlockReady { effect, rx })
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn snapshot(&self) -> &LedgerState {
        &self.snapshot
    }

    fn seal(self, id: u64) -> SealedBatch {
        SealedBatch {
            id,
            entries: self.pending,
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

enum StagingRequest {
    Stage {
        op: OpRecord,
        reply: oneshot::Sender<Result<BlockReady, StagingError>>,
    },
}

/// Cloneable front door to the staging actor.
#[derive(Clone)]
pub struct StagingHandle {
    tx: mpsc::Sender<StagingRequest>,
}

impl StagingHandle {
    /// Validate `op` against the open batch and join it.
    pub async fn try_stage_op(&self, op: OpRecord) -> Result<BlockReady, StagingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StagingRequest::Stage { op, reply })
            .await
            .map_err(|_| StagingError::Shutdown)?;
        rx.await.unwrap_or(Err(StagingError::Shutdown))
    }
}

pub struct StagingCoordinator {
    ledger: Arc<Ledger>,
    timeout: Duration,
    sink: Arc<dyn BatchSink>,
    rx: mpsc::Receiver<StagingRequest>,
    area: Option<StagingArea>,
    next_batch: u64,
}

impl StagingCoordinator {
    pub fn new(
        ledger: Arc<Ledger>,
        timeout: Duration,
        sink: Arc<dyn BatchSink>,
    ) -> (Self, StagingHandle) {
        let (tx, rx) = mpsc::channel(STAGING_QUEUE_CAPACITY);
        let coordinator = Self {
            ledger,
            timeout,
            sink,
            rx,
            area: None,
            next_batch: 0,
        };
        (coordinator, StagingHandle { tx })
    }

    /// Serve submissions and seal batches until shutdown. Ops still open
    /// at shutdown are resolved with [`StagingError::Shutdown`].
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(timeout_ms = self.timeout.as_millis() as u64, "staging coordinator starting");

        loop {
            let deadline = self.area.as_ref().map(|a| a.deadline);
            tokio::select! {
                request = self.rx.recv() => match request {
                    Some(StagingRequest::Stage { op, reply }) => {
                        let _ = reply.send(self.stage(op));
                    }
                    None => break,
                },
                _ = sleep_until(deadline) => self.seal().await,
                _ = shutdown.changed() => break,
            }
        }

        if let Some(area) = self.area.take() {
            area.seal(self.next_batch).fail(StagingError::Shutdown);
        }
        info!("staging coordinator stopped");
    }

    fn stage(&mut self, op: OpRecord) -> Result<BlockReady, StagingError> {
        let econ = *self.ledger.economics();
        let op_id = op.uuid;

        let result = match self.area.as_mut() {
            Some(area) => area.try_stage(op, &econ),
            None => {
                // Only an accepted op opens the batch and starts the clock.
                let mut area =
                    StagingArea::open(self.ledger.visible(), Instant::now() + self.timeout);
                let result = area.try_stage(op, &econ);
                if result.is_ok() {
                    self.area = Some(area);
                }
                result
            }
        };

        match &result {
            Ok(ready) => debug!(op = %op_id, effect = ?ready.effect, "op staged"),
            Err(e) => debug!(op = %op_id, reason = %e, "op rejected"),
        }
        result.map_err(StagingError::from)
    }

    async fn seal(&mut self) {
        let Some(area) = self.area.take() else {
            return;
        };
        let batch = area.seal(self.next_batch);
        self.next_batch += 1;

        info!(batch = batch.id, ops = batch.entries.len(), "batch sealed");
        if let Err(batch) = self.sink.submit(batch).await {
            warn!(batch = batch.id, "miner unavailable, failing batch");
            batch.fail(StagingError::Shutdown);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
