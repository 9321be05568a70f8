//! # Ledger State
//!
//! The filesystem and the coin balances are not stored anywhere. They are
//! *derived* by replaying the canonical chain from genesis, so every miner
//! holding the same chain computes the same state.
//!
//! ## State Transitions
//!
//! For each block on the canonical chain, in order:
//!
//! 1. Apply its ops in order. `CreateFile` debits `cost_per_file_create`
//!    from the op's miner and adds an empty file; `AppendRecord` appends
//!    the payload. An op that is invalid at this point (a competing
//!    branch created the same file first) is skipped.
//! 2. Credit the block's miner with the op-block or no-op-block reward.
//!
//! ## Committed vs. visible
//!
//! [`Ledger`] keeps two views:
//!
//! ```text
//!   base     = replay(canonical chain)           what the chain says
//!   visible  = base + overlay ops                what clients see
//! ```
//!
//! The overlay holds ops that are sealed into a batch but not yet mined.
//! Reads are served from `visible`, so a client sees its own writes as
//! soon as the batch is sealed. When the tip moves the base is advanced
//! incrementally along the new suffix, or rebuilt from genesis if the
//! old tip fell off the canonical chain.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{CommonMinerConfig, MAX_RECORD_BYTES};
use crate::crypto::hash::{short_hex, Hash};
use crate::storage::block::{Block, OpRecord, OpType};
use crate::storage::filesystem::{FileSystem, FsError};
use crate::storage::tree::BlockTree;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Why an op cannot be applied to a given state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpRejected {
    #[error("miner {miner_id} has {balance} coins, creating a file costs {cost}")]
    InsufficientBalance {
        miner_id: String,
        balance: u64,
        cost: u64,
    },

    #[error("file {0:?} already exists")]
    FileExists(String),

    #[error("file {0:?} does not exist")]
    FileNotFound(String),

    #[error("record is {size} bytes, the limit is {limit}")]
    RecordTooLarge { size: usize, limit: usize },

    #[error("filename must not be empty")]
    EmptyFilename,
}

impl From<FsError> for OpRejected {
    fn from(e: FsError) -> Self {
        match e {
            FsError::FileExists(name) => Self::FileExists(name),
            FsError::FileNotFound(name) | FsError::RecordNotFound { filename: name, .. } => {
                Self::FileNotFound(name)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Economics
// ---------------------------------------------------------------------------

/// Coin rules shared by every miner of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Economics {
    pub cost_per_file_create: u64,
    pub mined_coins_per_op_block: u64,
    pub mined_coins_per_noop_block: u64,
}

impl Economics {
    pub fn from_config(common: &CommonMinerConfig) -> Self {
        Self {
            cost_per_file_create: common.cost_per_file_create,
            mined_coins_per_op_block: common.mined_coins_per_op_block,
            mined_coins_per_noop_block: common.mined_coins_per_noop_block,
        }
    }

    pub fn reward_for(&self, block: &Block) -> u64 {
        if block.is_op {
            self.mined_coins_per_op_block
        } else {
            self.mined_coins_per_noop_block
        }
    }
}

// ---------------------------------------------------------------------------
// Bank
// ---------------------------------------------------------------------------

/// Coin balance per miner id. Unknown miners hold zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bank {
    balances: HashMap<String, u64>,
}

impl Bank {
    pub fn balance(&self, miner_id: &str) -> u64 {
        self.balances.get(miner_id).copied().unwrap_or(0)
    }

    pub fn credit(&mut self, miner_id: &str, amount: u64) {
        let entry = self.balances.entry(miner_id.to_string()).or_insert(0);
        *entry = entry.saturating_add(amount);
    }

    /// Debit `amount`, failing without mutation if the balance is short.
    pub fn debit(&mut self, miner_id: &str, amount: u64) -> Result<(), OpRejected> {
        let balance = self.balance(miner_id);
        if balance < amount {
            return Err(OpRejected::InsufficientBalance {
                miner_id: miner_id.to_string(),
                balance,
                cost: amount,
            });
        }
        if amount > 0 {
            self.balances.insert(miner_id.to_string(), balance - amount);
        }
        Ok(())
    }

    pub fn balances(&self) -> &HashMap<String, u64> {
        &self.balances
    }
}

// ---------------------------------------------------------------------------
// LedgerState
// ---------------------------------------------------------------------------

/// What applying an op did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpEffect {
    FileCreated,
    RecordAppended { index: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerState {
    pub fs: FileSystem,
    pub bank: Bank,
}

impl LedgerState {
    /// Check `op` against this state without changing it.
    pub fn check_op(&self, op: &OpRecord, econ: &Economics) -> Result<(), OpRejected> {
        if op.filename.is_empty() {
            return Err(OpRejected::EmptyFilename);
        }
        match op.op_type {
            OpType::CreateFile => {
                if self.fs.contains(&op.filename) {
                    return Err(OpRejected::FileExists(op.filename.clone()));
                }
                let balance = self.bank.balance(&op.miner_id);
                if balance < econ.cost_per_file_create {
                    return Err(OpRejected::InsufficientBalance {
                        miner_id: op.miner_id.clone(),
                        balance,
                        cost: econ.cost_per_file_create,
                    });
                }
            }
            OpType::AppendRecord => {
                if op.payload.len() > MAX_RECORD_BYTES {
                    return Err(OpRejected::RecordTooLarge {
                        size: op.payload.len(),
                        limit: MAX_RECORD_BYTES,
                    });
                }
                if !self.fs.contains(&op.filename) {
                    return Err(OpRejected::FileNotFound(op.filename.clone()));
                }
            }
        }
        Ok(())
    }

    /// Validate then apply `op`. A rejected op leaves the state untouched.
    pub fn apply_op(&mut self, op: &OpRecord, econ: &Economics) -> Result<OpEffect, OpRejected> {
        self.check_op(op, econ)?;
        match op.op_type {
            OpType::CreateFile => {
                self.bank.debit(&op.miner_id, econ.cost_per_file_create)?;
                self.fs.add_file(&op.filename)?;
                Ok(OpEffect::FileCreated)
            }
            OpType::AppendRecord => {
                let index = self.fs.append_record(&op.filename, op.payload.clone())?;
                Ok(OpEffect::RecordAppended { index })
            }
        }
    }

    /// Apply a committed block: its valid ops, then the miner's reward.
    pub fn apply_block(&mut self, block: &Block, econ: &Economics) {
        for op in block.effective_ops() {
            if let Err(e) = self.apply_op(op, econ) {
                warn!(
                    block = %short_hex(&block.hash),
                    op = %op.uuid,
                    error = %e,
                    "skipping op that is invalid on this chain"
                );
            }
        }
        self.bank.credit(&block.miner_id, econ.reward_for(block));
    }

    /// Apply ops that are not yet on chain, skipping the ones that no
    /// longer fit.
    pub fn apply_pending<'a>(
        &mut self,
        ops: impl IntoIterator<Item = &'a OpRecord>,
        econ: &Economics,
    ) {
        for op in ops {
            if let Err(e) = self.apply_op(op, econ) {
                debug!(op = %op.uuid, error = %e, "pending op no longer applies");
            }
        }
    }
}

/// State after replaying `chain`. The first block is expected to be
/// genesis and is skipped.
pub fn replay(chain: &[Block], econ: &Economics) -> LedgerState {
    let mut state = LedgerState::default();
    for block in chain.iter().skip(1) {
        state.apply_block(block, econ);
    }
    state
}

/// Replay `chain` up to the op `op_id` and report what it did there.
/// `None` when the op is not on `chain` or was skipped as invalid.
pub fn effect_on_chain(chain: &[Block], econ: &Economics, op_id: &Uuid) -> Option<OpEffect> {
    let mut state = LedgerState::default();
    for block in chain.iter().skip(1) {
        for op in block.effective_ops() {
            let result = state.apply_op(op, econ);
            if op.uuid == *op_id {
                return result.ok();
            }
        }
        state.bank.credit(&block.miner_id, econ.reward_for(block));
    }
    None
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

struct LedgerInner {
    base: LedgerState,
    base_tip: Hash,
    overlay: Vec<OpRecord>,
    visible: LedgerState,
}

/// Shared, thread-safe ledger: the chain-derived base state plus the
/// overlay of sealed-but-unmined ops.
pub struct Ledger {
    econ: Economics,
    inner: RwLock<LedgerInner>,
}

impl Ledger {
    /// Ledger positioned at the tree's current tip.
    pub fn new(econ: Economics, tree: &BlockTree) -> Self {
        let chain = tree.canonical_chain();
        let base = replay(&chain, &econ);
        let base_tip = chain.last().map(|b| b.hash).unwrap_or(tree.genesis().hash);
        Self {
            econ,
            inner: RwLock::new(LedgerInner {
                visible: base.clone(),
                base,
                base_tip,
                overlay: Vec::new(),
            }),
        }
    }

    pub fn economics(&self) -> &Economics {
        &self.econ
    }

    /// Bring the base state up to the tree's canonical tip. Returns true
    /// when the base moved.
    pub fn sync(&self, tree: &BlockTree) -> bool {
        self.sync_inner(tree, None)
    }

    /// [`sync`](Self::sync) and replace the overlay in one step. Used when
    /// a mined block commits ops that were in the overlay, so no reader
    /// ever sees them applied twice.
    pub fn sync_with_overlay(&self, tree: &BlockTree, overlay: Vec<OpRecord>) -> bool {
        self.sync_inner(tree, Some(overlay))
    }

    fn sync_inner(&self, tree: &BlockTree, overlay: Option<Vec<OpRecord>>) -> bool {
        let mut inner = self.inner.write();
        let overlay_changed = overlay.is_some();
        if let Some(ops) = overlay {
            inner.overlay = ops;
        }
        let moved = match tree.chain_after(&inner.base_tip) {
            Some(suffix) if suffix.is_empty() => false,
            Some(suffix) => {
                for block in &suffix {
                    inner.base.apply_block(block, &self.econ);
                }
                if let Some(last) = suffix.last() {
                    inner.base_tip = last.hash;
                }
                debug!(applied = suffix.len(), "ledger advanced");
                true
            }
            None => {
                let chain = tree.canonical_chain();
                inner.base = replay(&chain, &self.econ);
                inner.base_tip = chain.last().map(|b| b.hash).unwrap_or(tree.genesis().hash);
                debug!(blocks = chain.len(), "ledger rebuilt after reorg");
                true
            }
        };
        if moved || overlay_changed {
            Self::refresh(&mut inner, &self.econ);
        }
        moved
    }

    /// Replace the overlay of sealed-but-unmined ops.
    pub fn set_overlay(&self, ops: Vec<OpRecord>) {
        let mut inner = self.inner.write();
        inner.overlay = ops;
        Self::refresh(&mut inner, &self.econ);
    }

    fn refresh(inner: &mut LedgerInner, econ: &Economics) {
        let mut visible = inner.base.clone();
        visible.apply_pending(&inner.overlay, econ);
        inner.visible = visible;
    }

    /// Copy of the chain-derived state.
    pub fn base(&self) -> LedgerState {
        self.inner.read().base.clone()
    }

    pub fn base_tip(&self) -> Hash {
        self.inner.read().base_tip
    }

    /// Copy of the client-visible state.
    pub fn visible(&self) -> LedgerState {
        self.inner.read().visible.clone()
    }

    /// Run `f` against the client-visible state without copying it.
    pub fn read<R>(&self, f: impl FnOnce(&LedgerState) -> R) -> R {
        f(&self.inner.read().visible)
    }

    pub fn balance(&self, miner_id: &str) -> u64 {
        self.read(|s| s.bank.balance(miner_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::pow::{mine_blocking, CancelToken};
    use crate::storage::tree::ChainParams;

    const ECON: Economics = Economics {
        cost_per_file_create: 2,
        mined_coins_per_op_block: 3,
        mined_coins_per_noop_block: 1,
    };

    const PARAMS: ChainParams = ChainParams {
        op_difficulty: 1,
        noop_difficulty: 1,
        back_check_depth: 2,
    };

    fn mine(block: Block) -> Block {
        mine_blocking(block, 1, 2, &CancelToken::new()).unwrap()
    }

    fn funded(miner: &str, coins: u64) -> LedgerState {
        let mut state = LedgerState::default();
        state.bank.credit(miner, coins);
        state
    }

    #[test]
    fn create_debits_cost_and_adds_file() {
        let mut state = funded("m1", 5);
        let effect = state.apply_op(&OpRecord::create_file("m1", "a"), &ECON).unwrap();
        assert_eq!(effect, OpEffect::FileCreated);
        assert_eq!(state.bank.balance("m1"), 3);
        assert!(state.fs.contains("a"));
    }

    #[test]
    fn exactly_floor_n_over_c_creates_succeed() {
        for (n, c) in [(0u64, 1u64), (7, 2), (9, 3), (5, 10)] {
            let econ = Economics {
                cost_per_file_create: c,
                ..ECON
            };
            let mut state = funded("m1", n);
            let accepted = (0..(n / c + 3))
                .filter(|i| {
                    state
                        .apply_op(&OpRecord::create_file("m1", &format!("f{i}")), &econ)
                        .is_ok()
                })
                .count() as u64;
            assert_eq!(accepted, n / c, "N={n} c={c}");
        }
    }

    #[test]
    fn rejected_op_leaves_state_untouched() {
        let mut state = funded("m1", 1);
        let before = state.clone();
        let err = state.apply_op(&OpRecord::create_file("m1", "a"), &ECON).unwrap_err();
        assert!(matches!(err, OpRejected::InsufficientBalance { balance: 1, cost: 2, .. }));
        assert_eq!(state, before);
    }

    #[test]
    fn append_rules() {
        let mut state = funded("m1", 10);
        assert_eq!(
            state.apply_op(&OpRecord::append_record("m1", "a", b"x".to_vec()), &ECON),
            Err(OpRejected::FileNotFound("a".into()))
        );
        state.apply_op(&OpRecord::create_file("m1", "a"), &ECON).unwrap();
        assert_eq!(
            state.apply_op(&OpRecord::append_record("m1", "a", b"x".to_vec()), &ECON),
            Ok(OpEffect::RecordAppended { index: 0 })
        );
        let big = vec![0u8; MAX_RECORD_BYTES + 1];
        assert!(matches!(
            state.apply_op(&OpRecord::append_record("m1", "a", big), &ECON),
            Err(OpRejected::RecordTooLarge { .. })
        ));
        assert_eq!(
            state.apply_op(&OpRecord::create_file("m1", ""), &ECON),
            Err(OpRejected::EmptyFilename)
        );
    }

    #[test]
    fn apply_block_skips_invalid_ops_and_credits_reward() {
        let mut state = funded("m1", 10);
        state.apply_op(&OpRecord::create_file("m1", "dup"), &ECON).unwrap();

        let block = Block::op(
            [0u8; 32],
            "m2",
            vec![
                OpRecord::create_file("m1", "dup"),
                OpRecord::create_file("m1", "fresh"),
            ],
        );
        state.apply_block(&block, &ECON);

        assert!(state.fs.contains("fresh"));
        assert_eq!(state.bank.balance("m1"), 6);
        assert_eq!(state.bank.balance("m2"), ECON.mined_coins_per_op_block);
    }

    #[test]
    fn noop_block_ops_are_not_replayed() {
        let mut state = funded("m1", 10);
        let mut block = Block::noop([0u8; 32], "m2");
        block.ops = vec![OpRecord::create_file("m1", "smuggled")];

        state.apply_block(&block, &ECON);

        assert!(!state.fs.contains("smuggled"));
        assert_eq!(state.bank.balance("m1"), 10);
        assert_eq!(state.bank.balance("m2"), ECON.mined_coins_per_noop_block);
    }

    #[test]
    fn effect_on_chain_reports_committed_index() {
        let create = OpRecord::create_file("m1", "log");
        let first = OpRecord::append_record("m2", "log", b"a".to_vec());
        let second = OpRecord::append_record("m1", "log", b"b".to_vec());
        let ghost = OpRecord::append_record("m1", "nope", b"c".to_vec());

        let g = Block::genesis();
        // Links are not checked here; two no-ops fund the create.
        let n1 = Block::noop(g.hash, "m1");
        let n2 = Block::noop([1u8; 32], "m1");
        let b2 = Block::op([2u8; 32], "m1", vec![create.clone(), first.clone()]);
        let b3 = Block::op([3u8; 32], "m2", vec![second.clone(), ghost.clone()]);
        let chain = vec![g, n1, n2, b2, b3];

        assert_eq!(effect_on_chain(&chain, &ECON, &create.uuid), Some(OpEffect::FileCreated));
        assert_eq!(
            effect_on_chain(&chain, &ECON, &second.uuid),
            Some(OpEffect::RecordAppended { index: 1 })
        );
        assert_eq!(effect_on_chain(&chain, &ECON, &ghost.uuid), None);
        assert_eq!(effect_on_chain(&chain, &ECON, &Uuid::new_v4()), None);
    }

    #[test]
    fn ledger_follows_tip_and_overlay() {
        let tree = BlockTree::new(PARAMS);
        let ledger = Ledger::new(ECON, &tree);
        assert_eq!(ledger.balance("m1"), 0);

        let b1 = mine(Block::noop(tree.genesis().hash, "m1"));
        let b2 = mine(Block::noop(b1.hash, "m1"));
        tree.append(b1).unwrap();
        tree.append(b2.clone()).unwrap();
        assert!(ledger.sync(&tree));
        assert!(!ledger.sync(&tree));
        assert_eq!(ledger.base_tip(), b2.hash);
        assert_eq!(ledger.balance("m1"), 2);

        ledger.set_overlay(vec![OpRecord::create_file("m1", "a")]);
        assert!(ledger.read(|s| s.fs.contains("a")));
        assert!(!ledger.base().fs.contains("a"));
        assert_eq!(ledger.balance("m1"), 0);

        ledger.set_overlay(Vec::new());
        assert_eq!(ledger.balance("m1"), 2);
    }

    #[test]
    fn committing_overlay_ops_applies_them_once() {
        let tree = BlockTree::new(PARAMS);
        let ledger = Ledger::new(ECON, &tree);
        let g = tree.genesis().hash;

        let b0 = mine(Block::noop(g, "m1"));
        let b1 = mine(Block::noop(b0.hash, "m1"));
        tree.append(b0).unwrap();
        tree.append(b1.clone()).unwrap();
        ledger.sync(&tree);
        assert_eq!(ledger.balance("m1"), ECON.cost_per_file_create);

        let ops = vec![
            OpRecord::create_file("m1", "log"),
            OpRecord::append_record("m1", "log", b"one".to_vec()),
        ];
        ledger.set_overlay(ops.clone());
        assert_eq!(ledger.read(|s| s.fs.total_records("log")), Ok(1));

        let b2 = mine(Block::op(b1.hash, "m1", ops));
        tree.append(b2).unwrap();
        assert!(ledger.sync_with_overlay(&tree, Vec::new()));

        assert_eq!(ledger.read(|s| s.fs.total_records("log")), Ok(1));
        assert_eq!(ledger.visible(), ledger.base());
    }

    #[test]
    fn ledger_rebuilds_after_reorg() {
        let tree = BlockTree::new(PARAMS);
        let ledger = Ledger::new(ECON, &tree);
        let g = tree.genesis().hash;

        let a1 = mine(Block::noop(g, "a"));
        tree.append(a1.clone()).unwrap();
        ledger.sync(&tree);
        assert_eq!(ledger.balance("a"), 1);

        // A longer competing branch takes over.
        let b1 = mine(Block::noop(g, "b"));
        let b2 = mine(Block::noop(b1.hash, "b"));
        tree.append(b1).unwrap();
        tree.append(b2.clone()).unwrap();
        assert!(ledger.sync(&tree));

        assert_eq!(ledger.base_tip(), b2.hash);
        assert_eq!(ledger.balance("a"), 0);
        assert_eq!(ledger.balance("b"), 2);
        assert_eq!(ledger.base(), replay(&tree.canonical_chain(), &ECON));
    }
}
