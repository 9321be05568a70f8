//! # Block Tree
//!
//! Every valid block this miner has ever seen, organised as a tree rooted
//! at genesis. Forks are kept, never pruned: a side branch may become the
//! canonical chain later if it outgrows the current one.
//!
//! ## Canonical chain
//!
//! The canonical chain is the longest path from genesis. When several
//! tips share the maximum depth, the one with the lexicographically
//! smallest hash wins, so every miner holding the same set of blocks picks
//! the same tip. The tip is maintained incrementally on insert; since
//! blocks are never removed, comparing a new block against the current tip
//! is enough.
//!
//! ```text
//!   G ── a ── b ── c          depth(c) = 3   ← tip
//!         \
//!          b' ── c'           depth(c') = 3  (loses if hash(c') > hash(c))
//! ```
//!
//! ## Validation on append
//!
//! 1. The cached hash equals the recomputed one.
//! 2. The hash meets the difficulty for the block's kind.
//! 3. The parent is stored. Orphans are rejected, not queued.
//! 4. Up to `back_check_depth` non-genesis ancestors are re-validated.
//!
//! Re-appending a stored block is a successful no-op, which makes flood
//! re-broadcasts harmless.
//!
//! All state sits behind one mutex. Contention is bounded by the block
//! rate, not by client traffic.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MinerConfig;
use crate::crypto::hash::{short_hex, Hash};
use crate::storage::block::{is_valid_proof_of_work, Block};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("invalid block {hash}: {reason}")]
    InvalidBlock { hash: String, reason: String },

    #[error("block {hash} has unknown parent {parent}")]
    UnknownParent { hash: String, parent: String },

    #[error("genesis mismatch: expected {expected}, computed {actual}")]
    GenesisMismatch { expected: String, actual: String },
}

impl ChainError {
    fn invalid(hash: &Hash, reason: impl Into<String>) -> Self {
        Self::InvalidBlock {
            hash: hex::encode(hash),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters & results
// ---------------------------------------------------------------------------

/// Validation parameters. Must match across the network (except the
/// back-check depth, which is a local trust/cost knob).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainParams {
    pub op_difficulty: u8,
    pub noop_difficulty: u8,
    pub back_check_depth: usize,
}

impl ChainParams {
    pub fn from_config(config: &MinerConfig) -> Self {
        Self {
            op_difficulty: config.common.op_difficulty,
            noop_difficulty: config.common.noop_difficulty,
            back_check_depth: config.mining.back_check_depth,
        }
    }
}

/// What `append` did with a valid block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Newly stored. `tip_changed` is true when it became the canonical tip.
    Inserted { tip_changed: bool },
    /// Already stored; nothing changed.
    AlreadyKnown,
}

/// A leaf of the tree and the length of the chain ending there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkTip {
    pub hash: Hash,
    /// Blocks from genesis to this tip, both included.
    pub length: u64,
}

// ---------------------------------------------------------------------------
// BlockTree
// ---------------------------------------------------------------------------

struct TreeInner {
    blocks: HashMap<Hash, Block>,
    children: HashMap<Hash, Vec<Hash>>,
    /// Edges from genesis; genesis itself is 0.
    depths: HashMap<Hash, u64>,
    tip: Hash,
}

impl TreeInner {
    fn depth_of(&self, hash: &Hash) -> u64 {
        self.depths.get(hash).copied().unwrap_or(0)
    }

    /// Ancestor of `from` at `depth`, walking parent links.
    fn ancestor_at(&self, from: &Hash, depth: u64) -> Option<Hash> {
        let mut current = *from;
        let mut current_depth = *self.depths.get(&current)?;
        if depth > current_depth {
            return None;
        }
        while current_depth > depth {
            current = self.blocks.get(&current)?.prev_hash;
            current_depth -= 1;
        }
        Some(current)
    }

    fn is_canonical(&self, hash: &Hash) -> bool {
        match self.depths.get(hash) {
            Some(&d) => self.ancestor_at(&self.tip, d) == Some(*hash),
            None => false,
        }
    }

    /// Canonical blocks strictly after `depth`, oldest first.
    fn canonical_from(&self, depth: u64) -> Vec<Block> {
        let mut out = Vec::new();
        let mut current = self.tip;
        while self.depth_of(&current) > depth {
            let Some(block) = self.blocks.get(&current) else {
                break;
            };
            out.push(block.clone());
            current = block.prev_hash;
        }
        out.reverse();
        out
    }
}

pub struct BlockTree {
    genesis: Block,
    params: ChainParams,
    inner: Mutex<TreeInner>,
}

impl BlockTree {
    /// A tree holding only the genesis block.
    pub fn new(params: ChainParams) -> Self {
        let genesis = Block::genesis();
        let mut blocks = HashMap::new();
        blocks.insert(genesis.hash, genesis.clone());
        let mut depths = HashMap::new();
        depths.insert(genesis.hash, 0);

        Self {
            params,
            inner: Mutex::new(TreeInner {
                blocks,
                children: HashMap::new(),
                depths,
                tip: genesis.hash,
            }),
            genesis,
        }
    }

    /// Rebuild a tree from stored blocks, re-validating each one. Blocks
    /// must be ordered parents-first, as [`BlockTree::blocks`] returns them.
    pub fn from_blocks(params: ChainParams, blocks: Vec<Block>) -> Result<Self, ChainError> {
        let tree = Self::new(params);
        for block in blocks {
            tree.append(block)?;
        }
        Ok(tree)
    }

    pub fn params(&self) -> ChainParams {
        self.params
    }

    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    /// Validate and store `block`.
    pub fn append(&self, block: Block) -> Result<AppendOutcome, ChainError> {
        // Pure checks first, outside the lock.
        let computed = block
            .compute_hash()
            .map_err(|e| ChainError::invalid(&block.hash, e.to_string()))?;
        if computed != block.hash {
            return Err(ChainError::invalid(
                &block.hash,
                format!("stored hash differs from computed {}", hex::encode(computed)),
            ));
        }
        check_shape(&block)?;

        let mut inner = self.inner.lock();
        if inner.blocks.contains_key(&block.hash) {
            return Ok(AppendOutcome::AlreadyKnown);
        }

        self.check_pow(&block)?;

        let Some(parent_depth) = inner.depths.get(&block.prev_hash).copied() else {
            return Err(ChainError::UnknownParent {
                hash: block.hash_hex(),
                parent: block.prev_hash_hex(),
            });
        };

        self.back_check(&inner, &block.prev_hash)?;

        let hash = block.hash;
        let depth = parent_depth + 1;
        let tip_depth = inner.depth_of(&inner.tip);
        let tip_changed = depth > tip_depth || (depth == tip_depth && hash < inner.tip);

        inner.children.entry(block.prev_hash).or_default().push(hash);
        inner.depths.insert(hash, depth);
        inner.blocks.insert(hash, block);
        if tip_changed {
            inner.tip = hash;
        }

        debug!(hash = %short_hex(&hash), depth, tip_changed, "block appended");
        Ok(AppendOutcome::Inserted { tip_changed })
    }

    fn check_pow(&self, block: &Block) -> Result<(), ChainError> {
        let difficulty =
            block.required_difficulty(self.params.op_difficulty, self.params.noop_difficulty);
        if !is_valid_proof_of_work(&block.hash, difficulty) {
            return Err(ChainError::invalid(
                &block.hash,
                format!("hash does not end in {} zero hex digits", difficulty),
            ));
        }
        Ok(())
    }

    fn back_check(&self, inner: &TreeInner, from: &Hash) -> Result<(), ChainError> {
        let mut current = *from;
        for _ in 0..self.params.back_check_depth {
            if current == self.genesis.hash {
                break;
            }
            let Some(ancestor) = inner.blocks.get(&current) else {
                break;
            };
            match ancestor.compute_hash() {
                Ok(h) if h == ancestor.hash => {}
                _ => return Err(ChainError::invalid(&current, "corrupted ancestor")),
            }
            self.check_pow(ancestor)?;
            current = ancestor.prev_hash;
        }
        Ok(())
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.inner.lock().blocks.get(hash).cloned()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.lock().blocks.contains_key(hash)
    }

    /// Tip of the canonical chain.
    pub fn get_last_block(&self) -> Block {
        let inner = self.inner.lock();
        inner
            .blocks
            .get(&inner.tip)
            .cloned()
            .unwrap_or_else(|| self.genesis.clone())
    }

    pub fn tip_hash(&self) -> Hash {
        self.inner.lock().tip
    }

    /// Depth of the canonical tip; 0 when only genesis is known.
    pub fn height(&self) -> u64 {
        let inner = self.inner.lock();
        inner.depth_of(&inner.tip)
    }

    pub fn depth(&self, hash: &Hash) -> Option<u64> {
        self.inner.lock().depths.get(hash).copied()
    }

    /// Number of stored blocks, genesis included. Never zero.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn is_canonical(&self, hash: &Hash) -> bool {
        self.inner.lock().is_canonical(hash)
    }

    /// Genesis through tip.
    pub fn canonical_chain(&self) -> Vec<Block> {
        let inner = self.inner.lock();
        let mut chain = vec![self.genesis.clone()];
        chain.extend(inner.canonical_from(0));
        chain
    }

    /// Canonical blocks after `hash`, oldest first. `None` when `hash` is
    /// not on the canonical chain.
    pub fn chain_after(&self, hash: &Hash) -> Option<Vec<Block>> {
        let inner = self.inner.lock();
        if !inner.is_canonical(hash) {
            return None;
        }
        Some(inner.canonical_from(inner.depth_of(hash)))
    }

    /// Canonical descendants of `hash`. `None` when `hash` is unknown or on
    /// a side branch.
    pub fn confirmations(&self, hash: &Hash) -> Option<u64> {
        let inner = self.inner.lock();
        if !inner.is_canonical(hash) {
            return None;
        }
        Some(inner.depth_of(&inner.tip) - inner.depth_of(hash))
    }

    /// Every leaf with its chain length, longest first, ties by hash. The
    /// first entry is always the canonical tip.
    pub fn forks(&self) -> Vec<ForkTip> {
        let inner = self.inner.lock();
        let mut tips: Vec<ForkTip> = inner
            .blocks
            .keys()
            .filter(|h| !inner.children.contains_key(*h))
            .map(|h| ForkTip {
                hash: *h,
                length: inner.depth_of(h) + 1,
            })
            .collect();
        tips.sort_by(|a, b| b.length.cmp(&a.length).then(a.hash.cmp(&b.hash)));
        tips
    }

    /// All non-genesis blocks, parents before children.
    pub fn blocks(&self) -> Vec<Block> {
        let inner = self.inner.lock();
        let mut blocks: Vec<(u64, &Block)> = inner
            .blocks
            .values()
            .filter(|b| b.hash != self.genesis.hash)
            .map(|b| (inner.depth_of(&b.hash), b))
            .collect();
        blocks.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.hash.cmp(&b.1.hash)));
        blocks.into_iter().map(|(_, b)| b.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// A no-op block carries no ops and an op block carries at least one.
/// Difficulty is chosen by `is_op`, so a no-op block with ops would get
/// filesystem changes in at the cheaper difficulty.
fn check_shape(block: &Block) -> Result<(), ChainError> {
    match (block.is_op, block.ops.is_empty()) {
        (false, false) => Err(ChainError::invalid(
            &block.hash,
            format!("no-op block carries {} ops", block.ops.len()),
        )),
        (true, true) => Err(ChainError::invalid(&block.hash, "op block carries no ops")),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::pow::{mine_blocking, CancelToken};
    use crate::storage::block::OpRecord;

    const PARAMS: ChainParams = ChainParams {
        op_difficulty: 2,
        noop_difficulty: 1,
        back_check_depth: 2,
    };

    fn mine_noop(parent: &Hash, miner: &str) -> Block {
        mine_blocking(Block::noop(*parent, miner), 1, 2, &CancelToken::new()).unwrap()
    }

    fn chain_of(tree: &BlockTree, from: Hash, n: usize, miner: &str) -> Vec<Block> {
        let mut parent = from;
        let mut out = Vec::new();
        for _ in 0..n {
            let b = mine_noop(&parent, miner);
            tree.append(b.clone()).unwrap();
            parent = b.hash;
            out.push(b);
        }
        out
    }

    // -- 1. Fresh tree ----------------------------------------------------

    #[test]
    fn new_tree_tip_is_genesis() {
        let tree = BlockTree::new(PARAMS);
        assert_eq!(tree.get_last_block(), Block::genesis());
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.confirmations(&Block::genesis().hash), Some(0));
    }

    // -- 2. Idempotent append ---------------------------------------------

    #[test]
    fn duplicate_append_is_noop() {
        let tree = BlockTree::new(PARAMS);
        let b = mine_noop(&tree.genesis().hash, "m1");

        assert_eq!(
            tree.append(b.clone()).unwrap(),
            AppendOutcome::Inserted { tip_changed: true }
        );
        let (len, tip) = (tree.len(), tree.get_last_block());

        assert_eq!(tree.append(b).unwrap(), AppendOutcome::AlreadyKnown);
        assert_eq!(tree.len(), len);
        assert_eq!(tree.get_last_block(), tip);
        assert_eq!(tree.append(Block::genesis()).unwrap(), AppendOutcome::AlreadyKnown);
    }

    // -- 3. Rejections ----------------------------------------------------

    #[test]
    fn unknown_parent_rejected_without_mutation() {
        let tree = BlockTree::new(PARAMS);
        let orphan = mine_noop(&[9u8; 32], "m1");

        let err = tree.append(orphan.clone()).unwrap_err();
        assert!(matches!(err, ChainError::UnknownParent { .. }));
        assert_eq!(tree.len(), 1);
        assert!(!tree.contains(&orphan.hash));
    }

    #[test]
    fn out_of_order_delivery_rejected() {
        let source = BlockTree::new(PARAMS);
        let blocks = chain_of(&source, source.genesis().hash, 2, "m1");

        let tree = BlockTree::new(PARAMS);
        assert!(matches!(
            tree.append(blocks[1].clone()),
            Err(ChainError::UnknownParent { .. })
        ));
        tree.append(blocks[0].clone()).unwrap();
        tree.append(blocks[1].clone()).unwrap();
        assert_eq!(tree.height(), 2);
    }

    #[test]
    fn forged_hash_rejected() {
        let tree = BlockTree::new(PARAMS);
        let mut b = mine_noop(&tree.genesis().hash, "m1");
        b.miner_id = "thief".into();
        assert!(matches!(tree.append(b), Err(ChainError::InvalidBlock { .. })));
    }

    #[test]
    fn insufficient_pow_rejected_for_declared_kind() {
        let tree = BlockTree::new(PARAMS);
        // Mined at difficulty 1 but declared as an op block (difficulty 2).
        let mut solved = None;
        for _ in 0..64 {
            let op = OpRecord::create_file("m1", "a");
            let b = mine_blocking(
                Block::op(tree.genesis().hash, "m1", vec![op]),
                1,
                1,
                &CancelToken::new(),
            )
            .unwrap();
            if !is_valid_proof_of_work(&b.hash, 2) {
                solved = Some(b);
                break;
            }
        }
        let b = solved.expect("a difficulty-1 hash that misses difficulty 2");
        assert!(matches!(tree.append(b), Err(ChainError::InvalidBlock { .. })));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn noop_block_carrying_ops_rejected() {
        let tree = BlockTree::new(ChainParams {
            op_difficulty: 4,
            ..PARAMS
        });
        let mut smuggler = Block::noop(tree.genesis().hash, "mallory");
        smuggler.ops = vec![OpRecord::create_file("mallory", "smuggled")];
        let b = mine_blocking(smuggler, 1, 2, &CancelToken::new()).unwrap();

        let err = tree.append(b).unwrap_err();
        match err {
            ChainError::InvalidBlock { reason, .. } => assert!(reason.contains("no-op block")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.tip_hash(), tree.genesis().hash);
    }

    #[test]
    fn op_block_without_ops_rejected() {
        let tree = BlockTree::new(PARAMS);
        let b = mine_blocking(
            Block::op(tree.genesis().hash, "m1", Vec::new()),
            2,
            2,
            &CancelToken::new(),
        )
        .unwrap();
        assert!(matches!(tree.append(b), Err(ChainError::InvalidBlock { .. })));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn back_check_catches_corrupted_ancestor() {
        let tree = BlockTree::new(PARAMS);
        let blocks = chain_of(&tree, tree.genesis().hash, 2, "m1");

        // Corrupt the stored parent in place.
        tree.inner
            .lock()
            .blocks
            .get_mut(&blocks[1].hash)
            .unwrap()
            .miner_id = "corrupt".into();

        let child = mine_noop(&blocks[1].hash, "m1");
        assert!(matches!(tree.append(child), Err(ChainError::InvalidBlock { .. })));
    }

    // -- 4. Canonical chain selection -------------------------------------

    #[test]
    fn longest_fork_wins() {
        let tree = BlockTree::new(PARAMS);
        let g = tree.genesis().hash;
        let short = chain_of(&tree, g, 2, "a");
        let long = chain_of(&tree, g, 3, "b");

        assert_eq!(tree.get_last_block(), long[2]);
        let forks = tree.forks();
        assert_eq!(forks.len(), 2);
        assert_eq!(forks[0], ForkTip { hash: long[2].hash, length: 4 });
        assert_eq!(forks[1], ForkTip { hash: short[1].hash, length: 3 });

        // The tip is reachable from genesis and at least as long as any fork.
        let chain = tree.canonical_chain();
        assert_eq!(chain.first().unwrap().hash, g);
        assert_eq!(chain.last().unwrap().hash, tree.tip_hash());
        for pair in chain.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].hash);
        }
        assert!(forks.iter().all(|f| f.length <= chain.len() as u64));
    }

    #[test]
    fn equal_length_tie_breaks_on_smallest_hash() {
        let g = Block::genesis().hash;
        let x = mine_noop(&g, "x");
        let y = mine_noop(&g, "y");
        let smaller = if x.hash < y.hash { x.hash } else { y.hash };

        for order in [[x.clone(), y.clone()], [y, x]] {
            let tree = BlockTree::new(PARAMS);
            for b in order {
                tree.append(b).unwrap();
            }
            assert_eq!(tree.tip_hash(), smaller);
        }
    }

    #[test]
    fn side_branch_append_reports_unchanged_tip() {
        let tree = BlockTree::new(PARAMS);
        let g = tree.genesis().hash;
        chain_of(&tree, g, 2, "main");
        let side = mine_noop(&g, "side");
        assert_eq!(
            tree.append(side).unwrap(),
            AppendOutcome::Inserted { tip_changed: false }
        );
    }

    // -- 5. Queries -------------------------------------------------------

    #[test]
    fn chain_after_and_confirmations() {
        let tree = BlockTree::new(PARAMS);
        let g = tree.genesis().hash;
        let main = chain_of(&tree, g, 3, "main");
        let side = chain_of(&tree, g, 1, "side");

        let after = tree.chain_after(&main[0].hash).unwrap();
        assert_eq!(after, main[1..].to_vec());
        assert_eq!(tree.chain_after(&main[2].hash).unwrap(), vec![]);
        assert_eq!(tree.chain_after(&side[0].hash), None);

        assert_eq!(tree.confirmations(&main[0].hash), Some(2));
        assert_eq!(tree.confirmations(&main[2].hash), Some(0));
        assert_eq!(tree.confirmations(&side[0].hash), None);
        assert_eq!(tree.confirmations(&[1u8; 32]), None);
    }

    #[test]
    fn blocks_round_trip_through_from_blocks() {
        let tree = BlockTree::new(PARAMS);
        let g = tree.genesis().hash;
        chain_of(&tree, g, 3, "a");
        chain_of(&tree, g, 2, "b");

        let rebuilt = BlockTree::from_blocks(PARAMS, tree.blocks()).unwrap();
        assert_eq!(rebuilt.len(), tree.len());
        assert_eq!(rebuilt.tip_hash(), tree.tip_hash());
        assert_eq!(rebuilt.forks(), tree.forks());
    }
}
