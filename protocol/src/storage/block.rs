//! # Block Structure
//!
//! A block links to its parent by hash and carries either a batch of
//! filesystem operations (an *op block*) or nothing at all (a *no-op*
//! heartbeat block). Both kinds are mined; they differ only in the
//! difficulty their hash has to meet.
//!
//! ## Block Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  prev_hash: [u8; 32]    (all zeros: genesis) │
//! │  miner_id: String                            │
//! │  nonce: u32             (proof of work)      │
//! │  extra_nonce: u32       (re-seed counter)    │
//! │  is_op: bool                                 │
//! │  ops: Vec<OpRecord>     (empty unless is_op) │
//! │  hash: [u8; 32]         (cached, derived)    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Hash Computation
//!
//! ```text
//! BLAKE3( prev_hash || len(miner_id) u32le || miner_id || is_op u8
//!         || ops_root || extra_nonce u32le || nonce u32le )
//! ```
//!
//! The nonce comes last so a miner can absorb everything before it once
//! and clone the hasher state for each attempt ([`Block::prefix_hasher`]).
//! `ops_root` is a binary Merkle root over the BLAKE3 hash of each op's
//! JSON encoding; an empty op list has the all-zero root.
//!
//! ## Proof of Work
//!
//! A hash meets difficulty `d` when its last `d` hex digits are `0`.
//! Trailing, not leading: see [`is_valid_proof_of_work`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::hash::{blake3_hash, merkle_root, Hash, HASH_HEX_LEN};

/// Highest meaningful difficulty: every hex digit of the hash is zero.
pub const MAX_DIFFICULTY: usize = HASH_HEX_LEN;

/// Miner id baked into the genesis block.
pub const GENESIS_MINER_ID: &str = "0";

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("failed to serialize op for hashing: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// OpRecord
// ---------------------------------------------------------------------------

/// The two mutations a client can request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    CreateFile,
    AppendRecord,
}

/// One client operation. Created by the miner that received the request,
/// never mutated afterwards, and committed inside exactly one block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpRecord {
    pub uuid: Uuid,
    /// Miner that accepted the op. CreateFile debits this miner's balance.
    pub miner_id: String,
    /// Unix milliseconds at creation.
    pub timestamp: i64,
    pub op_type: OpType,
    pub filename: String,
    /// Record bytes for AppendRecord; empty for CreateFile.
    pub payload: Vec<u8>,
}

impl OpRecord {
    fn new(op_type: OpType, miner_id: &str, filename: &str, payload: Vec<u8>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            miner_id: miner_id.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            op_type,
            filename: filename.to_string(),
            payload,
        }
    }

    pub fn create_file(miner_id: &str, filename: &str) -> Self {
        Self::new(OpType::CreateFile, miner_id, filename, Vec::new())
    }

    pub fn append_record(miner_id: &str, filename: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(OpType::AppendRecord, miner_id, filename, payload.into())
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A mined (or about-to-be-mined) block.
///
/// Constructed with `nonce = 0` and a zero `hash`, filled in by the nonce
/// search through [`Block::seal`], immutable afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Hash of the parent. All zeros only for genesis.
    pub prev_hash: Hash,
    pub miner_id: String,
    pub nonce: u32,
    /// Bumped when a search exhausts the nonce space, giving the miner a
    /// fresh preimage. Zero for almost every block.
    pub extra_nonce: u32,
    pub is_op: bool,
    pub ops: Vec<OpRecord>,
    /// Cached content hash. Never trusted on ingestion; always recomputed.
    pub hash: Hash,
}

impl Block {
    /// The agreed root of every chain: no parent, miner `"0"`, no ops,
    /// nonce 0. It is not mined, so its hash carries no proof of work.
    pub fn genesis() -> Self {
        let mut block = Self::unsealed([0u8; 32], GENESIS_MINER_ID, false, Vec::new());
        // No ops, so the root is the empty-set sentinel and nothing can fail.
        block.hash = block.hash_from_root(&[0u8; 32], 0);
        block
    }

    /// Candidate heartbeat block on top of `parent`.
    pub fn noop(parent: Hash, miner_id: &str) -> Self {
        Self::unsealed(parent, miner_id, false, Vec::new())
    }

    /// Candidate op block carrying `ops` on top of `parent`.
    pub fn op(parent: Hash, miner_id: &str, ops: Vec<OpRecord>) -> Self {
        Self::unsealed(parent, miner_id, true, ops)
    }

    fn unsealed(prev_hash: Hash, miner_id: &str, is_op: bool, ops: Vec<OpRecord>) -> Self {
        Self {
            prev_hash,
            miner_id: miner_id.to_string(),
            nonce: 0,
            extra_nonce: 0,
            is_op,
            ops,
            hash: [0u8; 32],
        }
    }

    /// Hasher with everything except the nonce absorbed.
    pub fn prefix_hasher(&self) -> Result<blake3::Hasher, BlockError> {
        let root = ops_root(&self.ops)?;
        Ok(self.prefix_from_root(&root))
    }

    fn prefix_from_root(&self, ops_root: &Hash) -> blake3::Hasher {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.prev_hash);
        hasher.update(&(self.miner_id.len() as u32).to_le_bytes());
        hasher.update(self.miner_id.as_bytes());
        hasher.update(&[self.is_op as u8]);
        hasher.update(ops_root);
        hasher.update(&self.extra_nonce.to_le_bytes());
        hasher
    }

    fn hash_from_root(&self, ops_root: &Hash, nonce: u32) -> Hash {
        hash_with_nonce(&self.prefix_from_root(ops_root), nonce)
    }

    /// Recompute the content hash from every field except `hash`.
    pub fn compute_hash(&self) -> Result<Hash, BlockError> {
        let root = ops_root(&self.ops)?;
        Ok(self.hash_from_root(&root, self.nonce))
    }

    /// Freeze the block with a found nonce and its hash.
    pub fn seal(mut self, nonce: u32, hash: Hash) -> Self {
        self.nonce = nonce;
        self.hash = hash;
        self
    }

    /// Difficulty this block's hash must meet given the network settings.
    /// Ops that take effect when the block is replayed. Always empty for a
    /// no-op block, whatever it carries.
    pub fn effective_ops(&self) -> &[OpRecord] {
        if self.is_op {
            &self.ops
        } else {
            &[]
        }
    }

    pub fn required_difficulty(&self, op_difficulty: u8, noop_difficulty: u8) -> u8 {
        if self.is_op {
            op_difficulty
        } else {
            noop_difficulty
        }
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn prev_hash_hex(&self) -> String {
        hex::encode(self.prev_hash)
    }
}

// ---------------------------------------------------------------------------
// Hash Computation
// ---------------------------------------------------------------------------

/// Finish a prefix hasher with `nonce`. The hot loop of the nonce search.
pub fn hash_with_nonce(prefix: &blake3::Hasher, nonce: u32) -> Hash {
    let mut hasher = prefix.clone();
    hasher.update(&nonce.to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// Merkle root over the BLAKE3 hashes of each op's JSON encoding.
pub fn ops_root(ops: &[OpRecord]) -> Result<Hash, BlockError> {
    let leaves = ops
        .iter()
        .map(|op| serde_json::to_vec(op).map(|bytes| blake3_hash(&bytes)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(merkle_root(&leaves))
}

// ---------------------------------------------------------------------------
// Proof of Work
// ---------------------------------------------------------------------------

/// True iff the last `difficulty` hex digits of `hash` are all `'0'`.
///
/// Hex encoding writes the high nibble of each byte first, so the final
/// hex digit is the low nibble of the final byte. Difficulty 0 always
/// passes; anything above 64 can never pass.
pub fn is_valid_proof_of_work(hash: &Hash, difficulty: u8) -> bool {
    let difficulty = difficulty as usize;
    if difficulty > MAX_DIFFICULTY {
        return false;
    }
    (0..difficulty).all(|i| {
        let byte = hash[hash.len() - 1 - i / 2];
        let nibble = if i % 2 == 0 { byte & 0x0f } else { byte >> 4 };
        nibble == 0
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Brute-force a nonce for tiny difficulties.
    fn solve(block: Block, difficulty: u8) -> Block {
        let prefix = block.prefix_hasher().unwrap();
        let (nonce, hash) = (0..=u32::MAX)
            .map(|n| (n, hash_with_nonce(&prefix, n)))
            .find(|(_, h)| is_valid_proof_of_work(h, difficulty))
            .unwrap();
        block.seal(nonce, hash)
    }

    #[test]
    fn genesis_block_properties() {
        let genesis = Block::genesis();
        assert_eq!(genesis.prev_hash, [0u8; 32]);
        assert_eq!(genesis.miner_id, "0");
        assert_eq!(genesis.nonce, 0);
        assert!(!genesis.is_op);
        assert!(genesis.ops.is_empty());
        assert_eq!(genesis.compute_hash().unwrap(), genesis.hash);
    }

    #[test]
    fn genesis_hash_is_deterministic() {
        assert_eq!(Block::genesis().hash, Block::genesis().hash);
    }

    #[test]
    fn pow_matches_trailing_hex_digits() {
        // Sweep real hashes and every difficulty, comparing against the
        // textual definition on the hex string.
        for i in 0u32..256 {
            let hash = blake3_hash(&i.to_le_bytes());
            let encoded = hex::encode(hash);
            for d in 0..=MAX_DIFFICULTY as u8 {
                let expected = encoded[encoded.len() - d as usize..]
                    .chars()
                    .all(|c| c == '0');
                assert_eq!(is_valid_proof_of_work(&hash, d), expected, "{encoded} d={d}");
            }
        }
    }

    #[test]
    fn pow_trailing_not_leading() {
        let mut leading = [0xffu8; 32];
        leading[0] = 0x00;
        assert!(!is_valid_proof_of_work(&leading, 1));

        let mut trailing = [0xffu8; 32];
        trailing[31] = 0xf0;
        assert!(is_valid_proof_of_work(&trailing, 1));
        assert!(!is_valid_proof_of_work(&trailing, 2));
    }

    #[test]
    fn pow_difficulty_edges() {
        assert!(is_valid_proof_of_work(&[0xab; 32], 0));
        assert!(is_valid_proof_of_work(&[0u8; 32], 64));
        assert!(!is_valid_proof_of_work(&[0u8; 32], 65));
    }

    #[test]
    fn prefix_hasher_agrees_with_compute_hash() {
        let ops = vec![
            OpRecord::create_file("m1", "a.txt"),
            OpRecord::append_record("m1", "a.txt", b"hello".to_vec()),
        ];
        let block = Block::op(Block::genesis().hash, "m1", ops).seal(42, [0u8; 32]);
        let prefix = block.prefix_hasher().unwrap();
        assert_eq!(hash_with_nonce(&prefix, 42), block.compute_hash().unwrap());
    }

    #[test]
    fn solved_block_meets_its_difficulty() {
        let block = solve(Block::noop(Block::genesis().hash, "m1"), 2);
        assert_eq!(block.compute_hash().unwrap(), block.hash);
        assert!(is_valid_proof_of_work(&block.hash, 2));
    }

    #[test]
    fn every_field_feeds_the_hash() {
        let parent = Block::genesis().hash;
        let base = Block::noop(parent, "m1");
        let h = base.compute_hash().unwrap();

        let mut other_miner = base.clone();
        other_miner.miner_id = "m2".into();
        let mut other_nonce = base.clone();
        other_nonce.nonce = 1;
        let mut reseeded = base.clone();
        reseeded.extra_nonce = 1;
        let mut flagged = base.clone();
        flagged.is_op = true;
        let mut with_op = base.clone();
        with_op.ops.push(OpRecord::create_file("m1", "f"));

        for variant in [other_miner, other_nonce, reseeded, flagged, with_op] {
            assert_ne!(variant.compute_hash().unwrap(), h);
        }
    }

    #[test]
    fn cached_hash_is_not_part_of_preimage() {
        let block = Block::noop(Block::genesis().hash, "m1");
        let tampered = block.clone().seal(0, [7u8; 32]);
        assert_eq!(block.compute_hash().unwrap(), tampered.compute_hash().unwrap());
    }

    #[test]
    fn required_difficulty_follows_block_kind() {
        let parent = Block::genesis().hash;
        assert_eq!(Block::noop(parent, "m").required_difficulty(5, 2), 2);
        assert_eq!(Block::op(parent, "m", vec![]).required_difficulty(5, 2), 5);
    }
}
