//! # Storage Module
//!
//! The chain and everything derived from it.
//!
//! ```text
//! block.rs        Block / OpRecord, content hash, proof-of-work rule
//! tree.rs         BlockTree: all forks, canonical tip, append validation
//! filesystem.rs   the replicated record filesystem
//! state.rs        bank + filesystem derived by replaying the chain
//! snapshot.rs     bincode snapshots of the whole tree
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! Block ──append──▶ BlockTree ──canonical chain──▶ Ledger (bank + fs)
//!                       │
//!                       └──snapshot──▶ data<miner>.bin
//! ```

pub mod block;
pub mod filesystem;
pub mod snapshot;
pub mod state;
pub mod tree;

pub use block::{is_valid_proof_of_work, Block, BlockError, OpRecord, OpType};
pub use filesystem::{FileSystem, FsError};
pub use snapshot::{SnapshotError, TreeSnapshot};
pub use state::{Bank, Economics, Ledger, LedgerState, OpEffect, OpRejected};
pub use tree::{AppendOutcome, BlockTree, ChainError, ChainParams, ForkTip};
