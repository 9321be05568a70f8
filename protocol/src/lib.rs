// Copyright (c) 2026 RFS Chain Contributors. MIT License.
// See LICENSE for details.

//! # rfs-protocol: Core Library
//!
//! A replicated record filesystem whose commit log is a proof-of-work
//! blockchain. Every miner keeps the full block tree, treats the longest
//! branch as the truth, and derives the filesystem and coin balances by
//! replaying it. An operation counts as committed once enough blocks are
//! mined on top of the one that carries it.
//!
//! ## Architecture
//!
//! - **config**: miner configuration and protocol constants.
//! - **crypto**: BLAKE3 hashing helpers and the Merkle root over ops.
//! - **storage**: blocks, the block tree, the derived ledger, snapshots.
//! - **network**: nonce search, staging and mining actors, wire messages.
//!
//! ## Life of an op
//!
//! ```text
//! client op ─▶ staging batch ─▶ sealed ─▶ op block mined ─▶ tree append
//!                                                   │
//!                   flood to peers ◀────────────────┘
//!                   client reply after N confirmations
//! ```

pub mod config;
pub mod crypto;
pub mod network;
pub mod storage;
