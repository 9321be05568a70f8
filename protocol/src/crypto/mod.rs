//! # Cryptographic Primitives
//!
//! Blocks are not signed, so the only primitive the chain needs is a hash.
//! Everything here wraps the `blake3` crate.

pub mod hash;

pub use hash::{blake3_hash, blake3_hash_multi, merkle_root, parse_hash, short_hex, Hash};
