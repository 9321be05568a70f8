//! # Hashing Utilities
//!
//! BLAKE3 is the only hash function in the chain. It hashes block
//! preimages, op leaves and the op Merkle root. Nonce search keeps a
//! partially-fed [`blake3::Hasher`] around and clones it per nonce, so the
//! block prefix is absorbed once per search rather than once per attempt.

use std::fmt;

/// A 32-byte BLAKE3 digest.
pub type Hash = [u8; 32];

/// Hex characters in an encoded [`Hash`].
pub const HASH_HEX_LEN: usize = 64;

/// Compute the BLAKE3 hash of `data`.
///
/// ```
/// use rfs_protocol::crypto::blake3_hash;
///
/// let hash = blake3_hash(b"rfs");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn blake3_hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Hash several slices as if they were concatenated, without the buffer.
pub fn blake3_hash_multi(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Binary Merkle root over leaf hashes.
///
/// Odd levels pair the last node with itself. A single leaf is also paired
/// with itself, so the root is always the output of a hash. The empty set
/// has the all-zero root.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return [0u8; 32];
    }

    let mut level: Vec<Hash> = leaves.to_vec();
    if level.len() == 1 {
        return blake3_hash_multi(&[&level[0], &level[0]]);
    }

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                blake3_hash_multi(&[&pair[0], right])
            })
            .collect();
    }

    level[0]
}

/// Error returned by [`parse_hash`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseHashError(pub String);

impl fmt::Display for ParseHashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not a 64-character hex hash: {:?}", self.0)
    }
}

impl std::error::Error for ParseHashError {}

/// Parse a hex-encoded block hash.
pub fn parse_hash(s: &str) -> Result<Hash, ParseHashError> {
    let bytes = hex::decode(s).map_err(|_| ParseHashError(s.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| ParseHashError(s.to_string()))
}

/// Short form used in logs: the first 12 hex characters.
pub fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_deterministic() {
        assert_eq!(blake3_hash(b"rfs"), blake3_hash(b"rfs"));
        assert_ne!(blake3_hash(b"rfs"), blake3_hash(b"Rfs"));
    }

    #[test]
    fn multi_matches_concatenation() {
        let multi = blake3_hash_multi(&[b"hello", b" world"]);
        assert_eq!(multi, blake3_hash(b"hello world"));
    }

    #[test]
    fn merkle_root_empty_is_zero() {
        assert_eq!(merkle_root(&[]), [0u8; 32]);
    }

    #[test]
    fn merkle_root_single_leaf_pairs_with_itself() {
        let leaf = blake3_hash(b"only");
        assert_eq!(merkle_root(&[leaf]), blake3_hash_multi(&[&leaf, &leaf]));
    }

    #[test]
    fn merkle_root_odd_level_duplicates_last() {
        let a = blake3_hash(b"a");
        let b = blake3_hash(b"b");
        let c = blake3_hash(b"c");
        let ab = blake3_hash_multi(&[&a, &b]);
        let cc = blake3_hash_multi(&[&c, &c]);
        assert_eq!(merkle_root(&[a, b, c]), blake3_hash_multi(&[&ab, &cc]));
    }

    #[test]
    fn merkle_root_order_matters() {
        let a = blake3_hash(b"first");
        let b = blake3_hash(b"second");
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }

    #[test]
    fn parse_hash_accepts_encoded_digest() {
        let h = blake3_hash(b"x");
        assert_eq!(parse_hash(&hex::encode(h)), Ok(h));
        assert_eq!(short_hex(&h).len(), 12);
    }

    #[test]
    fn parse_hash_rejects_wrong_length_and_garbage() {
        assert!(parse_hash("abcd").is_err());
        assert!(parse_hash(&"zz".repeat(32)).is_err());
    }
}
