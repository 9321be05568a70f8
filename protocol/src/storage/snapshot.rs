//! # Tree Snapshots
//!
//! The chain is kept in memory. Durability is a whole-tree snapshot written
//! periodically, on shutdown and on `StoreAndStop`; a miner restarted from
//! a snapshot replays it through [`BlockTree::append`], so a tampered file
//! is rejected block by block rather than trusted.
//!
//! Snapshots are bincode-encoded and written to a uniquely named temporary
//! sibling first, then renamed over the target. A crash mid-write leaves
//! the previous snapshot intact, and concurrent writers never share a
//! temporary file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::crypto::hash::Hash;
use crate::storage::block::Block;
use crate::storage::tree::{BlockTree, ChainError, ChainParams};

/// Bumped whenever the encoded layout changes.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode snapshot {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// On-disk form of a [`BlockTree`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub version: u32,
    pub genesis_hash: Hash,
    /// Unix milliseconds when the snapshot was taken.
    pub taken_at: i64,
    /// Every non-genesis block, parents first.
    pub blocks: Vec<Block>,
}

impl TreeSnapshot {
    pub fn capture(tree: &BlockTree) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            genesis_hash: tree.genesis().hash,
            taken_at: chrono::Utc::now().timestamp_millis(),
            blocks: tree.blocks(),
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write every block in `tree` to `path`. Returns the number of blocks.
pub fn store(tree: &BlockTree, path: &Path) -> Result<usize, SnapshotError> {
    let snapshot = TreeSnapshot::capture(tree);
    let bytes = bincode::serialize(&snapshot).map_err(SnapshotError::Encode)?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(io_err(dir))?;
    }
    let tmp = temp_sibling(path);
    if let Err(e) = std::fs::write(&tmp, &bytes) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(&tmp)(e));
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path)(e));
    }

    info!(
        path = %path.display(),
        blocks = snapshot.blocks.len(),
        bytes = bytes.len(),
        "snapshot stored"
    );
    Ok(snapshot.blocks.len())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".into());
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
}

/// Read a snapshot without validating its blocks.
pub fn load(path: &Path) -> Result<TreeSnapshot, SnapshotError> {
    let bytes = std::fs::read(path).map_err(io_err(path))?;
    let snapshot: TreeSnapshot =
        bincode::deserialize(&bytes).map_err(|source| SnapshotError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(snapshot.version));
    }
    Ok(snapshot)
}

/// Rebuild a validated tree from `path`.
pub fn restore(path: &Path, params: ChainParams) -> Result<BlockTree, SnapshotError> {
    let snapshot = load(path)?;
    let genesis = Block::genesis();
    if snapshot.genesis_hash != genesis.hash {
        return Err(ChainError::GenesisMismatch {
            expected: genesis.hash_hex(),
            actual: hex::encode(snapshot.genesis_hash),
        }
        .into());
    }
    let tree = BlockTree::from_blocks(params, snapshot.blocks)?;
    info!(path = %path.display(), blocks = tree.len(), height = tree.height(), "snapshot restored");
    Ok(tree)
}
