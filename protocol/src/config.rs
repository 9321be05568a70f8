//! # Miner Configuration & Constants
//!
//! Every tunable the miner reads lives here: the process-wide constants
//! baked into the binary, and the per-node [`MinerConfig`] loaded from a
//! JSON file at startup.
//!
//! The `common` section of the config must be identical on every miner of
//! a network. Two miners that disagree on a difficulty or a reward will
//! derive different ledgers from the same chain and fork permanently.
//! The genesis hash check at startup catches only the most basic form of
//! that disagreement.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::block::{Block, MAX_DIFFICULTY};

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// The full version string reported by `version` and `/status`.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Chain Parameters
// ---------------------------------------------------------------------------

/// Miner identifiers longer than this are rejected at config load.
pub const MAX_MINER_ID_LEN: usize = 16;

/// A single record payload may not exceed this many bytes.
pub const MAX_RECORD_BYTES: usize = 512;

/// Number of nonce-search workers when the config does not say otherwise.
pub const DEFAULT_MINING_WORKERS: usize = 4;

/// How many ancestors `BlockTree::append` re-validates before accepting
/// a new block.
pub const DEFAULT_BACK_CHECK_DEPTH: usize = 2;

/// How many times an op block may be rebuilt on a moved tip before its
/// waiters are told the batch stalled.
pub const DEFAULT_MAX_PREEMPTIONS: u32 = 16;

/// Upper bound on `extra_nonce` re-seeds after the 32-bit nonce space is
/// exhausted. Reaching it at any sane difficulty means something is broken.
pub const MAX_RESEEDS: u32 = 8;

/// Workers poll their cancel flag once every this many nonces.
pub const CANCEL_CHECK_INTERVAL: u32 = 4096;

// ---------------------------------------------------------------------------
// Channels & Transport
// ---------------------------------------------------------------------------

/// Capacity of the staging actor's request queue.
pub const STAGING_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the mining coordinator's command queue.
pub const MINER_QUEUE_CAPACITY: usize = 256;

/// Largest frame the wire codec accepts. A block of a few hundred 512-byte
/// records fits comfortably; anything bigger is garbage or hostile.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Per-peer deadline for a flood delivery.
pub const PEER_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an accepted connection may take to deliver its request frame.
pub const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Default status/metrics HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 9750;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Failures while loading or validating a [`MinerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Common (network-wide) settings
// ---------------------------------------------------------------------------

/// Settings every miner of a network must agree on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonMinerConfig {
    /// Hex-encoded hash of the genesis block. Startup fails when the local
    /// genesis hashes to anything else.
    pub genesis_block_hash: String,
    /// Batch window, measured from the first accepted op of a batch.
    pub gen_op_block_timeout_ms: u64,
    /// Reward credited to the miner of an op block.
    pub mined_coins_per_op_block: u64,
    /// Reward credited to the miner of a no-op block.
    pub mined_coins_per_noop_block: u64,
    /// Coins debited from the submitting miner for each CreateFile.
    pub cost_per_file_create: u64,
    /// Required trailing zero hex digits for op blocks.
    pub op_difficulty: u8,
    /// Required trailing zero hex digits for no-op blocks.
    pub noop_difficulty: u8,
    /// Descendants required before a CreateFile is reported to the client.
    pub confirmations_per_create: u64,
    /// Descendants required before an AppendRecord is reported to the client.
    pub confirmations_per_append: u64,
}

impl CommonMinerConfig {
    pub fn gen_op_block_timeout(&self) -> Duration {
        Duration::from_millis(self.gen_op_block_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Local tuning
// ---------------------------------------------------------------------------

/// Per-node mining knobs. Safe to differ between miners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningTuning {
    /// Number of nonce-search worker threads.
    pub workers: usize,
    /// Ancestors re-validated on every append.
    pub back_check_depth: usize,
    /// Rebuild bound for an op block under preemption.
    pub max_preemptions: u32,
}

impl Default for MiningTuning {
    fn default() -> Self {
        Self {
            workers: DEFAULT_MINING_WORKERS,
            back_check_depth: DEFAULT_BACK_CHECK_DEPTH,
            max_preemptions: DEFAULT_MAX_PREEMPTIONS,
        }
    }
}

/// Where and how often the block tree is snapshotted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Snapshot file. `None` derives `./logs/data<miner_id>.bin`.
    pub path: Option<PathBuf>,
    /// Periodic snapshot interval. Zero disables periodic snapshots; the
    /// node still snapshots on shutdown and on `StoreAndStop`.
    pub interval_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: None,
            interval_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// MinerConfig
// ---------------------------------------------------------------------------

/// Full configuration of one miner process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerConfig {
    /// Identity credited with rewards and debited for file creation.
    pub miner_id: String,
    /// Peer miners' incoming addresses, `host:port`.
    pub peer_addresses: Vec<String>,
    /// Address peers connect to.
    pub incoming_miners_addr: String,
    /// Address clients connect to.
    pub incoming_clients_addr: String,
    /// Optional status/metrics HTTP address.
    #[serde(default)]
    pub http_addr: Option<String>,
    /// Network-wide parameters.
    pub common: CommonMinerConfig,
    #[serde(default)]
    pub mining: MiningTuning,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

impl MinerConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: MinerConfig =
            serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.miner_id.is_empty() {
            return Err(ConfigError::Invalid("miner_id must not be empty".into()));
        }
        if self.miner_id.len() > MAX_MINER_ID_LEN {
            return Err(ConfigError::Invalid(format!(
                "miner_id {:?} exceeds {} characters",
                self.miner_id, MAX_MINER_ID_LEN
            )));
        }
        for (name, value) in [
            ("op_difficulty", self.common.op_difficulty),
            ("noop_difficulty", self.common.noop_difficulty),
        ] {
            if value as usize > MAX_DIFFICULTY {
                return Err(ConfigError::Invalid(format!(
                    "{} is {}, at most {} is possible",
                    name, value, MAX_DIFFICULTY
                )));
            }
        }
        if self.common.gen_op_block_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "gen_op_block_timeout_ms must be positive".into(),
            ));
        }
        if self.mining.workers == 0 {
            return Err(ConfigError::Invalid("mining.workers must be at least 1".into()));
        }
        if !matches!(hex::decode(&self.common.genesis_block_hash), Ok(b) if b.len() == 32) {
            return Err(ConfigError::Invalid(format!(
                "genesis_block_hash {:?} is not 32 hex-encoded bytes",
                self.common.genesis_block_hash
            )));
        }
        Ok(())
    }

    /// Snapshot location, falling back to `./logs/data<miner_id>.bin`.
    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshot
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("./logs/data{}.bin", self.miner_id)))
    }

    /// A single-node devnet config with cheap difficulties. `init` writes
    /// this to disk; tests start from it.
    pub fn devnet(miner_id: impl Into<String>) -> Self {
        Self {
            miner_id: miner_id.into(),
            peer_addresses: Vec::new(),
            incoming_miners_addr: "127.0.0.1:9740".into(),
            incoming_clients_addr: "127.0.0.1:9741".into(),
            http_addr: Some(format!("127.0.0.1:{}", DEFAULT_HTTP_PORT)),
            common: CommonMinerConfig {
                genesis_block_hash: Block::genesis().hash_hex(),
                gen_op_block_timeout_ms: 2_000,
                mined_coins_per_op_block: 2,
                mined_coins_per_noop_block: 1,
                cost_per_file_create: 1,
                op_difficulty: 3,
                noop_difficulty: 3,
                confirmations_per_create: 2,
                confirmations_per_append: 1,
            },
            mining: MiningTuning::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devnet_config_validates() {
        assert!(MinerConfig::devnet("m1").validate().is_ok());
    }

    #[test]
    fn long_miner_id_rejected() {
        let cfg = MinerConfig::devnet("a-miner-id-that-is-far-too-long");
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn difficulty_above_hash_width_rejected() {
        let mut cfg = MinerConfig::devnet("m1");
        cfg.common.op_difficulty = 65;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn malformed_genesis_hash_rejected() {
        let mut cfg = MinerConfig::devnet("m1");
        cfg.common.genesis_block_hash = "abc".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn optional_sections_default_when_absent() {
        let cfg = MinerConfig::devnet("m1");
        let mut value = serde_json::to_value(&cfg).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("mining");
        obj.remove("snapshot");
        obj.remove("http_addr");

        let parsed: MinerConfig = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.mining, MiningTuning::default());
        assert_eq!(parsed.snapshot, SnapshotConfig::default());
        assert_eq!(parsed.http_addr, None);
    }

    #[test]
    fn missing_common_field_fails_to_parse() {
        let cfg = MinerConfig::devnet("m1");
        let mut value = serde_json::to_value(&cfg).unwrap();
        value["common"]
            .as_object_mut()
            .unwrap()
            .remove("op_difficulty");
        assert!(serde_json::from_value::<MinerConfig>(value).is_err());
    }

    #[test]
    fn load_reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = MinerConfig::devnet("m7");
        std::fs::write(&path, serde_json::to_vec_pretty(&cfg).unwrap()).unwrap();

        let loaded = MinerConfig::load(&path).unwrap();
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.snapshot_path(), PathBuf::from("./logs/datam7.bin"));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = MinerConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
