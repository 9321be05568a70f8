//! # CLI Interface
//!
//! Defines the command-line argument structure for `rfs-miner` using
//! `clap` derive.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// RFS miner.
///
/// Mines a proof-of-work chain that carries a replicated record
/// filesystem, serves client operations, and floods blocks to its peers.
#[derive(Parser, Debug)]
#[command(
    name = "rfs-miner",
    about = "RFS chain miner node",
    version,
    propagate_version = true
)]
pub struct RfsMinerCli {
    /// Log output format: `pretty` or `json`.
    #[arg(long, global = true, env = "RFS_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start mining and serving requests.
    Run(RunArgs),
    /// Write a single-node devnet config file.
    Init(InitArgs),
    /// Print the genesis block hash every config must carry.
    Genesis,
    /// Render a stored snapshot as a Graphviz dot graph.
    Inspect(InspectArgs),
    /// Send one request to a running miner's client port.
    Send(SendArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the miner configuration file (JSON).
    #[arg(long, short = 'c', env = "RFS_CONFIG")]
    pub config: PathBuf,

    /// Snapshot to restore the block tree from before mining starts.
    #[arg(long, env = "RFS_RESTORE")]
    pub restore: Option<PathBuf>,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Miner id to write into the config.
    #[arg(long, default_value = "m1")]
    pub miner_id: String,

    /// Where to write the config.
    #[arg(long, short = 'o', default_value = "miner.json")]
    pub output: PathBuf,

    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for the `inspect` subcommand.
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Snapshot file written by `store` or `StoreAndStop`.
    pub snapshot: PathBuf,

    /// Write the dot graph here instead of stdout.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

/// Arguments for the `send` subcommand.
#[derive(Parser, Debug)]
pub struct SendArgs {
    /// Client address of the miner.
    #[arg(long, env = "RFS_CLIENT_ADDR", default_value = "127.0.0.1:9741")]
    pub addr: String,

    #[command(subcommand)]
    pub request: SendRequest,
}

/// Client requests `send` can issue.
#[derive(Subcommand, Debug)]
pub enum SendRequest {
    /// Create an empty file.
    Create { filename: String },
    /// Append a UTF-8 record to a file.
    Append { filename: String, record: String },
    /// List every file.
    List,
    /// Count the records in a file.
    Total { filename: String },
    /// Read one record.
    Read { filename: String, index: u64 },
    /// Snapshot the tree and stop the miner.
    StoreAndStop,
}
