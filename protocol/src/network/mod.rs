//! # Network Module
//!
//! Everything that turns a block tree into a running miner: the nonce
//! search, the two actors that feed it, and the message layer peers and
//! clients talk through.
//!
//! ## Architecture
//!
//! ```text
//! pow.rs       parallel, cancellable nonce search
//! staging.rs   StagingCoordinator: batches client ops against a snapshot
//! miner.rs     MiningCoordinator: no-op vs op mining, preemption
//! flood.rs     pushes accepted blocks to every other peer
//! rpc.rs       request / response messages
//! wire.rs      length-prefixed JSON frames
//! node.rs      MinerNode: wires it all up and serves requests
//! ```
//!
//! ## Design Decisions
//!
//! - Both coordinators are owned actors fed by `mpsc` queues. State that
//!   other tasks need to observe (mining state, canonical tip) is published
//!   on `watch` channels rather than shared behind a lock.
//! - The nonce search runs on the blocking pool with scoped threads, so a
//!   cancelled search can never leak a result into a later round.
//! - The protocol crate stays transport-agnostic apart from the TCP peer
//!   client; listeners live in the node binary.

pub mod flood;
pub mod miner;
pub mod node;
pub mod pow;
pub mod rpc;
pub mod staging;
pub mod wire;

pub use flood::{FloodReport, Flooder, PeerClient, TcpPeerClient, TransportError};
pub use miner::{FloodRequest, MinerHandle, MiningCoordinator, MiningError, MiningState};
pub use node::{run_flooder, MinerNode, NodeError, NodeRuntime, NodeStatus};
pub use pow::{CancelToken, NoncePool, PowError};
pub use rpc::{Envelope, Request, Response};
pub use staging::{BatchSink, BlockReady, SealedBatch, StagingCoordinator, StagingError, StagingHandle};
pub use wire::WireError;
