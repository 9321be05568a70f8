//! # Parallel Nonce Search
//!
//! Proof of work is embarrassingly parallel: the 32-bit nonce space is cut
//! into equal contiguous partitions, one per worker thread of a
//! [`NoncePool`], and the first partition to yield a hash with enough
//! trailing zero digits wins.
//!
//! ```text
//!   nonce space  0 ─────────────────────────────────────── u32::MAX
//!                ├── worker 0 ──┼── worker 1 ──┼── ... ──┼── worker n ──┤
//!                        │             │                        │
//!                        └──── find_map_any: first hit wins ────┘
//!                                       │
//!                          found flag set, everyone else exits
//! ```
//!
//! Workers poll two flags every [`CANCEL_CHECK_INTERVAL`] nonces: the
//! search-local found flag and the caller's [`CancelToken`] (the result is
//! no longer wanted, e.g. the tip moved). `install` does not return until
//! every partition has stopped, so a late result can never leak into a
//! later search.
//!
//! If every partition is exhausted the block is re-seeded by bumping
//! `extra_nonce` and searched again, up to [`MAX_RESEEDS`] times.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::{CANCEL_CHECK_INTERVAL, MAX_RESEEDS};
use crate::crypto::hash::{short_hex, Hash};
use crate::storage::block::{hash_with_nonce, is_valid_proof_of_work, Block, BlockError};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PowError {
    #[error("nonce search cancelled")]
    Cancelled,

    #[error("nonce space exhausted (extra_nonce={extra_nonce})")]
    NonceSpaceExhausted { extra_nonce: u32 },

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error("nonce search worker failed: {0}")]
    Worker(String),

    #[error("failed to build nonce search pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

// ---------------------------------------------------------------------------
// CancelToken
// ---------------------------------------------------------------------------

/// Shared "stop searching" flag. Cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Partitioning
// ---------------------------------------------------------------------------

/// Split the full `u32` nonce space into `workers` contiguous ranges.
/// The last range absorbs the remainder.
pub fn nonce_partitions(workers: usize) -> Vec<RangeInclusive<u32>> {
    let workers = workers.max(1) as u64;
    let total = u32::MAX as u64 + 1;
    let chunk = total / workers;
    (0..workers)
        .map(|i| {
            let start = i * chunk;
            let end = if i == workers - 1 {
                u32::MAX as u64
            } else {
                (i + 1) * chunk - 1
            };
            start as u32..=end as u32
        })
        .collect()
}

// ---------------------------------------------------------------------------
// NoncePool
// ---------------------------------------------------------------------------

/// A fixed-size rayon pool dedicated to nonce search. Built once per
/// miner and shared by every round, so mining never competes with the
/// global rayon pool.
pub struct NoncePool {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl NoncePool {
    pub fn new(workers: usize) -> Result<Self, PowError> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("rfs-pow-{i}"))
            .build()?;
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Search one preimage (fixed `extra_nonce`) across the full nonce space.
    pub fn search(
        &self,
        block: &Block,
        difficulty: u8,
        cancel: &CancelToken,
    ) -> Result<(u32, Hash), PowError> {
        self.search_in(block, difficulty, nonce_partitions(self.workers), cancel)
    }

    pub(crate) fn search_in(
        &self,
        block: &Block,
        difficulty: u8,
        partitions: Vec<RangeInclusive<u32>>,
        cancel: &CancelToken,
    ) -> Result<(u32, Hash), PowError> {
        let prefix = block.prefix_hasher()?;
        let found = AtomicBool::new(false);

        let solution = self.pool.install(|| {
            partitions.into_par_iter().find_map_any(|range| {
                for nonce in range {
                    if nonce % CANCEL_CHECK_INTERVAL == 0
                        && (found.load(Ordering::Relaxed) || cancel.is_cancelled())
                    {
                        return None;
                    }
                    let hash = hash_with_nonce(&prefix, nonce);
                    if is_valid_proof_of_work(&hash, difficulty) {
                        found.store(true, Ordering::Release);
                        return Some((nonce, hash));
                    }
                }
                None
            })
        });

        match solution {
            Some(solution) => Ok(solution),
            None if cancel.is_cancelled() => Err(PowError::Cancelled),
            None => Err(PowError::NonceSpaceExhausted {
                extra_nonce: block.extra_nonce,
            }),
        }
    }

    /// Mine `block` to `difficulty`, re-seeding on exhaustion. Blocks the
    /// calling thread; async callers go through [`mine`].
    pub fn mine(
        &self,
        block: Block,
        difficulty: u8,
        cancel: &CancelToken,
    ) -> Result<Block, PowError> {
        let workers = self.workers;
        self.mine_in(block, difficulty, || nonce_partitions(workers), cancel)
    }

    pub(crate) fn mine_in(
        &self,
        mut block: Block,
        difficulty: u8,
        partitions: impl Fn() -> Vec<RangeInclusive<u32>>,
        cancel: &CancelToken,
    ) -> Result<Block, PowError> {
        let mut reseeds = 0;
        loop {
            match self.search_in(&block, difficulty, partitions(), cancel) {
                Ok((nonce, hash)) => {
                    debug!(
                        hash = %short_hex(&hash),
                        nonce,
                        extra_nonce = block.extra_nonce,
                        is_op = block.is_op,
                        "nonce found"
                    );
                    return Ok(block.seal(nonce, hash));
                }
                Err(PowError::NonceSpaceExhausted { extra_nonce }) if reseeds < MAX_RESEEDS => {
                    warn!(extra_nonce, difficulty, "nonce space exhausted, re-seeding");
                    reseeds += 1;
                    block.extra_nonce = extra_nonce.wrapping_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Park a job on the pool. Lets tests hold every worker busy.
    #[cfg(test)]
    pub(crate) fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        self.pool.spawn(job);
    }
}

/// One-off search on a temporary pool of `workers` threads.
pub fn search(
    block: &Block,
    difficulty: u8,
    workers: usize,
    cancel: &CancelToken,
) -> Result<(u32, Hash), PowError> {
    NoncePool::new(workers)?.search(block, difficulty, cancel)
}

/// One-off [`NoncePool::mine`] on a temporary pool of `workers` threads.
pub fn mine_blocking(
    block: Block,
    difficulty: u8,
    workers: usize,
    cancel: &CancelToken,
) -> Result<Block, PowError> {
    NoncePool::new(workers)?.mine(block, difficulty, cancel)
}

/// Async front for [`NoncePool::mine`]. The calling task parks on the
/// blocking pool while the rayon workers search, so the runtime's worker
/// threads stay free.
pub async fn mine(
    pool: Arc<NoncePool>,
    block: Block,
    difficulty: u8,
    cancel: CancelToken,
) -> Result<Block, PowError> {
    tokio::task::spawn_blocking(move || pool.mine(block, difficulty, &cancel))
        .await
        .map_err(|e| PowError::Worker(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn candidate() -> Block {
        Block::noop(Block::genesis().hash, "m1")
    }

    #[test]
    fn partitions_cover_nonce_space_contiguously() {
        for workers in [1, 3, 4, 7] {
            let parts = nonce_partitions(workers);
            assert_eq!(parts.len(), workers);
            assert_eq!(*parts[0].start(), 0);
            assert_eq!(*parts.last().unwrap().end(), u32::MAX);
            for pair in parts.windows(2) {
                assert_eq!(*pair[0].end() as u64 + 1, *pair[1].start() as u64);
            }
        }
    }

    #[test]
    fn zero_workers_means_one() {
        assert_eq!(nonce_partitions(0), vec![0..=u32::MAX]);
    }

    #[test]
    fn found_nonce_satisfies_difficulty() {
        let block = candidate();
        let (nonce, hash) = search(&block, 2, 4, &CancelToken::new()).unwrap();
        let sealed = block.seal(nonce, hash);
        assert_eq!(sealed.compute_hash().unwrap(), hash);
        assert!(is_valid_proof_of_work(&hash, 2));
    }

    #[test]
    fn exhausted_range_is_reported() {
        let pool = NoncePool::new(2).unwrap();
        let err = pool
            .search_in(&candidate(), 64, vec![0..=200, 201..=400], &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, PowError::NonceSpaceExhausted { extra_nonce: 0 }));
    }

    #[test]
    fn reseeds_are_bounded() {
        let pool = NoncePool::new(1).unwrap();
        let err = pool
            .mine_in(candidate(), 16, || vec![0..=15], &CancelToken::new())
            .unwrap_err();
        match err {
            PowError::NonceSpaceExhausted { extra_nonce } => assert_eq!(extra_nonce, MAX_RESEEDS),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn precancelled_search_returns_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = search(&candidate(), 64, 2, &cancel).unwrap_err();
        assert!(matches!(err, PowError::Cancelled));
    }

    #[test]
    fn cancel_stops_running_workers() {
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        let started = Instant::now();
        let err = mine_blocking(candidate(), 64, 2, &cancel).unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, PowError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn async_mine_returns_sealed_block() {
        let pool = Arc::new(NoncePool::new(2).unwrap());
        let block = mine(pool, candidate(), 1, CancelToken::new()).await.unwrap();
        assert!(is_valid_proof_of_work(&block.hash, 1));
        assert_eq!(block.compute_hash().unwrap(), block.hash);
    }
}
