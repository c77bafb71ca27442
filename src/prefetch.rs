//! Prefetcher (component 4.E): forward-only block lookahead from the
//! daemon, bounded by bytes in flight rather than block count, so it
//! adapts automatically to wildly different block sizes across a chain's
//! history.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{info, warn};

use crate::coin::Coin;
use crate::daemon::Daemon;
use crate::error::DaemonError;
use crate::metrics::PREFETCH_CACHE_BYTES;
use crate::telemetry::ProgressCounter;
use crate::types::WorkItem;

/// Ceiling on blocks requested in a single prefetch batch, independent of
/// the byte budget — keeps one daemon round trip from requesting an
/// unbounded number of hashes on a chain with tiny blocks.
const MAX_BATCH_BLOCKS: u32 = 500;

/// How long the main loop sleeps after finding nothing left to fetch, or
/// after a daemon error, before trying again.
const IDLE_SLEEP: Duration = Duration::from_secs(5);

/// Blocks assumed per batch when seeding `ave_size` before any real average
/// is available, so the very first fetch requests a reasonably sized batch
/// instead of one block at a time.
const SEED_BATCH_BLOCKS: u64 = 10;

struct Inner {
    /// Height of the last block handed to the dispatcher. Uses the same
    /// `u32::MAX` "nothing fetched yet" sentinel as `ChainState::fresh`.
    fetched_height: u32,
    cache_size: u64,
    ave_size: u64,
    /// Set the first time a fetch attempt finds nothing new; gates the
    /// one-shot `PrefetcherCaughtUp` notification.
    caught_up: bool,
}

enum PrefetchOutcome {
    Idle,
    CacheFull,
}

/// Forward block lookahead, bounded by `min_cache_size_bytes` of raw block
/// data awaiting processing. All field access is serialized through
/// `inner`, including across the daemon RPC awaits in `prefetch_blocks`, so
/// `reset_height` (the reorg path) never races a fetch in progress.
pub struct Prefetcher {
    daemon: Arc<dyn Daemon>,
    coin: Arc<dyn Coin>,
    min_cache_size_bytes: u64,
    work_tx: mpsc::Sender<WorkItem>,
    refill: Notify,
    inner: Mutex<Inner>,
    progress: ProgressCounter,
}

impl Prefetcher {
    pub fn new(
        daemon: Arc<dyn Daemon>,
        coin: Arc<dyn Coin>,
        min_cache_size_bytes: u64,
        work_tx: mpsc::Sender<WorkItem>,
        start_height: u32,
    ) -> Self {
        let prefetcher = Self {
            daemon,
            coin,
            min_cache_size_bytes,
            work_tx,
            refill: Notify::new(),
            inner: Mutex::new(Inner {
                fetched_height: start_height,
                cache_size: 0,
                ave_size: (min_cache_size_bytes / SEED_BATCH_BLOCKS).max(1),
                caught_up: false,
            }),
            progress: ProgressCounter::new(20),
        };
        prefetcher.refill.notify_one();
        prefetcher
    }

    /// The main loop (§4.E): wait for a refill signal, attempt a fetch
    /// pass, sleep on idle or daemon error, repeat. Runs until the process
    /// shuts down; the caller spawns this as its own task.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.refill.notified().await;
            match self.prefetch_blocks().await {
                Ok(PrefetchOutcome::CacheFull) => {}
                Ok(PrefetchOutcome::Idle) => {
                    tokio::time::sleep(IDLE_SLEEP).await;
                    self.refill.notify_one();
                }
                Err(err) => {
                    warn!(error = %err, "prefetcher daemon error, retrying");
                    tokio::time::sleep(IDLE_SLEEP).await;
                    self.refill.notify_one();
                }
            }
        }
    }

    async fn prefetch_blocks(&self) -> Result<PrefetchOutcome, DaemonError> {
        loop {
            let mut inner = self.inner.lock().await;
            if inner.cache_size >= self.min_cache_size_bytes {
                return Ok(PrefetchOutcome::CacheFull);
            }

            let daemon_height = self.daemon.cached_height().await;
            let remaining = daemon_height.wrapping_sub(inner.fetched_height) as u64;
            let by_budget = self.min_cache_size_bytes / inner.ave_size.max(1);
            let count = remaining.min(by_budget).min(MAX_BATCH_BLOCKS as u64) as u32;

            if count == 0 {
                let first_time = !inner.caught_up;
                inner.caught_up = true;
                drop(inner);
                if first_time {
                    let _ = self.work_tx.send(WorkItem::PrefetcherCaughtUp).await;
                }
                return Ok(PrefetchOutcome::Idle);
            }

            let first = inner.fetched_height.wrapping_add(1);
            let hex_hashes = self.daemon.block_hex_hashes(first, count).await?;
            let mut raw_blocks = self.daemon.raw_blocks(&hex_hashes).await?;
            if raw_blocks.len() != hex_hashes.len() {
                return Err(DaemonError::BadResponse(format!(
                    "requested {} blocks, daemon returned {}",
                    hex_hashes.len(),
                    raw_blocks.len()
                )));
            }

            if first == 0 {
                raw_blocks[0] = self.coin.genesis_block(&raw_blocks[0]);
            }

            let batch_bytes: u64 = raw_blocks.iter().map(|b| b.len() as u64).sum();
            inner.ave_size = if count as u64 >= SEED_BATCH_BLOCKS {
                batch_bytes / count as u64
            } else {
                let missing = SEED_BATCH_BLOCKS.saturating_sub(count as u64);
                (inner.ave_size * missing + batch_bytes) / SEED_BATCH_BLOCKS
            };
            inner.cache_size += batch_bytes;
            inner.fetched_height = first.wrapping_add(count - 1);
            PREFETCH_CACHE_BYTES.set(inner.cache_size as i64);

            if self.progress.should_log() {
                self.log_progress(daemon_height, inner.fetched_height, inner.ave_size);
            }

            drop(inner);
            let _ = self.work_tx.send(WorkItem::RawBlocks { blocks: raw_blocks, first }).await;
        }
    }

    /// Sampled "catching up" log line (§4.E). Uses the coin's ETA tunables
    /// only for this estimate; never consulted by correctness-critical code.
    fn log_progress(&self, daemon_height: u32, fetched_height: u32, ave_size: u64) {
        let remaining_blocks = daemon_height.saturating_sub(fetched_height);
        let tx_per_block = self.coin.tx_per_block().max(1) as u64;
        let remaining_txs = remaining_blocks as u64 * tx_per_block;
        info!(
            fetched_height,
            daemon_height,
            remaining_blocks,
            remaining_txs,
            ave_block_bytes = ave_size,
            "catching up to daemon"
        );
    }

    /// Bytes the dispatcher has finished handing off to the chain
    /// controller; re-signals the fetch loop once the cache drains below
    /// the byte budget.
    pub async fn processing_blocks(&self, consumed_bytes: u64) {
        let mut inner = self.inner.lock().await;
        inner.cache_size = inner.cache_size.saturating_sub(consumed_bytes);
        let below_budget = inner.cache_size < self.min_cache_size_bytes;
        PREFETCH_CACHE_BYTES.set(inner.cache_size as i64);
        drop(inner);
        if below_budget {
            self.refill.notify_one();
        }
    }

    /// Reorg path: rewind the fetch cursor to `h` and resume fetching from
    /// `h + 1`. Holds the same lock as `prefetch_blocks`, so this can never
    /// land mid-fetch.
    pub async fn reset_height(&self, h: u32) {
        let mut inner = self.inner.lock().await;
        inner.fetched_height = h;
        drop(inner);

        if let Ok(daemon_height) = self.daemon.height().await {
            let remaining = daemon_height.wrapping_sub(h);
            info!(height = h, daemon_height, remaining, "prefetcher reset after reorg");
        } else {
            info!(height = h, "prefetcher reset after reorg");
        }

        self.refill.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    use crate::coin::PivxLikeCoin;
    use crate::error::ChainError;
    use crate::types::{AddressFingerprint, ParsedBlock};

    struct StubDaemon {
        height: AtomicU32,
    }

    #[async_trait]
    impl Daemon for StubDaemon {
        async fn height(&self) -> Result<u32, DaemonError> {
            Ok(self.height.load(Ordering::Relaxed))
        }

        async fn cached_height(&self) -> u32 {
            self.height.load(Ordering::Relaxed)
        }

        async fn block_hex_hashes(&self, first: u32, count: u32) -> Result<Vec<String>, DaemonError> {
            Ok((0..count).map(|i| format!("{:064x}", first as u64 + i as u64)).collect())
        }

        async fn raw_blocks(&self, hex_hashes: &[String]) -> Result<Vec<Vec<u8>>, DaemonError> {
            Ok(hex_hashes.iter().map(|_| vec![0u8; 100]).collect())
        }
    }

    struct StubCoin;

    impl Coin for StubCoin {
        fn block(&self, _raw: &[u8], _height: u32) -> Result<ParsedBlock, ChainError> {
            unimplemented!()
        }
        fn header_hash(&self, _header: &[u8]) -> [u8; 32] {
            [0u8; 32]
        }
        fn header_prevhash(&self, _header: &[u8]) -> [u8; 32] {
            [0u8; 32]
        }
        fn hashx_from_script(&self, _script: &[u8]) -> Option<AddressFingerprint> {
            None
        }
        fn genesis_block(&self, raw: &[u8]) -> Vec<u8> {
            raw.to_vec()
        }
        fn tx_count(&self) -> u64 {
            0
        }
        fn tx_count_height(&self) -> u32 {
            0
        }
        fn tx_per_block(&self) -> u32 {
            1
        }
    }

    #[tokio::test]
    async fn fetches_until_cache_full_then_reports_caught_up() {
        let daemon = Arc::new(StubDaemon { height: AtomicU32::new(19) });
        let coin = Arc::new(PivxLikeCoin::new(vec![1u8; 80]));
        let (tx, mut rx) = mpsc::channel(64);

        let prefetcher = Arc::new(Prefetcher::new(daemon, coin, 1_000, tx, u32::MAX));
        let outcome = prefetcher.prefetch_blocks().await.unwrap();
        assert!(matches!(outcome, PrefetchOutcome::CacheFull) || matches!(outcome, PrefetchOutcome::Idle));

        let mut total_blocks = 0usize;
        while let Ok(item) = rx.try_recv() {
            if let WorkItem::RawBlocks { blocks, .. } = item {
                total_blocks += blocks.len();
            }
        }
        assert!(total_blocks > 0);
    }

    #[tokio::test]
    async fn genesis_block_is_replaced_with_coin_encoding() {
        let daemon = Arc::new(StubDaemon { height: AtomicU32::new(0) });
        let coin = Arc::new(StubCoin);
        let (tx, mut rx) = mpsc::channel(64);

        let prefetcher = Arc::new(Prefetcher::new(daemon, coin, 10_000, tx, u32::MAX));
        prefetcher.prefetch_blocks().await.unwrap();

        let item = rx.try_recv().expect("expected a RawBlocks item");
        match item {
            WorkItem::RawBlocks { blocks, first } => {
                assert_eq!(first, 0);
                assert_eq!(blocks[0], vec![0u8; 100]);
            }
            other => panic!("unexpected work item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn processing_blocks_resignals_refill_below_budget() {
        let daemon = Arc::new(StubDaemon { height: AtomicU32::new(0) });
        let coin = Arc::new(PivxLikeCoin::new(vec![1u8; 80]));
        let (tx, _rx) = mpsc::channel(64);

        let prefetcher = Prefetcher::new(daemon, coin, 1_000, tx, u32::MAX);
        {
            let mut inner = prefetcher.inner.lock().await;
            inner.cache_size = 2_000;
        }
        prefetcher.processing_blocks(1_500).await;
        let inner = prefetcher.inner.lock().await;
        assert_eq!(inner.cache_size, 500);
    }
}
