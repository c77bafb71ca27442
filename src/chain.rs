//! Chain controller (component 4.D): verifies chain linkage, detects
//! reorgs, computes the fork point, and drives advance vs. backup. Owns the
//! task-level state lock of §5 — no other task may mutate chain state,
//! caches, or `touched` while it is held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::archive::FsArchive;
use crate::coin::Coin;
use crate::daemon::Daemon;
use crate::engine::{self, EngineState};
use crate::error::{ChainError, DaemonError};
use crate::flush::FlushCoordinator;
use crate::history::History;
use crate::metrics::{ADVANCE_DURATION, BLOCK_PARSE_DURATION, CHAIN_TIP_HEIGHT, REORGS, REORG_DEPTH};
use crate::prefetch::Prefetcher;
use crate::store::KvStore;
use crate::types::{AddressFingerprint, ChainState};

/// How many heights `reorg_chain` undoes per chunk (§4.D), bounding
/// undo-record memory during a deep reorg while still amortizing flush
/// overhead across chunks.
const REORG_CHUNK_SIZE: usize = 50;

/// Chain state plus its flush coordinator, guarded together by one lock:
/// a flush always runs with the mutating state it commits held exclusively.
pub struct Locked {
    pub state: EngineState,
    pub flush: FlushCoordinator,
}

pub struct ChainController {
    daemon: Arc<dyn Daemon>,
    coin: Arc<dyn Coin>,
    store: Arc<dyn KvStore>,
    archive: Arc<dyn FsArchive>,
    history: Arc<dyn History>,
    reorg_limit: u32,
    min_cache_size_bytes: u64,
    locked: Arc<Mutex<Locked>>,
    prefetcher: Arc<Prefetcher>,
    caught_up: Arc<AtomicBool>,
    notify_tx: broadcast::Sender<std::collections::HashSet<AddressFingerprint>>,
}

impl ChainController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        daemon: Arc<dyn Daemon>,
        coin: Arc<dyn Coin>,
        store: Arc<dyn KvStore>,
        archive: Arc<dyn FsArchive>,
        history: Arc<dyn History>,
        reorg_limit: u32,
        min_cache_size_bytes: u64,
        locked: Arc<Mutex<Locked>>,
        prefetcher: Arc<Prefetcher>,
        caught_up: Arc<AtomicBool>,
        notify_tx: broadcast::Sender<std::collections::HashSet<AddressFingerprint>>,
    ) -> Self {
        Self {
            daemon,
            coin,
            store,
            archive,
            history,
            reorg_limit,
            min_cache_size_bytes,
            locked,
            prefetcher,
            caught_up,
            notify_tx,
        }
    }

    pub fn locked(&self) -> &Arc<Mutex<Locked>> {
        &self.locked
    }

    pub fn archive(&self) -> &dyn FsArchive {
        self.archive.as_ref()
    }

    pub fn store(&self) -> &dyn KvStore {
        self.store.as_ref()
    }

    pub fn history(&self) -> &dyn History {
        self.history.as_ref()
    }

    /// §4.F: the dispatcher fires this once, with an empty `touched` set,
    /// the first time the prefetcher reports caught-up, so downstream
    /// observers can initialize their own state before any real change
    /// notification arrives.
    pub fn notify_caught_up(&self) {
        let _ = self.notify_tx.send(std::collections::HashSet::new());
    }

    /// §4.D `check_and_advance_blocks`.
    pub async fn check_and_advance_blocks(
        &self,
        raw_blocks: Vec<Vec<u8>>,
        first: u32,
    ) -> Result<(), ChainError> {
        let consumed: u64 = raw_blocks.iter().map(|b| b.len() as u64).sum();
        self.prefetcher.processing_blocks(consumed).await;

        let current_height = self.locked.lock().await.state.chain.height;
        if first != current_height.wrapping_add(1) {
            warn!(first, height = current_height, "dropping late batch after reorg");
            return Ok(());
        }

        let coin = self.coin.clone();
        let blocks = raw_blocks
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                let start = std::time::Instant::now();
                let parsed = coin.block(raw, first.wrapping_add(i as u32));
                BLOCK_PARSE_DURATION.observe(start.elapsed().as_secs_f64());
                parsed
            })
            .collect::<Result<Vec<_>, _>>()?;

        let hprevs = Self::prev_hashes(&blocks);
        let local_tip = self.locked.lock().await.state.chain.tip;
        let chain = Self::expected_chain(local_tip, &blocks, coin.as_ref());

        if hprevs == chain {
            self.advance(blocks, raw_blocks, first).await
        } else if hprevs.first() != chain.first() {
            self.reorg_chain(None).await
        } else {
            let height = self.locked.lock().await.state.chain.height;
            warn!(height, "mid-batch chain divergence, resetting prefetcher");
            self.prefetcher.reset_height(height).await;
            Ok(())
        }
    }

    fn prev_hashes(blocks: &[crate::types::ParsedBlock]) -> Vec<[u8; 32]> {
        blocks.iter().map(|b| b.prev_hash).collect()
    }

    fn expected_chain(local_tip: [u8; 32], blocks: &[crate::types::ParsedBlock], coin: &dyn Coin) -> Vec<[u8; 32]> {
        let mut chain = Vec::with_capacity(blocks.len());
        chain.push(local_tip);
        for block in &blocks[..blocks.len().saturating_sub(1)] {
            chain.push(coin.header_hash(&block.header));
        }
        chain
    }

    async fn advance(
        &self,
        blocks: Vec<crate::types::ParsedBlock>,
        raw_blocks: Vec<Vec<u8>>,
        first: u32,
    ) -> Result<(), ChainError> {
        let daemon_height = self.daemon.cached_height().await;
        CHAIN_TIP_HEIGHT.set(daemon_height as i64);

        let coin = self.coin.clone();
        let store = self.store.clone();
        let archive = self.archive.clone();
        let reorg_limit = self.reorg_limit;

        let mut guard = self.locked.lock().await;
        let mut state = std::mem::replace(&mut guard.state, EngineState::new(ChainState::fresh()));

        let advance_start = std::time::Instant::now();
        let (mut state, history_updates) = tokio::task::spawn_blocking(move || {
            let result = engine::advance::advance_blocks(
                &mut state,
                coin.as_ref(),
                store.as_ref(),
                archive.as_ref(),
                &blocks,
                &raw_blocks,
                daemon_height,
                reorg_limit,
            );
            (state, result)
        })
        .await
        .expect("advance_blocks task panicked");
        ADVANCE_DURATION.observe(advance_start.elapsed().as_secs_f64());
        let history_updates = history_updates?;

        for update in &history_updates {
            self.history
                .add_unflushed(&update.per_tx_fingerprints, update.starting_tx_count)
                .await;
        }

        let caught_up = self.caught_up.load(Ordering::Acquire);
        if caught_up {
            guard
                .flush
                .flush(&mut state, self.archive.as_ref(), self.store.as_ref(), self.history.as_ref(), true)
                .await?;
        } else if guard.flush.cache_check_due() {
            guard
                .flush
                .check_cache_size(
                    &mut state,
                    self.archive.as_ref(),
                    self.store.as_ref(),
                    self.history.as_ref(),
                    self.min_cache_size_bytes,
                )
                .await?;
        }

        if caught_up {
            let touched = state.take_touched();
            let _ = self.notify_tx.send(touched);
        }

        info!(first, height = state.chain.height, "advanced blocks");
        guard.state = state;
        Ok(())
    }

    /// §4.D `reorg_chain`. `count = None` for a real reorg; `Some(n)`
    /// simulates undoing exactly `n` heights (`force_chain_reorg`).
    pub async fn reorg_chain(&self, count: Option<u32>) -> Result<(), ChainError> {
        {
            let mut guard = self.locked.lock().await;
            let Locked { state, flush } = &mut *guard;
            flush
                .flush(state, self.archive.as_ref(), self.store.as_ref(), self.history.as_ref(), true)
                .await?;
        }

        let (fork_start, hashes) = self.reorg_hashes(count).await?;
        let total = hashes.len();
        REORGS.inc();
        REORG_DEPTH
            .with_label_values(&[if count.is_some() { "manual" } else { "daemon" }])
            .inc_by(total as u64);
        info!(fork_start, total, "reorg: undoing blocks");

        let mut end = hashes.len();
        while end > 0 {
            let chunk_len = end.min(REORG_CHUNK_SIZE);
            let start_idx = end - chunk_len;
            let chunk = &hashes[start_idx..end];

            let mut raw_blocks = Vec::with_capacity(chunk_len);
            for (i, hash) in chunk.iter().enumerate().rev() {
                let height = fork_start + (start_idx + i) as u32;
                let raw = match self.archive.read_raw_block(height)? {
                    Some(raw) => raw,
                    None => {
                        let hex_hash = hex::encode(hash);
                        self.daemon
                            .raw_blocks(&[hex_hash])
                            .await?
                            .into_iter()
                            .next()
                            .ok_or_else(|| ChainError::Decode(format!("daemon returned no block for height {height}")))?
                    }
                };
                raw_blocks.push(raw);
            }

            let coin = self.coin.clone();
            let store = self.store.clone();
            let archive = self.archive.clone();

            let mut guard = self.locked.lock().await;
            let mut state = std::mem::replace(&mut guard.state, EngineState::new(ChainState::fresh()));

            let (mut state, result) = tokio::task::spawn_blocking(move || {
                let result = engine::backup::backup_blocks(&mut state, coin.as_ref(), store.as_ref(), archive.as_ref(), &raw_blocks);
                (state, result)
            })
            .await
            .expect("backup_blocks task panicked");
            result?;

            guard
                .flush
                .backup_flush(&mut state, self.store.as_ref(), self.history.as_ref())
                .await?;
            guard.state = state;

            end = start_idx;
        }

        self.prefetcher.reset_height(fork_start.wrapping_sub(1)).await;
        Ok(())
    }

    /// §4.D `reorg_hashes` / `diff_pos` — the fork-point search.
    async fn reorg_hashes(&self, count: Option<u32>) -> Result<(u32, Vec<[u8; 32]>), ChainError> {
        let height = self.locked.lock().await.state.chain.height;

        if let Some(count) = count {
            let start = height.wrapping_sub(count).wrapping_add(1);
            let hashes = self.archive.fs_block_hashes(start, count)?;
            return Ok((start, hashes));
        }

        let mut start = height.wrapping_sub(1);
        let mut window = 1u32;
        loop {
            let local = self.archive.fs_block_hashes(start, window)?;
            let remote = self.decode_remote_hashes(start, window).await?;
            let agree = diff_pos(&local, &remote);

            if agree > 0 {
                let fork_start = start + agree as u32;
                let result_len = height - fork_start + 1;
                let hashes = self.archive.fs_block_hashes(fork_start, result_len)?;
                return Ok((fork_start, hashes));
            }

            if start == 0 {
                let hashes = self.archive.fs_block_hashes(0, height + 1)?;
                return Ok((0, hashes));
            }

            window = (window * 2).min(start);
            start -= window;
        }
    }

    async fn decode_remote_hashes(&self, start: u32, count: u32) -> Result<Vec<[u8; 32]>, DaemonError> {
        let hex_hashes = self.daemon.block_hex_hashes(start, count).await?;
        hex_hashes
            .iter()
            .map(|hex_hash| {
                let bytes = hex::decode(hex_hash)
                    .map_err(|e| DaemonError::BadResponse(format!("bad hex hash from daemon: {e}")))?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| DaemonError::BadResponse("hash not 32 bytes".into()))?;
                Ok(arr)
            })
            .collect()
    }
}

/// First index where `local` and `remote` disagree, or `local.len()` (==
/// the window size) if they agree throughout.
fn diff_pos(local: &[[u8; 32]], remote: &[[u8; 32]]) -> usize {
    local
        .iter()
        .zip(remote.iter())
        .take_while(|(a, b)| a == b)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_pos_returns_window_len_when_identical() {
        let a = vec![[1u8; 32], [2u8; 32], [3u8; 32]];
        assert_eq!(diff_pos(&a, &a), 3);
    }

    #[test]
    fn diff_pos_finds_first_disagreement() {
        let local = vec![[1u8; 32], [2u8; 32], [3u8; 32]];
        let mut remote = local.clone();
        remote[1] = [9u8; 32];
        assert_eq!(diff_pos(&local, &remote), 1);
    }
}
