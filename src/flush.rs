//! Flush coordinator (component 4.C): atomically commits cached mutations
//! to the filesystem archive and KV store, and enforces the cross-subsystem
//! invariants of spec §3 (`db_* ≤ fs_* ≤ *`, equal after a successful flush).

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::archive::FsArchive;
use crate::engine::EngineState;
use crate::error::ChainError;
use crate::history::History;
use crate::metrics::{FLUSH_DURATION, INDEXED_HEIGHT, UTXO_FLUSH_COUNT};
use crate::store::{KvStore, KvWriteBatch, CF_CHAIN_STATE};
use crate::types::ChainState;

const KEY_HEIGHT: &[u8] = b"height";
const KEY_TIP: &[u8] = b"tip";
const KEY_TX_COUNT: &[u8] = b"tx_count";
const KEY_WALL_TIME: &[u8] = b"wall_time";
pub const KEY_GENESIS_HASH: &[u8] = b"genesis_hash";
const KEY_UTXO_FLUSH_COUNT: &[u8] = b"utxo_flush_count";

const CACHE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

// §4.C memory estimate constants.
const UTXO_ENTRY_BYTES: u64 = 205;
const DELETE_ENTRY_BYTES: u64 = 57;
const TX_HASH_BYTES: u64 = 32;
const BLOCK_OVERHEAD_BYTES: u64 = 42;

/// Shadow copy of chain state whose headers/tx-hashes are durably appended
/// to the filesystem archive (`fs_*` of spec §3). `tip` isn't tracked
/// separately here: the archive's own `headers.dat` is the authority for
/// which hash was last appended at a given height.
#[derive(Clone, Copy, Debug)]
struct FsShadow {
    height: u32,
    tx_count: u64,
}

/// What `check_cache_size` decided to do, surfaced so callers can log it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    None,
    Utxos,
    HistoryOnly,
}

pub struct FlushCoordinator {
    db_chain: ChainState,
    fs_shadow: FsShadow,
    utxo_flush_count: u64,
    last_cache_check: Instant,
}

impl FlushCoordinator {
    pub fn new(db_chain: ChainState, utxo_flush_count: u64) -> Self {
        Self {
            fs_shadow: FsShadow {
                height: db_chain.height,
                tx_count: db_chain.tx_count,
            },
            db_chain,
            utxo_flush_count,
            last_cache_check: Instant::now(),
        }
    }

    pub fn db_height(&self) -> u32 {
        self.db_chain.height
    }

    pub fn utxo_flush_count(&self) -> u64 {
        self.utxo_flush_count
    }

    /// Whether 30 wall-clock seconds have elapsed since the last cache-size
    /// check, per the adaptive-flush cadence of §4.B. Resets the clock as a
    /// side effect so the caller only needs to call `check_cache_size` when
    /// this returns true.
    pub fn cache_check_due(&mut self) -> bool {
        if self.last_cache_check.elapsed() >= CACHE_CHECK_INTERVAL {
            self.last_cache_check = Instant::now();
            true
        } else {
            false
        }
    }

    /// Forward flush (§4.C `flush`). No-op if the in-memory height already
    /// equals the last-committed height.
    pub async fn flush(
        &mut self,
        state: &mut EngineState,
        archive: &dyn FsArchive,
        store: &dyn KvStore,
        history: &dyn History,
        flush_utxos: bool,
    ) -> Result<(), ChainError> {
        if state.chain.height == self.db_chain.height {
            return Ok(());
        }
        let start = Instant::now();

        self.fs_flush(state, archive)?;
        history.flush().await;

        let mut batch = store.write_batch();
        if flush_utxos {
            state.utxo_cache.flush_to_batch(batch.as_mut());
            self.utxo_flush_count += 1;
        }
        for (undo, height) in state.undo_infos.drain(..) {
            archive.write_undo_info(height, &undo)?;
        }
        self.write_chain_state_keys(batch.as_mut(), state.chain);
        batch.commit()?;

        // Second, direct write outside the batch: the wall-time this
        // records reflects the commit latency above, per §4.C's
        // intentional "wall-time double write".
        let mut post = store.write_batch();
        self.write_chain_state_keys(post.as_mut(), state.chain);
        post.commit()?;

        self.db_chain = state.chain;
        INDEXED_HEIGHT.set(self.db_chain.height as i64);
        UTXO_FLUSH_COUNT.set(self.utxo_flush_count as i64);
        FLUSH_DURATION
            .with_label_values(&["forward"])
            .observe(start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Reorg-mode flush (§4.C `backup_flush`). Pre-asserts the history index
    /// is flushed and that `headers`/`tx_hashes` are empty — backup never
    /// produces FS-appended data. Moves the FS shadow back (it isn't
    /// authoritative during backup) and instructs the history index to drop
    /// post-height entries for every touched address.
    pub async fn backup_flush(
        &mut self,
        state: &mut EngineState,
        store: &dyn KvStore,
        history: &dyn History,
    ) -> Result<(), ChainError> {
        history.assert_flushed();
        debug_assert!(
            state.headers.is_empty() && state.tx_hashes.is_empty(),
            "backup_flush: headers/tx_hashes must be empty, backup never appends to the FS archive"
        );

        let start = Instant::now();
        history.backup(&state.touched, state.chain.tx_count).await;

        self.fs_shadow = FsShadow {
            height: state.chain.height,
            tx_count: state.chain.tx_count,
        };

        let mut batch = store.write_batch();
        state.utxo_cache.flush_to_batch(batch.as_mut());
        self.utxo_flush_count += 1;
        self.write_chain_state_keys(batch.as_mut(), state.chain);
        batch.commit()?;

        self.db_chain = state.chain;
        INDEXED_HEIGHT.set(self.db_chain.height as i64);
        UTXO_FLUSH_COUNT.set(self.utxo_flush_count as i64);
        FLUSH_DURATION
            .with_label_values(&["backup"])
            .observe(start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Estimate unflushed memory from counts and trigger an adaptive flush:
    /// a full `flush(flush_utxos=true)` once the UTXO-side caches exceed 80%
    /// of `min_cache_size_bytes`, or a cheap `flush(flush_utxos=false)` once
    /// the history index alone exceeds 20%.
    pub async fn check_cache_size(
        &mut self,
        state: &mut EngineState,
        archive: &dyn FsArchive,
        store: &dyn KvStore,
        history: &dyn History,
        min_cache_size_bytes: u64,
    ) -> Result<FlushDecision, ChainError> {
        let utxo_bytes = state.utxo_cache.len() as u64 * UTXO_ENTRY_BYTES
            + state.utxo_cache.delete_count() as u64 * DELETE_ENTRY_BYTES
            + state.tx_hashes.len() as u64 * TX_HASH_BYTES
            + state.headers.len() as u64 * BLOCK_OVERHEAD_BYTES;
        let history_bytes = history.unflushed_memsize() as u64;

        if utxo_bytes > min_cache_size_bytes * 80 / 100 {
            self.flush(state, archive, store, history, true).await?;
            Ok(FlushDecision::Utxos)
        } else if history_bytes > min_cache_size_bytes * 20 / 100 {
            self.flush(state, archive, store, history, false).await?;
            Ok(FlushDecision::HistoryOnly)
        } else {
            Ok(FlushDecision::None)
        }
    }

    /// Invariant check of §4.C: holds whenever `height == db_height`.
    pub fn assert_flushed(&self, state: &EngineState, history: &dyn History) {
        assert_eq!(state.chain.height, self.db_chain.height, "height != db_height");
        assert_eq!(
            self.fs_shadow.tx_count, self.db_chain.tx_count,
            "fs_tx_count != db_tx_count"
        );
        assert_eq!(
            state.chain.tx_count, self.db_chain.tx_count,
            "tx_count != db_tx_count"
        );
        assert!(state.utxo_cache.is_empty(), "utxo_cache not flushed");
        assert!(state.undo_infos.is_empty(), "undo_infos not flushed");
        assert!(
            state.headers.is_empty() && state.tx_hashes.is_empty(),
            "fs caches not flushed"
        );
        history.assert_flushed();
    }

    /// Append pending headers/tx-hashes to the archive, one `append_block`
    /// call per pending block so `tx_counts.dat`'s starting-ordinal index
    /// stays one row per height.
    fn fs_flush(&mut self, state: &mut EngineState, archive: &dyn FsArchive) -> Result<(), ChainError> {
        let mut tx_offset = 0usize;
        let mut ordinal = self.fs_shadow.tx_count;

        for (i, header_hash) in state.headers.iter().enumerate() {
            let count = state.block_tx_counts[i] as usize;
            let hashes = &state.tx_hashes[tx_offset..tx_offset + count];
            archive.append_block(*header_hash, hashes, ordinal as u32)?;
            tx_offset += count;
            ordinal += count as u64;
            self.fs_shadow.height = self.fs_shadow.height.wrapping_add(1);
        }

        self.fs_shadow.tx_count = ordinal;
        state.headers.clear();
        state.tx_hashes.clear();
        state.block_tx_counts.clear();
        Ok(())
    }

    fn write_chain_state_keys(&self, batch: &mut dyn KvWriteBatch, chain: ChainState) {
        batch.put(CF_CHAIN_STATE, KEY_HEIGHT, &chain.height.to_le_bytes());
        batch.put(CF_CHAIN_STATE, KEY_TIP, &chain.tip);
        batch.put(CF_CHAIN_STATE, KEY_TX_COUNT, &chain.tx_count.to_le_bytes());
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        batch.put(CF_CHAIN_STATE, KEY_WALL_TIME, &wall_time.to_le_bytes());
        batch.put(
            CF_CHAIN_STATE,
            KEY_UTXO_FLUSH_COUNT,
            &self.utxo_flush_count.to_le_bytes(),
        );
    }
}

/// Read persisted chain state back from the KV store at startup, returning
/// genesis if the store is fresh. Also returns the persisted
/// `utxo_flush_count` (0 if absent).
pub fn load_chain_state(store: &dyn KvStore) -> Result<(ChainState, u64), ChainError> {
    let height = store
        .get(CF_CHAIN_STATE, KEY_HEIGHT)?
        .map(|b| u32::from_le_bytes(b.as_slice().try_into().unwrap_or_default()));
    let tip = store
        .get(CF_CHAIN_STATE, KEY_TIP)?
        .map(|b| {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&b);
            arr
        });
    let tx_count = store
        .get(CF_CHAIN_STATE, KEY_TX_COUNT)?
        .map(|b| u64::from_le_bytes(b.as_slice().try_into().unwrap_or_default()));
    let utxo_flush_count = store
        .get(CF_CHAIN_STATE, KEY_UTXO_FLUSH_COUNT)?
        .map(|b| u64::from_le_bytes(b.as_slice().try_into().unwrap_or_default()))
        .unwrap_or(0);

    match (height, tip, tx_count) {
        (Some(height), Some(tip), Some(tx_count)) => Ok((
            ChainState {
                height,
                tip,
                tx_count,
            },
            utxo_flush_count,
        )),
        _ => Ok((ChainState::fresh(), 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::FileArchive;
    use crate::history::InMemoryHistory;
    use crate::store::RocksStore;
    use crate::types::AddressFingerprint;
    use tempfile::TempDir;

    #[tokio::test]
    async fn flush_is_noop_when_height_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let archive = FileArchive::open(&dir.path().join("archive")).unwrap();
        let history = InMemoryHistory::default();

        let mut coordinator = FlushCoordinator::new(ChainState::fresh(), 0);
        let mut state = EngineState::new(ChainState::fresh());

        coordinator
            .flush(&mut state, &archive, &store, &history, true)
            .await
            .unwrap();
        assert_eq!(coordinator.db_height(), u32::MAX);
        assert_eq!(coordinator.utxo_flush_count(), 0);
    }

    #[tokio::test]
    async fn flush_persists_chain_state_and_clears_caches() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let archive = FileArchive::open(&dir.path().join("archive")).unwrap();
        let history = InMemoryHistory::default();

        let mut coordinator = FlushCoordinator::new(ChainState::fresh(), 0);
        let mut state = EngineState::new(ChainState::fresh());
        state.chain.height = 1;
        state.chain.tip = [9u8; 32];
        state.chain.tx_count = 1;
        state.headers.push([9u8; 32]);
        state.block_tx_counts.push(1);
        state.tx_hashes.push([1u8; 32]);
        state
            .utxo_cache
            .add([1u8; 32], 0, AddressFingerprint([7u8; 11]), 0, 50_0000_0000);

        coordinator
            .flush(&mut state, &archive, &store, &history, true)
            .await
            .unwrap();

        assert_eq!(coordinator.db_height(), 1);
        assert_eq!(coordinator.utxo_flush_count(), 1);
        assert!(state.headers.is_empty());
        assert!(state.utxo_cache.is_empty());
        coordinator.assert_flushed(&state, &history);

        let (reloaded, flush_count) = load_chain_state(&store).unwrap();
        assert_eq!(reloaded.height, 1);
        assert_eq!(reloaded.tip, [9u8; 32]);
        assert_eq!(flush_count, 1);
    }

    #[tokio::test]
    async fn second_flush_with_no_advance_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let archive = FileArchive::open(&dir.path().join("archive")).unwrap();
        let history = InMemoryHistory::default();

        let mut coordinator = FlushCoordinator::new(ChainState::fresh(), 0);
        let mut state = EngineState::new(ChainState::fresh());
        state.chain.height = 1;
        state.chain.tip = [1u8; 32];
        state.chain.tx_count = 1;
        state.headers.push([1u8; 32]);
        state.block_tx_counts.push(1);
        state.tx_hashes.push([2u8; 32]);

        coordinator
            .flush(&mut state, &archive, &store, &history, true)
            .await
            .unwrap();
        let count_after_first = coordinator.utxo_flush_count();

        coordinator
            .flush(&mut state, &archive, &store, &history, true)
            .await
            .unwrap();
        assert_eq!(coordinator.utxo_flush_count(), count_after_first);
        coordinator.assert_flushed(&state, &history);
    }
}
