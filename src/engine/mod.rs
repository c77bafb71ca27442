pub mod advance;
pub mod backup;

use std::collections::HashSet;

use crate::types::{AddressFingerprint, ChainState};
use crate::utxo::UtxoCache;

/// Per-block history-index update produced by `advance_blocks`: the tx
/// ordinal the block's first transaction received, and one fingerprint list
/// per transaction in block order.
pub struct BlockHistoryUpdate {
    pub starting_tx_count: u64,
    pub per_tx_fingerprints: Vec<Vec<AddressFingerprint>>,
}

/// All caches born empty at startup and atomically drained by the flush
/// coordinator (§3). Owned by `BlockProcessor` behind the state lock.
pub struct EngineState {
    pub chain: ChainState,
    pub utxo_cache: UtxoCache,
    pub undo_infos: Vec<(Vec<u8>, u32)>,
    pub headers: Vec<[u8; 32]>,
    pub tx_hashes: Vec<[u8; 32]>,
    /// Tx count contributed by each pending entry in `headers`, in the same
    /// order, so `fs_flush` can re-slice the flat `tx_hashes` buffer back
    /// into per-block groups for `FsArchive::append_block`.
    pub block_tx_counts: Vec<u32>,
    pub touched: HashSet<AddressFingerprint>,
}

impl EngineState {
    pub fn new(chain: ChainState) -> Self {
        Self {
            chain,
            utxo_cache: UtxoCache::new(),
            undo_infos: Vec::new(),
            headers: Vec::new(),
            tx_hashes: Vec::new(),
            block_tx_counts: Vec::new(),
            touched: HashSet::new(),
        }
    }

    pub fn take_touched(&mut self) -> HashSet<AddressFingerprint> {
        std::mem::take(&mut self.touched)
    }
}
