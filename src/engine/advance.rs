//! Forward block application (component 4.B, advance half).

use crate::archive::FsArchive;
use crate::coin::Coin;
use crate::engine::{BlockHistoryUpdate, EngineState};
use crate::error::ChainError;
use crate::metrics::{BLOCKS_PROCESSED, TRANSACTIONS_PROCESSED, UTXOS_ADDED, UTXOS_SPENT};
use crate::store::KvStore;
use crate::types::ParsedBlock;

/// Apply `blocks` (with their matching raw bytes, for within-`reorg_limit`
/// archiving) to `state`. Precondition: `blocks[0].prev_hash == state.chain.tip`
/// — callers (the chain controller) verify chain linkage before calling in.
pub fn advance_blocks(
    state: &mut EngineState,
    coin: &dyn Coin,
    store: &dyn KvStore,
    archive: &dyn FsArchive,
    blocks: &[ParsedBlock],
    raw_blocks: &[Vec<u8>],
    daemon_height: u32,
    reorg_limit: u32,
) -> Result<Vec<BlockHistoryUpdate>, ChainError> {
    let mut history_updates = Vec::with_capacity(blocks.len());

    for (block, raw) in blocks.iter().zip(raw_blocks) {
        let starting_tx_count = state.chain.tx_count;
        let mut per_tx_fingerprints = Vec::with_capacity(block.txs.len());
        let mut block_tx_hashes = Vec::with_capacity(block.txs.len());
        let mut undo_info = Vec::new();

        // The coinbase is always the block's first transaction in a valid
        // block, so no reordering is needed here to satisfy the
        // coinbase-first processing rule.
        for tx in &block.txs {
            let mut touched_by_tx = Vec::new();

            if !tx.is_coinbase {
                for input in &tx.inputs {
                    let spent =
                        state
                            .utxo_cache
                            .spend(store, archive, &input.prev_tx_hash, input.prev_idx)?;
                    undo_info.extend_from_slice(&spent.encode());
                    touched_by_tx.push(spent.fingerprint);
                    state.touched.insert(spent.fingerprint);
                    UTXOS_SPENT.inc();
                }
            }

            for (idx, output) in tx.outputs.iter().enumerate() {
                if let Some(fingerprint) = coin.hashx_from_script(&output.script) {
                    let tx_ordinal = state.chain.tx_count as u32;
                    state
                        .utxo_cache
                        .add(tx.tx_hash, idx as u16, fingerprint, tx_ordinal, output.value);
                    touched_by_tx.push(fingerprint);
                    state.touched.insert(fingerprint);
                    UTXOS_ADDED.inc();
                }
            }

            per_tx_fingerprints.push(touched_by_tx);
            block_tx_hashes.push(tx.tx_hash);
            state.chain.tx_count += 1;
            TRANSACTIONS_PROCESSED.inc();
        }

        let header_hash = coin.header_hash(&block.header);
        state.headers.push(header_hash);
        state.block_tx_counts.push(block_tx_hashes.len() as u32);
        state.tx_hashes.extend(block_tx_hashes);

        let height = state.chain.height.wrapping_add(1);
        if daemon_height.saturating_sub(height) <= reorg_limit {
            state.undo_infos.push((undo_info, height));
            archive.write_raw_block(raw, height)?;
        }

        state.chain.height = height;
        state.chain.tip = header_hash;
        BLOCKS_PROCESSED.inc();

        history_updates.push(BlockHistoryUpdate {
            starting_tx_count,
            per_tx_fingerprints,
        });
    }

    Ok(history_updates)
}
