//! Reorg unwinding (component 4.B, backup half). Per the design's resolved
//! open question (§9 / DESIGN.md), backup assumes caches are already
//! flushed and lets `spend` fall through to the KV store on every call; it
//! never relies on the cache still holding same-block outputs.

use crate::archive::FsArchive;
use crate::coin::Coin;
use crate::engine::EngineState;
use crate::error::ChainError;
use crate::store::KvStore;
use crate::types::UtxoValue;

/// Reverse `raw_blocks`, delivered in decreasing height order starting at
/// `state.chain.height`. Precondition: `state.utxo_cache.is_empty()` and
/// `state.chain.height >= raw_blocks.len()`.
pub fn backup_blocks(
    state: &mut EngineState,
    coin: &dyn Coin,
    store: &dyn KvStore,
    archive: &dyn FsArchive,
    raw_blocks: &[Vec<u8>],
) -> Result<(), ChainError> {
    debug_assert!(
        state.utxo_cache.is_empty(),
        "backup_blocks requires all caches flushed first"
    );

    for raw in raw_blocks {
        let block = coin.block(raw, state.chain.height)?;
        let header_hash = coin.header_hash(&block.header);
        if header_hash != state.chain.tip {
            return Err(ChainError::ChainMismatch {
                height: state.chain.height,
                expected: hex::encode(state.chain.tip),
                actual: hex::encode(header_hash),
            });
        }

        let undo = archive
            .read_undo_info(state.chain.height)?
            .ok_or(ChainError::MissingUndo {
                height: state.chain.height,
                remaining: 0,
            })?;
        let mut cursor = undo.len();

        for tx in block.txs.iter().rev() {
            for (idx, output) in tx.outputs.iter().enumerate().rev() {
                if coin.hashx_from_script(&output.script).is_some() {
                    let spent = state
                        .utxo_cache
                        .spend(store, archive, &tx.tx_hash, idx as u16)?;
                    state.touched.insert(spent.fingerprint);
                }
            }

            if !tx.is_coinbase {
                for input in tx.inputs.iter().rev() {
                    if cursor < UtxoValue::ENCODED_LEN {
                        return Err(ChainError::MissingUndo {
                            height: state.chain.height,
                            remaining: cursor,
                        });
                    }
                    cursor -= UtxoValue::ENCODED_LEN;
                    let value = UtxoValue::decode(&undo[cursor..cursor + UtxoValue::ENCODED_LEN])
                        .ok_or_else(|| ChainError::Decode("corrupt undo slot".into()))?;

                    state.utxo_cache.add(
                        input.prev_tx_hash,
                        input.prev_idx,
                        value.fingerprint,
                        value.tx_ordinal,
                        value.amount,
                    );
                    state.touched.insert(value.fingerprint);
                }
            }
        }

        if cursor != 0 {
            return Err(ChainError::MissingUndo {
                height: state.chain.height,
                remaining: cursor,
            });
        }

        state.chain.tip = block.prev_hash;
        state.chain.height = state.chain.height.wrapping_sub(1);
        state.chain.tx_count -= block.txs.len() as u64;
    }

    Ok(())
}
