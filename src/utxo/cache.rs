//! In-memory UTXO cache and two-table on-disk codec (component 4.A).

use std::collections::HashMap;

use crate::archive::FsArchive;
use crate::error::ChainError;
use crate::store::{KvStore, KvWriteBatch, CF_UTXO_H, CF_UTXO_U};
use crate::types::{AddressFingerprint, UtxoValue};
use crate::utxo::keys::{h_key, h_key_tx_ordinal, h_prefix, u_key};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct OutPoint {
    tx_hash: [u8; 32],
    idx: u16,
}

pub struct UtxoCache {
    utxo_cache: HashMap<OutPoint, UtxoValue>,
    db_deletes: Vec<(&'static str, Vec<u8>)>,
}

impl Default for UtxoCache {
    fn default() -> Self {
        Self::new()
    }
}

impl UtxoCache {
    pub fn new() -> Self {
        Self {
            utxo_cache: HashMap::new(),
            db_deletes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.utxo_cache.is_empty() && self.db_deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.utxo_cache.len()
    }

    pub fn delete_count(&self) -> usize {
        self.db_deletes.len()
    }

    /// Insert an unflushed UTXO. Must not be called for unspendable outputs
    /// (callers filter those via `Coin::hashx_from_script` returning `None`).
    pub fn add(&mut self, tx_hash: [u8; 32], idx: u16, fingerprint: AddressFingerprint, tx_ordinal: u32, amount: u64) {
        self.utxo_cache.insert(
            OutPoint { tx_hash, idx },
            UtxoValue {
                fingerprint,
                tx_ordinal,
                amount,
            },
        );
    }

    /// Remove and return the UTXO at `(tx_hash, idx)`, from the cache if
    /// present, else from the store via a prefix scan of the `h` table.
    pub fn spend(
        &mut self,
        store: &dyn KvStore,
        archive: &dyn FsArchive,
        tx_hash: &[u8; 32],
        idx: u16,
    ) -> Result<UtxoValue, ChainError> {
        let key = OutPoint {
            tx_hash: *tx_hash,
            idx,
        };
        if let Some(value) = self.utxo_cache.remove(&key) {
            return Ok(value);
        }

        let prefix = h_prefix(tx_hash, idx);
        let mut candidates = store.iterator_prefix(CF_UTXO_H, &prefix)?;

        let found = candidates.find_map(|(k, v)| {
            let tx_ordinal = h_key_tx_ordinal(&k)?;
            let (full_hash, _height) = archive.fs_tx_hash(tx_ordinal).ok()?;
            if &full_hash == tx_hash {
                let fingerprint = AddressFingerprint::from_slice(&v)?;
                Some((k.to_vec(), tx_ordinal, fingerprint))
            } else {
                None
            }
        });

        let (h_key_bytes, tx_ordinal, fingerprint) = found.ok_or_else(|| ChainError::MissingUtxo {
            tx_hash: hex::encode(tx_hash),
            idx,
        })?;

        let u_key_bytes = u_key(&fingerprint, idx, tx_ordinal);
        let amount_bytes = store.get(CF_UTXO_U, &u_key_bytes)?.ok_or_else(|| ChainError::MissingUtxo {
            tx_hash: hex::encode(tx_hash),
            idx,
        })?;
        let amount = u64::from_le_bytes(
            amount_bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainError::MissingUtxo {
                    tx_hash: hex::encode(tx_hash),
                    idx,
                })?,
        );

        self.db_deletes.push((CF_UTXO_H, h_key_bytes));
        self.db_deletes.push((CF_UTXO_U, u_key_bytes));

        Ok(UtxoValue {
            fingerprint,
            tx_ordinal,
            amount,
        })
    }

    /// Write pending deletes (sorted for locality) then every cache entry's
    /// `h`/`u` rows, then clear. Delete ordering is a locality hint only —
    /// the batch commits atomically regardless of intra-batch order.
    pub fn flush_to_batch(&mut self, batch: &mut dyn KvWriteBatch) {
        self.db_deletes.sort_unstable_by(|a, b| a.1.cmp(&b.1));
        for (cf, key) in self.db_deletes.drain(..) {
            batch.delete(cf, &key);
        }

        for (outpoint, value) in self.utxo_cache.drain() {
            let hkey = h_key(&outpoint.tx_hash, outpoint.idx, value.tx_ordinal);
            batch.put(CF_UTXO_H, &hkey, &value.fingerprint.0);

            let ukey = u_key(&value.fingerprint, outpoint.idx, value.tx_ordinal);
            batch.put(CF_UTXO_U, &ukey, &value.amount.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::FileArchive;
    use crate::store::RocksStore;
    use tempfile::TempDir;

    fn fp(byte: u8) -> AddressFingerprint {
        AddressFingerprint([byte; 11])
    }

    #[test]
    fn add_then_spend_from_cache_needs_no_store_lookup() {
        let mut cache = UtxoCache::new();
        let tx_hash = [1u8; 32];
        cache.add(tx_hash, 0, fp(9), 42, 5_000_000_000);

        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let archive = FileArchive::open(dir.path().join("archive").as_path()).unwrap();

        let value = cache.spend(&store, &archive, &tx_hash, 0).unwrap();
        assert_eq!(value.amount, 5_000_000_000);
        assert_eq!(value.fingerprint, fp(9));
        assert!(cache.is_empty());
    }

    #[test]
    fn spend_missing_utxo_is_an_error() {
        let mut cache = UtxoCache::new();
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let archive = FileArchive::open(dir.path().join("archive").as_path()).unwrap();

        let result = cache.spend(&store, &archive, &[2u8; 32], 0);
        assert!(matches!(result, Err(ChainError::MissingUtxo { .. })));
    }

    #[test]
    fn flush_writes_both_tables_and_clears_cache() {
        let mut cache = UtxoCache::new();
        cache.add([3u8; 32], 1, fp(4), 7, 123);

        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let mut batch = store.write_batch();
        cache.flush_to_batch(batch.as_mut());
        batch.commit().unwrap();

        assert!(cache.is_empty());
        let hkey = h_key(&[3u8; 32], 1, 7);
        assert!(store.get(CF_UTXO_H, &hkey).unwrap().is_some());
        let ukey = u_key(&fp(4), 1, 7);
        assert_eq!(
            store.get(CF_UTXO_U, &ukey).unwrap().unwrap(),
            123u64.to_le_bytes()
        );
    }
}
