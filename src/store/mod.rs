//! `KvStore`: the ordered key/value abstraction the engine persists through.
//! `RocksStore` is the concrete backing, grounded on the atomic write-batch
//! wrapper the teacher used for its own reorg rollback path — one
//! `rocksdb::WriteBatch` per commit, applied in a single `db.write()` call so
//! a crash mid-flush never leaves a batch half-applied.

use rocksdb::{IteratorMode, Options, DB};
use std::path::Path;
use std::sync::Arc;

use crate::error::StoreError;

pub const CF_UTXO_H: &str = "utxo_h";
pub const CF_UTXO_U: &str = "utxo_u";
pub const CF_UNDO: &str = "undo";
pub const CF_CHAIN_STATE: &str = "chain_state";

pub const COLUMN_FAMILIES: [&str; 4] = [CF_UTXO_H, CF_UTXO_U, CF_UNDO, CF_CHAIN_STATE];

pub trait KvWriteBatch {
    fn put(&mut self, cf: &str, key: &[u8], value: &[u8]);
    fn delete(&mut self, cf: &str, key: &[u8]);
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

pub trait KvStore: Send + Sync {
    fn write_batch(&self) -> Box<dyn KvWriteBatch + '_>;
    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn iterator_prefix<'a>(
        &'a self,
        cf: &str,
        prefix: &[u8],
    ) -> Result<Box<dyn Iterator<Item = (Box<[u8]>, Box<[u8]>)> + 'a>, StoreError>;
}

pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_background_jobs(4);

        let cf_descriptors: Vec<rocksdb::ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| rocksdb::ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn cf_handle(&self, name: &str) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
        let name = Self::static_name(name)?;
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    fn static_name(cf: &str) -> Result<&'static str, StoreError> {
        COLUMN_FAMILIES
            .iter()
            .find(|&&name| name == cf)
            .copied()
            .ok_or(StoreError::MissingColumnFamily("unknown"))
    }

    pub fn raw(&self) -> Arc<DB> {
        self.db.clone()
    }
}

enum Op {
    Put { cf: String, key: Vec<u8>, value: Vec<u8> },
    Delete { cf: String, key: Vec<u8> },
}

pub struct RocksWriteBatch<'a> {
    store: &'a RocksStore,
    ops: Vec<Op>,
}

impl<'a> KvWriteBatch for RocksWriteBatch<'a> {
    fn put(&mut self, cf: &str, key: &[u8], value: &[u8]) {
        self.ops.push(Op::Put {
            cf: cf.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    fn delete(&mut self, cf: &str, key: &[u8]) {
        self.ops.push(Op::Delete {
            cf: cf.to_string(),
            key: key.to_vec(),
        });
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut wb = rocksdb::WriteBatch::default();
        for op in self.ops {
            match op {
                Op::Put { cf, key, value } => {
                    let handle = self.store.cf_handle(&cf)?;
                    wb.put_cf(&handle, key, value);
                }
                Op::Delete { cf, key } => {
                    let handle = self.store.cf_handle(&cf)?;
                    wb.delete_cf(&handle, key);
                }
            }
        }
        self.store.db.write(wb)?;
        Ok(())
    }
}

impl KvStore for RocksStore {
    fn write_batch(&self) -> Box<dyn KvWriteBatch + '_> {
        Box::new(RocksWriteBatch {
            store: self,
            ops: Vec::new(),
        })
    }

    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let handle = self.cf_handle(cf)?;
        Ok(self.db.get_cf(&handle, key)?)
    }

    fn iterator_prefix<'a>(
        &'a self,
        cf: &str,
        prefix: &[u8],
    ) -> Result<Box<dyn Iterator<Item = (Box<[u8]>, Box<[u8]>)> + 'a>, StoreError> {
        let handle = self.cf_handle(cf)?;
        let prefix_owned = prefix.to_vec();
        let iter = self
            .db
            .iterator_cf(
                &handle,
                IteratorMode::From(&prefix_owned, rocksdb::Direction::Forward),
            )
            .filter_map(|item| item.ok())
            .take_while(move |(k, _)| k.starts_with(&prefix_owned));
        Ok(Box::new(iter))
    }
}
