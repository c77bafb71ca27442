//! Error categories for the indexing core.
//!
//! Three families, matching the design's error-handling split: transient
//! daemon errors (retried by the prefetcher), fatal chain errors (propagated
//! out of the blocking executor and surfaced by the dispatcher), and the
//! storage-layer errors both of those wrap.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("missing utxo for (tx_hash={tx_hash}, idx={idx})")]
    MissingUtxo { tx_hash: String, idx: u16 },

    #[error("header/prevhash mismatch at height {height}: expected {expected}, got {actual}")]
    ChainMismatch {
        height: u32,
        expected: String,
        actual: String,
    },

    #[error("undo cursor did not land on zero for height {height}: {remaining} bytes left")]
    MissingUndo { height: u32, remaining: usize },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("block decode error: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("unexpected response shape: {0}")]
    BadResponse(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("column family {0} not found")]
    MissingColumnFamily(&'static str),

    #[error("malformed key/value in column family {cf}: {detail}")]
    Malformed { cf: &'static str, detail: String },
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("height {0} not present in archive")]
    HeightNotFound(u32),

    #[error("tx ordinal {0} not present in archive")]
    OrdinalNotFound(u32),

    #[error("corrupt archive record: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Source(#[from] config::ConfigError),

    #[error("invalid value for {field}: {detail}")]
    Invalid { field: &'static str, detail: String },
}
