//! A blockchain indexing engine: ingests raw blocks from an upstream node,
//! maintains an on-disk UTXO set and per-address transaction history, and
//! rewinds that index when the upstream node reports a reorganization.
//!
//! The crate is organized around the six components of the indexing
//! pipeline — [`prefetch`], [`dispatch`], [`chain`], [`engine`], [`flush`],
//! [`utxo`] — plumbed together by [`processor::BlockProcessor`], the
//! composition root a binary constructs and drives.

pub mod archive;
pub mod chain;
pub mod coin;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod flush;
pub mod history;
pub mod metrics;
pub mod prefetch;
pub mod processor;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utxo;

pub use archive::{FileArchive, FsArchive};
pub use chain::ChainController;
pub use coin::{Coin, PivxLikeCoin};
pub use config::Config;
pub use daemon::{Daemon, JsonRpcDaemon};
pub use error::{ArchiveError, ChainError, ConfigError, DaemonError, StoreError};
pub use history::{History, InMemoryHistory};
pub use processor::BlockProcessor;
pub use store::{KvStore, RocksStore};
pub use types::{AddressFingerprint, ChainState, UtxoValue, WorkItem};
