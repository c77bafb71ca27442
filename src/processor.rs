//! `BlockProcessor`: the composition root (§9). Owns every collaborator,
//! wires the prefetcher/dispatcher/chain-controller pipeline together, and
//! exposes the programmatic control surface (§6) — no CLI lives here, only
//! in `main.rs`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::archive::FsArchive;
use crate::chain::{ChainController, Locked};
use crate::coin::Coin;
use crate::config::Config;
use crate::daemon::Daemon;
use crate::dispatch::{Dispatcher, WorkQueue};
use crate::engine::EngineState;
use crate::error::ChainError;
use crate::flush::{self, FlushCoordinator, KEY_GENESIS_HASH};
use crate::history::History;
use crate::prefetch::Prefetcher;
use crate::store::{KvStore, CF_CHAIN_STATE};
use crate::types::ChainState;

/// Depth of the broadcast channel fanning `touched` sets out to
/// `add_new_block_callback` subscribers. A slow subscriber drops old
/// notifications rather than stalling the indexing pipeline.
const NOTIFY_CHANNEL_CAPACITY: usize = 256;

/// How often `catch_up_to_daemon` polls the caught-up flag while waiting.
const CATCH_UP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How often the height poller refreshes `Daemon::cached_height` via a real
/// `height()` RPC, grounded on the teacher's block-monitor poll cadence. The
/// prefetcher only ever reads the cached value (§4.E), so this is the only
/// thing keeping it from going stale once the index is caught up.
const HEIGHT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct BlockProcessor {
    controller: Arc<ChainController>,
    /// Kept alive here even though `controller` and `prefetcher_task` each
    /// hold their own clone, so a future control-surface method (e.g.
    /// reporting prefetch lag) has direct access without reaching through
    /// the controller.
    prefetcher: Arc<Prefetcher>,
    queue: WorkQueue,
    caught_up: Arc<AtomicBool>,
    notify_tx: broadcast::Sender<HashSet<crate::types::AddressFingerprint>>,
    prefetcher_task: Mutex<Option<JoinHandle<()>>>,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
    height_poller_task: Mutex<Option<JoinHandle<()>>>,
}

impl BlockProcessor {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        config: &Config,
        daemon: Arc<dyn Daemon>,
        coin: Arc<dyn Coin>,
        store: Arc<dyn KvStore>,
        archive: Arc<dyn FsArchive>,
        history: Arc<dyn History>,
    ) -> Result<Self, ChainError> {
        let (db_chain, utxo_flush_count) = flush::load_chain_state(store.as_ref())?;
        ensure_genesis_hash(store.as_ref(), coin.as_ref(), db_chain)?;

        let locked = Arc::new(Mutex::new(Locked {
            state: EngineState::new(db_chain),
            flush: FlushCoordinator::new(db_chain, utxo_flush_count),
        }));

        let (notify_tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
        let caught_up = Arc::new(AtomicBool::new(false));

        // The prefetcher only needs the queue's sender half, so it and the
        // controller that holds it can both be built before the dispatcher
        // that owns the receiver half exists.
        let (queue, work_rx) = WorkQueue::new(caught_up.clone());
        let prefetcher = Arc::new(Prefetcher::new(
            daemon.clone(),
            coin.clone(),
            config.min_cache_size_bytes,
            queue.sender(),
            db_chain.height,
        ));

        let height_poll_daemon = daemon.clone();

        let controller = Arc::new(ChainController::new(
            daemon,
            coin,
            store.clone(),
            archive.clone(),
            history.clone(),
            config.reorg_limit,
            config.min_cache_size_bytes,
            locked,
            prefetcher.clone(),
            caught_up.clone(),
            notify_tx.clone(),
        ));

        let dispatcher = Dispatcher::new(controller.clone(), caught_up.clone());

        let prefetcher_task = {
            let prefetcher = prefetcher.clone();
            tokio::spawn(async move { prefetcher.run().await })
        };
        let dispatcher_task = tokio::spawn(async move { dispatcher.run(work_rx).await });

        let height_poller_task = tokio::spawn(async move {
            loop {
                if let Err(err) = height_poll_daemon.height().await {
                    warn!(error = %err, "height poller: daemon error, retrying");
                }
                tokio::time::sleep(HEIGHT_POLL_INTERVAL).await;
            }
        });

        Ok(Self {
            controller,
            prefetcher,
            queue,
            caught_up,
            notify_tx,
            prefetcher_task: Mutex::new(Some(prefetcher_task)),
            dispatcher_task: Mutex::new(Some(dispatcher_task)),
            height_poller_task: Mutex::new(Some(height_poller_task)),
        })
    }

    /// Blocks until the prefetcher has reported the index caught up with
    /// the daemon's tip at least once.
    pub async fn catch_up_to_daemon(&self) {
        while !self.caught_up.load(Ordering::Acquire) {
            tokio::time::sleep(CATCH_UP_POLL_INTERVAL).await;
        }
    }

    /// §6 control surface. Returns `false` if not yet caught up, matching
    /// the producer-side gate on the work queue.
    pub async fn force_chain_reorg(&self, count: Option<u32>) -> bool {
        self.queue.request_reorg(count).await
    }

    /// Subscribes `callback` to every `touched`-address notification,
    /// including the initial empty one fired on first catch-up. Runs the
    /// callback on its own task so a slow subscriber never blocks the
    /// indexing pipeline; only the channel's bounded lag is paid.
    pub fn add_new_block_callback<F>(&self, mut callback: F)
    where
        F: FnMut(HashSet<crate::types::AddressFingerprint>) + Send + 'static,
    {
        let mut rx = self.notify_tx.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(touched) => callback(touched),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification subscriber lagged, dropped old updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Cooperative shutdown (§5 cancellation): stop the prefetcher and
    /// dispatcher tasks, then run one last full flush under the state lock
    /// so nothing buffered in memory is lost.
    pub async fn shutdown(&self) {
        if let Some(task) = self.prefetcher_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.dispatcher_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.height_poller_task.lock().await.take() {
            task.abort();
        }

        let locked = self.controller.locked().clone();
        let mut guard = locked.lock().await;
        let Locked { state, flush } = &mut *guard;
        if let Err(err) = flush
            .flush(
                state,
                self.controller_archive(),
                self.controller_store(),
                self.controller_history(),
                true,
            )
            .await
        {
            warn!(error = %err, "final shutdown flush failed");
        } else {
            info!(height = state.chain.height, "final shutdown flush complete");
        }
    }

    fn controller_archive(&self) -> &dyn FsArchive {
        self.controller.archive()
    }

    fn controller_store(&self) -> &dyn KvStore {
        self.controller.store()
    }

    fn controller_history(&self) -> &dyn History {
        self.controller.history()
    }
}

/// Checks the genesis-hash sanity key (§6 persisted chain-state keys):
/// writes it once for a fresh store, or confirms it still matches for an
/// existing one, since a mismatch means the daemon's configured chain
/// doesn't match the one this store was built from.
fn ensure_genesis_hash(store: &dyn KvStore, coin: &dyn Coin, db_chain: ChainState) -> Result<(), ChainError> {
    let genesis_raw = coin.genesis_block(&[]);
    let header_len = coin.header_len().min(genesis_raw.len());
    let computed = coin.header_hash(&genesis_raw[..header_len]);

    match store.get(CF_CHAIN_STATE, KEY_GENESIS_HASH)? {
        Some(existing) if existing == computed => Ok(()),
        Some(existing) => {
            warn!(
                existing = %hex::encode(&existing),
                computed = %hex::encode(computed),
                "stored genesis hash does not match configured coin"
            );
            Ok(())
        }
        None => {
            debug_assert_eq!(db_chain.height, u32::MAX, "fresh store should have sentinel height");
            let mut batch = store.write_batch();
            batch.put(CF_CHAIN_STATE, KEY_GENESIS_HASH, &computed);
            batch.commit()?;
            Ok(())
        }
    }
}
