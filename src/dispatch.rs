//! Work dispatcher (component 4.F): the single consumer that multiplexes
//! prefetch output, reorg requests, and the caught-up signal onto the
//! chain controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::error;

use crate::chain::ChainController;
use crate::types::WorkItem;

/// Bounded so a prefetcher running far ahead of a slow chain controller
/// applies backpressure through the channel rather than growing unbounded
/// memory; sized generously relative to `min_cache_size_bytes`'s usual
/// block-count equivalent.
pub const QUEUE_CAPACITY: usize = 64;

/// The producer side of the work queue: what the prefetcher and the
/// control surface (`force_chain_reorg`) hold to enqueue work.
pub struct WorkQueue {
    tx: mpsc::Sender<WorkItem>,
    caught_up: Arc<AtomicBool>,
}

impl WorkQueue {
    /// Builds the channel and its producer handle. Split out from
    /// `Dispatcher::new` so the prefetcher (which only needs the sender)
    /// and the chain controller (which the prefetcher is a field of) can
    /// both be constructed before the dispatcher itself exists.
    pub fn new(caught_up: Arc<AtomicBool>) -> (Self, mpsc::Receiver<WorkItem>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (Self { tx, caught_up }, rx)
    }

    pub fn sender(&self) -> mpsc::Sender<WorkItem> {
        self.tx.clone()
    }

    /// Producer-side gate (§4.F): a force-reorg request is rejected until
    /// the prefetcher's first caught-up signal, since there is no
    /// well-defined fork point to search for while still bulk-advancing.
    pub async fn request_reorg(&self, count: Option<u32>) -> bool {
        if !self.caught_up.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(WorkItem::ReorgChain { count }).await.is_ok()
    }
}

/// The single consumer loop.
pub struct Dispatcher {
    controller: Arc<ChainController>,
    caught_up: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(controller: Arc<ChainController>, caught_up: Arc<AtomicBool>) -> Self {
        Self { controller, caught_up }
    }

    /// Consumes `work_rx` until the channel closes (shutdown) or a fatal
    /// `ChainError` surfaces from the chain controller. Per §7, a fatal
    /// error is surfaced by logging and exiting the loop rather than
    /// attempting any further flush here — the flush path already ran
    /// inside whichever controller call failed, or didn't need to.
    pub async fn run(&self, mut work_rx: mpsc::Receiver<WorkItem>) {
        while let Some(item) = work_rx.recv().await {
            let result = match item {
                WorkItem::RawBlocks { blocks, first } => {
                    self.controller.check_and_advance_blocks(blocks, first).await
                }
                WorkItem::PrefetcherCaughtUp => {
                    self.caught_up.store(true, Ordering::Release);
                    self.controller.notify_caught_up();
                    Ok(())
                }
                WorkItem::ReorgChain { count } => self.controller.reorg_chain(count).await,
            };

            if let Err(err) = result {
                error!(error = %err, "fatal chain error, dispatcher stopping");
                return;
            }
        }
    }
}
