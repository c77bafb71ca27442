//! `History`: the per-address transaction-history sub-index. Out of scope
//! for this crate's own algorithms (§1), but the engine drives it at
//! specific points during advance/backup/flush, so the capability set is
//! defined here. `InMemoryHistory` is a minimal implementation used by
//! tests and the default binary wiring.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::types::AddressFingerprint;

#[async_trait::async_trait]
pub trait History: Send + Sync {
    async fn add_unflushed(
        &self,
        per_tx_fingerprints: &[Vec<AddressFingerprint>],
        starting_tx_count: u64,
    );
    async fn flush(&self) -> u64;
    async fn backup(&self, touched: &HashSet<AddressFingerprint>, tx_count: u64) -> u64;
    fn cancel_compaction(&self);
    fn unflushed_memsize(&self) -> usize;
    fn flush_count(&self) -> u64;
    fn assert_flushed(&self);
}

struct State {
    unflushed: HashMap<AddressFingerprint, Vec<u64>>,
    flushed: HashMap<AddressFingerprint, Vec<u64>>,
    flush_count: u64,
}

/// Keeps, per address fingerprint, the list of tx ordinals touching it.
/// Sufficient to exercise the engine's backup/flush contract without a real
/// secondary index.
pub struct InMemoryHistory {
    state: Mutex<State>,
}

impl Default for InMemoryHistory {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                unflushed: HashMap::new(),
                flushed: HashMap::new(),
                flush_count: 0,
            }),
        }
    }
}

#[async_trait::async_trait]
impl History for InMemoryHistory {
    async fn add_unflushed(
        &self,
        per_tx_fingerprints: &[Vec<AddressFingerprint>],
        starting_tx_count: u64,
    ) {
        let mut state = self.state.lock().expect("history mutex poisoned");
        for (i, fingerprints) in per_tx_fingerprints.iter().enumerate() {
            let tx_ordinal = starting_tx_count + i as u64;
            for fp in fingerprints {
                state.unflushed.entry(*fp).or_default().push(tx_ordinal);
            }
        }
    }

    async fn flush(&self) -> u64 {
        let mut state = self.state.lock().expect("history mutex poisoned");
        let touched = state.unflushed.len() as u64;
        for (fp, ordinals) in state.unflushed.drain() {
            state.flushed.entry(fp).or_default().extend(ordinals);
        }
        state.flush_count += 1;
        touched
    }

    async fn backup(&self, touched: &HashSet<AddressFingerprint>, tx_count: u64) -> u64 {
        let mut state = self.state.lock().expect("history mutex poisoned");
        let mut removed = 0u64;
        for fp in touched {
            if let Some(ordinals) = state.flushed.get_mut(fp) {
                let before = ordinals.len();
                ordinals.retain(|&ordinal| ordinal < tx_count);
                removed += (before - ordinals.len()) as u64;
            }
        }
        removed
    }

    fn cancel_compaction(&self) {}

    fn unflushed_memsize(&self) -> usize {
        let state = self.state.lock().expect("history mutex poisoned");
        state
            .unflushed
            .values()
            .map(|v| v.len() * std::mem::size_of::<u64>())
            .sum()
    }

    fn flush_count(&self) -> u64 {
        self.state.lock().expect("history mutex poisoned").flush_count
    }

    fn assert_flushed(&self) {
        let state = self.state.lock().expect("history mutex poisoned");
        assert!(state.unflushed.is_empty(), "history has unflushed entries");
    }
}
