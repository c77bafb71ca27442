//! Prometheus instrumentation for the indexing pipeline. Registered against
//! a dedicated registry (not the process-global default) and scraped by
//! `main.rs`'s `/metrics` handler.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref BLOCKS_PROCESSED: IntCounter = IntCounter::new(
        "chainidx_blocks_processed_total",
        "Total blocks applied via advance"
    ).unwrap();

    pub static ref TRANSACTIONS_PROCESSED: IntCounter = IntCounter::new(
        "chainidx_transactions_processed_total",
        "Total transactions processed"
    ).unwrap();

    pub static ref UTXOS_ADDED: IntCounter = IntCounter::new(
        "chainidx_utxos_added_total",
        "Total UTXOs created"
    ).unwrap();

    pub static ref UTXOS_SPENT: IntCounter = IntCounter::new(
        "chainidx_utxos_spent_total",
        "Total UTXOs spent"
    ).unwrap();

    pub static ref REORGS: IntCounter = IntCounter::new(
        "chainidx_reorgs_total",
        "Total chain reorganizations handled"
    ).unwrap();

    pub static ref REORG_DEPTH: IntCounterVec = IntCounterVec::new(
        Opts::new("chainidx_reorg_depth_blocks", "Heights undone per reorg"),
        &["trigger"]
    ).unwrap();

    pub static ref CHAIN_TIP_HEIGHT: IntGauge = IntGauge::new(
        "chainidx_chain_tip_height",
        "Daemon-reported chain tip height"
    ).unwrap();

    pub static ref INDEXED_HEIGHT: IntGauge = IntGauge::new(
        "chainidx_indexed_height",
        "Height of the last block applied to the index"
    ).unwrap();

    pub static ref UTXO_FLUSH_COUNT: IntGauge = IntGauge::new(
        "chainidx_utxo_flush_count",
        "Number of UTXO-table flushes since the store was created"
    ).unwrap();

    pub static ref PREFETCH_CACHE_BYTES: IntGauge = IntGauge::new(
        "chainidx_prefetch_cache_bytes",
        "Bytes of prefetched block data currently awaiting processing"
    ).unwrap();

    pub static ref BLOCK_PARSE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("chainidx_block_parse_duration_seconds", "Coin::block() decode latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    pub static ref ADVANCE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("chainidx_advance_duration_seconds", "advance_blocks() latency per batch")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    pub static ref FLUSH_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("chainidx_flush_duration_seconds", "flush coordinator commit latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["mode"]
    ).unwrap();

    pub static ref DAEMON_RPC_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("chainidx_daemon_rpc_duration_seconds", "Daemon RPC call latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["method"]
    ).unwrap();
}

/// Register every metric with `REGISTRY`. Called once at startup; panics on
/// a duplicate registration, which would indicate a programming error.
pub fn register_all() {
    REGISTRY.register(Box::new(BLOCKS_PROCESSED.clone())).unwrap();
    REGISTRY.register(Box::new(TRANSACTIONS_PROCESSED.clone())).unwrap();
    REGISTRY.register(Box::new(UTXOS_ADDED.clone())).unwrap();
    REGISTRY.register(Box::new(UTXOS_SPENT.clone())).unwrap();
    REGISTRY.register(Box::new(REORGS.clone())).unwrap();
    REGISTRY.register(Box::new(REORG_DEPTH.clone())).unwrap();
    REGISTRY.register(Box::new(CHAIN_TIP_HEIGHT.clone())).unwrap();
    REGISTRY.register(Box::new(INDEXED_HEIGHT.clone())).unwrap();
    REGISTRY.register(Box::new(UTXO_FLUSH_COUNT.clone())).unwrap();
    REGISTRY.register(Box::new(PREFETCH_CACHE_BYTES.clone())).unwrap();
    REGISTRY.register(Box::new(BLOCK_PARSE_DURATION.clone())).unwrap();
    REGISTRY.register(Box::new(ADVANCE_DURATION.clone())).unwrap();
    REGISTRY.register(Box::new(FLUSH_DURATION.clone())).unwrap();
    REGISTRY.register(Box::new(DAEMON_RPC_DURATION.clone())).unwrap();
}

/// Render the registry in Prometheus text exposition format.
pub fn gather_text() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
