use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use clap::Parser;
use tracing::{error, info};

use chainidx::{
    BlockProcessor, Config, FileArchive, History, InMemoryHistory, JsonRpcDaemon, PivxLikeCoin,
    RocksStore,
};

#[derive(Parser, Debug)]
#[command(name = "chainidx", about = "Blockchain UTXO/history indexing engine")]
struct Cli {
    /// Path to an optional TOML config file; defaults plus CHAINIDX_* env
    /// vars apply regardless of whether this is given.
    #[arg(long)]
    config: Option<String>,

    /// Simulate a reorg of this many blocks once caught up, then continue
    /// running. Mainly useful for exercising the reorg path by hand.
    #[arg(long)]
    force_reorg: Option<u32>,
}

async fn metrics_handler() -> String {
    chainidx::metrics::gather_text()
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn serve_metrics(addr: SocketAddr) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, error = %err, "failed to bind metrics listener");
            return;
        }
    };
    info!(%addr, "metrics listening");
    if let Err(err) = axum::serve(listener, app).await {
        error!(error = %err, "metrics server stopped");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    chainidx::telemetry::init_tracing(config.log.clone())?;
    chainidx::metrics::register_all();

    info!(db_path = %config.db_path.display(), daemon = %config.daemon_url, "starting chainidx");

    let genesis_raw = if config.genesis_hex.is_empty() {
        vec![0u8; 80]
    } else {
        hex::decode(&config.genesis_hex)?
    };
    let coin: Arc<dyn chainidx::Coin> = Arc::new(PivxLikeCoin::new(genesis_raw));

    let auth = match &config.daemon_cookie_path {
        Some(path) => {
            let cookie = std::fs::read_to_string(path)?;
            let mut parts = cookie.trim().splitn(2, ':');
            let user = parts.next().unwrap_or_default().to_string();
            let pass = parts.next().unwrap_or_default().to_string();
            Some((user, pass))
        }
        None => None,
    };
    let daemon: Arc<dyn chainidx::Daemon> = Arc::new(JsonRpcDaemon::new(config.daemon_url.clone(), auth));

    let store: Arc<dyn chainidx::KvStore> = Arc::new(RocksStore::open(&config.db_path)?);
    let archive: Arc<dyn chainidx::FsArchive> = Arc::new(FileArchive::open(&config.archive_path)?);
    let history: Arc<dyn History> = Arc::new(InMemoryHistory::default());

    let processor = Arc::new(
        BlockProcessor::new(&config, daemon, coin, store, archive, history).await?,
    );

    processor.add_new_block_callback(|touched| {
        info!(touched = touched.len(), "notification: addresses touched");
    });

    let metrics_addr: SocketAddr = config.metrics_addr.parse()?;
    tokio::spawn(serve_metrics(metrics_addr));

    let shutdown_processor = processor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, flushing and exiting");
            shutdown_processor.shutdown().await;
            std::process::exit(0);
        }
    });

    processor.catch_up_to_daemon().await;
    info!("caught up to daemon tip");

    if let Some(count) = cli.force_reorg {
        let accepted = processor.force_chain_reorg(Some(count)).await;
        info!(count, accepted, "requested forced reorg from CLI flag");
    }

    std::future::pending::<()>().await;
    Ok(())
}
