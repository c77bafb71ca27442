//! Layered configuration: built-in defaults, an optional TOML file, then
//! `CHAINIDX_*` environment overrides. Deliberately not a global singleton
//! (see DESIGN.md's note on the §9 "no package-scope singletons" decision);
//! `main.rs` builds one `Config` and threads it explicitly to collaborators.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::telemetry::TelemetryConfig;

#[derive(Clone, Debug)]
pub struct Config {
    pub db_path: PathBuf,
    pub archive_path: PathBuf,
    pub daemon_url: String,
    pub daemon_cookie_path: Option<PathBuf>,
    pub reorg_limit: u32,
    pub min_cache_size_bytes: u64,
    pub flush_check_interval: Duration,
    pub metrics_addr: String,
    /// Hex-encoded raw genesis block for the configured `Coin`. Needed
    /// because historical chains often serialize block 0 with deviations
    /// their daemon special-cases internally (§4.E), so the engine can't
    /// rely on `getblock` for it and must be handed the canonical bytes.
    pub genesis_hex: String,
    pub log: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/db"),
            archive_path: PathBuf::from("./data/archive"),
            daemon_url: "http://127.0.0.1:8332".to_string(),
            daemon_cookie_path: None,
            reorg_limit: 200,
            min_cache_size_bytes: 10 * 1024 * 1024,
            flush_check_interval: Duration::from_secs(30),
            metrics_addr: "127.0.0.1:9100".to_string(),
            genesis_hex: String::new(),
            log: TelemetryConfig::default(),
        }
    }
}

impl Config {
    /// Build from (in increasing priority) built-in defaults, an optional
    /// TOML file at `path`, then `CHAINIDX_*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mut builder = config::Config::builder()
            .set_default("db_path", defaults.db_path.to_string_lossy().to_string())?
            .set_default(
                "archive_path",
                defaults.archive_path.to_string_lossy().to_string(),
            )?
            .set_default("daemon_url", defaults.daemon_url.clone())?
            .set_default("reorg_limit", defaults.reorg_limit as i64)?
            .set_default(
                "min_cache_size_bytes",
                defaults.min_cache_size_bytes as i64,
            )?
            .set_default(
                "flush_check_interval_secs",
                defaults.flush_check_interval.as_secs() as i64,
            )?
            .set_default("metrics_addr", defaults.metrics_addr.clone())?
            .set_default("genesis_hex", defaults.genesis_hex.clone())?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("CHAINIDX").separator("__"));

        let raw = builder.build()?;

        Ok(Self {
            db_path: PathBuf::from(raw.get_string("db_path")?),
            archive_path: PathBuf::from(raw.get_string("archive_path")?),
            daemon_url: raw.get_string("daemon_url")?,
            daemon_cookie_path: raw.get_string("daemon_cookie_path").ok().map(PathBuf::from),
            reorg_limit: raw.get_int("reorg_limit")? as u32,
            min_cache_size_bytes: raw.get_int("min_cache_size_bytes")? as u64,
            flush_check_interval: Duration::from_secs(
                raw.get_int("flush_check_interval_secs")? as u64,
            ),
            metrics_addr: raw.get_string("metrics_addr")?,
            genesis_hex: raw.get_string("genesis_hex")?,
            log: TelemetryConfig::from_env(),
        })
    }
}
