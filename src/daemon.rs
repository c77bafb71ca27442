//! `Daemon`: the upstream node's RPC surface as the core needs it. `height`
//! and `raw_blocks` are plain JSON-RPC calls against the daemon's HTTP
//! endpoint, following the request shape the teacher's monitor loop used
//! against its PIVX node.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use crate::error::DaemonError;
use crate::metrics::DAEMON_RPC_DURATION;

#[async_trait::async_trait]
pub trait Daemon: Send + Sync {
    async fn height(&self) -> Result<u32, DaemonError>;
    async fn cached_height(&self) -> u32;
    async fn block_hex_hashes(&self, first: u32, count: u32) -> Result<Vec<String>, DaemonError>;
    async fn raw_blocks(&self, hex_hashes: &[String]) -> Result<Vec<Vec<u8>>, DaemonError>;
}

/// A `Daemon` backed by a bitcoind-style JSON-RPC HTTP endpoint.
pub struct JsonRpcDaemon {
    client: reqwest::Client,
    url: String,
    auth: Option<(String, String)>,
    cached_height: AtomicU32,
}

impl JsonRpcDaemon {
    pub fn new(url: String, auth: Option<(String, String)>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            auth,
            cached_height: AtomicU32::new(0),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, DaemonError> {
        let start = Instant::now();
        let body = json!({
            "jsonrpc": "1.0",
            "id": "chainidx",
            "method": method,
            "params": params,
        });

        let mut req = self.client.post(&self.url).json(&body);
        if let Some((user, pass)) = &self.auth {
            req = req.basic_auth(user, Some(pass));
        }

        let resp = req.send().await?;
        let parsed: Value = resp.json().await?;
        DAEMON_RPC_DURATION
            .with_label_values(&[method])
            .observe(start.elapsed().as_secs_f64());

        if let Some(err) = parsed.get("error").filter(|e| !e.is_null()) {
            return Err(DaemonError::Rpc {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(-1),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown rpc error")
                    .to_string(),
            });
        }

        parsed
            .get("result")
            .cloned()
            .ok_or_else(|| DaemonError::BadResponse("missing result field".into()))
    }
}

#[async_trait::async_trait]
impl Daemon for JsonRpcDaemon {
    async fn height(&self) -> Result<u32, DaemonError> {
        let result = self.call("getblockcount", json!([])).await?;
        let height = result
            .as_u64()
            .ok_or_else(|| DaemonError::BadResponse("getblockcount did not return a number".into()))?
            as u32;
        self.cached_height.store(height, Ordering::Relaxed);
        Ok(height)
    }

    async fn cached_height(&self) -> u32 {
        self.cached_height.load(Ordering::Relaxed)
    }

    async fn block_hex_hashes(&self, first: u32, count: u32) -> Result<Vec<String>, DaemonError> {
        let mut out = Vec::with_capacity(count as usize);
        for height in first..first + count {
            let result = self.call("getblockhash", json!([height])).await?;
            let hash = result
                .as_str()
                .ok_or_else(|| DaemonError::BadResponse("getblockhash did not return a string".into()))?
                .to_string();
            out.push(hash);
        }
        Ok(out)
    }

    async fn raw_blocks(&self, hex_hashes: &[String]) -> Result<Vec<Vec<u8>>, DaemonError> {
        let mut out = Vec::with_capacity(hex_hashes.len());
        for hash in hex_hashes {
            let result = self.call("getblock", json!([hash, 0])).await?;
            let hex_raw = result.as_str().ok_or_else(|| {
                DaemonError::BadResponse("getblock(verbosity=0) did not return hex".into())
            })?;
            let raw = hex::decode(hex_raw)
                .map_err(|e| DaemonError::BadResponse(format!("bad hex from daemon: {e}")))?;
            out.push(raw);
        }
        Ok(out)
    }
}
