use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::RpcConfig;

/// Callback type for recording request metrics: (method, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Chain JSON-RPC methods used by the indexer.
pub trait SolanaRpc: Send + Sync + 'static {
    fn get_epoch_info(&self) -> impl Future<Output = Result<EpochInfo>> + Send;

    fn get_cluster_nodes(&self) -> impl Future<Output = Result<Vec<ClusterNode>>> + Send;

    fn get_vote_accounts(&self) -> impl Future<Output = Result<VoteAccounts>> + Send;
}

/// JSON-RPC 2.0 client over HTTP.
pub struct SolanaClient {
    http: reqwest::Client,
    endpoint: String,
    metrics: Option<MetricsCallback>,
}

impl SolanaClient {
    /// Create a new chain RPC client.
    pub fn new(cfg: &RpcConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, method: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(method, status, duration);
        }
    }

    /// Perform a JSON-RPC call and deserialize its `result`.
    async fn call<T: DeserializeOwned>(&self, method: &'static str, params: Value) -> Result<T> {
        let start = Instant::now();
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let response = match self.http.post(&self.endpoint).json(&request).send().await {
            Ok(r) => r,
            Err(e) => {
                self.record_request(method, "error", start.elapsed());
                return Err(e).with_context(|| format!("requesting {method}"));
            }
        };

        let status_code = response.status();
        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request(method, "error", start.elapsed());
            bail!("unexpected status {} from {}: {}", status_code, method, body);
        }

        let body: RpcResponse<T> = response
            .json()
            .await
            .with_context(|| format!("decoding response from {method}"))?;

        match body.into_result(method) {
            Ok(result) => {
                self.record_request(method, "success", start.elapsed());
                Ok(result)
            }
            Err(e) => {
                self.record_request(method, "error", start.elapsed());
                Err(e)
            }
        }
    }
}

impl SolanaRpc for SolanaClient {
    async fn get_epoch_info(&self) -> Result<EpochInfo> {
        self.call("getEpochInfo", json!([{"commitment": "finalized"}])).await
    }

    async fn get_cluster_nodes(&self) -> Result<Vec<ClusterNode>> {
        self.call("getClusterNodes", json!([])).await
    }

    async fn get_vote_accounts(&self) -> Result<VoteAccounts> {
        self.call("getVoteAccounts", json!([{"commitment": "finalized"}])).await
    }
}

// --- JSON-RPC envelope ---

#[derive(Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl<T> RpcResponse<T> {
    fn into_result(self, method: &str) -> Result<T> {
        if let Some(err) = self.error {
            bail!("{method} failed with code {}: {}", err.code, err.message);
        }
        self.result.ok_or_else(|| anyhow!("{method} returned no result"))
    }
}

// --- JSON response structures ---

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EpochInfo {
    pub epoch: u64,
    pub slot_index: u64,
    pub slots_in_epoch: u64,
    pub absolute_slot: u64,
    pub block_height: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterNode {
    pub pubkey: String,
    pub gossip: Option<String>,
    pub tpu_quic: Option<String>,
    pub rpc: Option<String>,
    pub version: Option<String>,
    pub shred_version: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoteAccount {
    pub vote_pubkey: String,
    pub node_pubkey: String,
    pub activated_stake: u64,
    pub epoch_vote_account: bool,
    pub commission: u8,
    pub last_vote: u64,
    pub root_slot: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VoteAccounts {
    pub current: Vec<VoteAccount>,
    pub delinquent: Vec<VoteAccount>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_response_result() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"epoch":812,"slotIndex":10,"slotsInEpoch":432000,"absoluteSlot":350000000,"blockHeight":1}}"#;
        let resp: RpcResponse<EpochInfo> = serde_json::from_str(body).expect("decodes");
        let info = resp.into_result("getEpochInfo").expect("has result");
        assert_eq!(info.epoch, 812);
        assert_eq!(info.slots_in_epoch, 432_000);
    }

    #[test]
    fn test_rpc_response_error() {
        let body = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}"#;
        let resp: RpcResponse<EpochInfo> = serde_json::from_str(body).expect("decodes");
        let err = resp.into_result("getEpochInfo").expect_err("rpc error");
        assert_eq!(
            err.to_string(),
            "getEpochInfo failed with code -32601: Method not found"
        );
    }

    #[test]
    fn test_cluster_nodes_decode_nulls() {
        let body = r#"[{"pubkey":"n1","gossip":"10.0.0.1:8001","tpuQuic":null,"version":"2.1.0","shredVersion":50093}]"#;
        let nodes: Vec<ClusterNode> = serde_json::from_str(body).expect("decodes");
        assert_eq!(nodes[0].gossip.as_deref(), Some("10.0.0.1:8001"));
        assert_eq!(nodes[0].tpu_quic, None);
        assert_eq!(nodes[0].shred_version, Some(50093));
    }
}
