use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::config::RpcConfig;

/// Callback type for recording request metrics: (endpoint, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Source of the serviceability program state.
pub trait ProgramDataSource: Send + Sync + 'static {
    /// Fetch every account the topology is built from.
    fn get_program_data(&self) -> impl Future<Output = Result<ProgramData>> + Send;
}

/// HTTP client for the serviceability program-data endpoint.
pub struct ServiceabilityClient {
    http: reqwest::Client,
    endpoint: String,
    metrics: Option<MetricsCallback>,
}

impl ServiceabilityClient {
    /// Create a new serviceability client.
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
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }
}

impl ProgramDataSource for ServiceabilityClient {
    async fn get_program_data(&self) -> Result<ProgramData> {
        let start = Instant::now();
        let url = format!("{}/v1/program-data", self.endpoint);

        let response = match self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.record_request("program_data", "error", start.elapsed());
                return Err(e).context("requesting program data");
            }
        };

        let status_code = response.status();
        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request("program_data", "error", start.elapsed());
            bail!("unexpected status {} from program data: {}", status_code, body);
        }

        let data: ProgramData = response
            .json()
            .await
            .context("decoding program data")?;

        self.record_request("program_data", "success", start.elapsed());
        debug!(duration = ?start.elapsed(), "fetched program data");

        Ok(data)
    }
}

// --- JSON response structures ---

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgramData {
    pub contributors: Vec<RawContributor>,
    pub devices: Vec<RawDevice>,
    pub exchanges: Vec<RawExchange>,
    pub links: Vec<RawLink>,
    pub users: Vec<RawUser>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawContributor {
    pub pubkey: String,
    pub code: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawInterface {
    pub name: String,
    pub ip_net: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawDevice {
    pub pubkey: String,
    pub status: String,
    pub device_type: String,
    pub code: String,
    pub public_ip: String,
    pub contributor_pubkey: String,
    pub exchange_pubkey: String,
    pub max_users: i64,
    pub interfaces: Vec<RawInterface>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawExchange {
    pub pubkey: String,
    pub code: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawLink {
    pub pubkey: String,
    pub status: String,
    pub code: String,
    pub tunnel_net: String,
    pub contributor_pubkey: String,
    pub side_a_pubkey: String,
    pub side_z_pubkey: String,
    pub side_a_iface_name: String,
    pub side_z_iface_name: String,
    pub link_type: String,
    pub delay_ns: i64,
    pub jitter_ns: i64,
    pub bandwidth: i64,
    pub delay_override_ns: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawUser {
    pub pubkey: String,
    pub owner: String,
    pub status: String,
    pub user_type: String,
    pub client_ip: String,
    pub dz_ip: String,
    pub device_pubkey: String,
    pub tunnel_id: i64,
}
