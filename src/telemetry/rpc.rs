use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::TelemetryConfig;

/// Callback type for recording request metrics: (endpoint, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Identity of one directional latency series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub origin_device_pk: String,
    pub target_device_pk: String,
    pub link_pk: String,
}

/// Latency samples of one series for one epoch.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LatencySamples {
    pub epoch: u64,
    pub start_timestamp_us: i64,
    pub sampling_interval_us: i64,
    /// Index of `samples[0]` within the epoch.
    pub start_index: i64,
    /// Round-trip times in microseconds; 0 means the probe was lost.
    pub samples: Vec<u32>,
}

/// Source of device-link latency samples.
pub trait LatencySource: Send + Sync + 'static {
    /// Samples of `key` in `epoch` with an index above `after`.
    ///
    /// Returns `None` when the series does not exist.
    fn samples_after(
        &self,
        key: &SeriesKey,
        epoch: u64,
        after: Option<i64>,
    ) -> impl Future<Output = Result<Option<LatencySamples>>> + Send;
}

/// HTTP client for the telemetry program endpoint.
pub struct TelemetryClient {
    http: reqwest::Client,
    endpoint: String,
    metrics: Option<MetricsCallback>,
}

impl TelemetryClient {
    /// Create a new telemetry client.
    pub fn new(cfg: &TelemetryConfig) -> Result<Self> {
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

    fn record_request(&self, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb("latency_samples", status, duration);
        }
    }
}

impl LatencySource for TelemetryClient {
    async fn samples_after(
        &self,
        key: &SeriesKey,
        epoch: u64,
        after: Option<i64>,
    ) -> Result<Option<LatencySamples>> {
        let start = Instant::now();
        let url = format!("{}/v1/device-latency-samples", self.endpoint);

        let mut query = vec![
            ("origin", key.origin_device_pk.clone()),
            ("target", key.target_device_pk.clone()),
            ("link", key.link_pk.clone()),
            ("epoch", epoch.to_string()),
        ];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }

        let response = match self
            .http
            .get(&url)
            .query(&query)
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.record_request("error", start.elapsed());
                return Err(e).context("requesting latency samples");
            }
        };

        let status_code = response.status();
        if status_code == StatusCode::NOT_FOUND {
            self.record_request("not_found", start.elapsed());
            return Ok(None);
        }
        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request("error", start.elapsed());
            bail!("unexpected status {} from latency samples: {}", status_code, body);
        }

        let samples: LatencySamples = response
            .json()
            .await
            .context("decoding latency samples")?;

        self.record_request("success", start.elapsed());

        Ok(Some(samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_samples_decode() {
        let body = r#"{
            "epoch": 812,
            "startTimestampUs": 1700000000000000,
            "samplingIntervalUs": 5000000,
            "startIndex": 10,
            "samples": [1200, 0, 1350]
        }"#;
        let samples: LatencySamples = serde_json::from_str(body).expect("decodes");
        assert_eq!(samples.epoch, 812);
        assert_eq!(samples.sampling_interval_us, 5_000_000);
        assert_eq!(samples.start_index, 10);
        assert_eq!(samples.samples, vec![1200, 0, 1350]);
    }
}
