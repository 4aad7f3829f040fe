use std::fmt::Write;
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::UsageConfig;

use super::sample::Counter;

/// One loosely typed result row.
pub type Row = serde_json::Map<String, Value>;

/// Callback type for recording request metrics: (endpoint, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Source table holding interface counter samples.
pub const COUNTERS_TABLE: &str = "intfCounters";

/// SQL-speaking time-series source.
pub trait TimeSeriesClient: Send + Sync + 'static {
    /// Runs a SQL query and returns rows as field maps.
    fn query_sql(&self, sql: &str) -> impl Future<Output = Result<Vec<Row>>> + Send;
}

/// InfluxDB v3 client using the `/api/v3/query_sql` endpoint.
pub struct InfluxClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    database: String,
    metrics: Option<MetricsCallback>,
}

impl InfluxClient {
    /// Create a new client for the configured database.
    pub fn new(cfg: &UsageConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(120)
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
            token: cfg.token.clone(),
            database: cfg.bucket.clone(),
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
            cb("query_sql", status, duration);
        }
    }
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    db: &'a str,
    q: &'a str,
    format: &'static str,
}

impl TimeSeriesClient for InfluxClient {
    async fn query_sql(&self, sql: &str) -> Result<Vec<Row>> {
        let start = Instant::now();
        let url = format!("{}/api/v3/query_sql", self.endpoint);
        debug!(len = sql.len(), "running time-series query");

        let mut request = self.http.post(&url).json(&QueryRequest {
            db: &self.database,
            q: sql,
            format: "json",
        });
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                self.record_request("error", start.elapsed());
                return Err(e).context("requesting query_sql");
            }
        };

        let status_code = response.status();
        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request("error", start.elapsed());
            bail!("unexpected status {} from query_sql: {}", status_code, body);
        }

        let rows: Vec<Row> = response
            .json()
            .await
            .context("decoding query_sql response")?;

        self.record_request("success", start.elapsed());

        Ok(rows)
    }
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// All counter samples in `[start, end)`.
pub fn window_query(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let mut sql = String::from("SELECT time, dzd_pubkey, host, intf, model_name, serial_number");
    for counter in Counter::ALL {
        let _ = write!(sql, ", \"{}\"", counter.source_name());
    }
    let _ = write!(
        sql,
        " FROM \"{COUNTERS_TABLE}\" WHERE time >= '{}' AND time < '{}'",
        rfc3339(start),
        rfc3339(end)
    );
    sql
}

/// Last non-null value of one counter per key in `[lookback_start, before)`.
pub fn baseline_query(
    counter: Counter,
    lookback_start: DateTime<Utc>,
    before: DateTime<Utc>,
) -> String {
    let field = counter.source_name();
    format!(
        "SELECT dzd_pubkey, intf, \"{field}\" AS value FROM (\
         SELECT dzd_pubkey, intf, \"{field}\", \
         ROW_NUMBER() OVER (PARTITION BY dzd_pubkey, intf ORDER BY time DESC) AS rn \
         FROM \"{COUNTERS_TABLE}\" \
         WHERE time >= '{}' AND time < '{}' AND \"{field}\" IS NOT NULL\
         ) ranked WHERE rn = 1",
        rfc3339(lookback_start),
        rfc3339(before)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_query_lists_all_counters() {
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap();
        let sql = window_query(start, end);

        for counter in Counter::ALL {
            assert!(sql.contains(&format!("\"{}\"", counter.source_name())));
        }
        assert!(sql.contains("FROM \"intfCounters\""));
        assert!(sql.contains("time >= '2024-01-15T10:00:00.000000000Z'"));
        assert!(sql.contains("time < '2024-01-15T11:00:00.000000000Z'"));
    }

    #[test]
    fn test_baseline_query_ranks_latest_per_key() {
        let before = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let lookback = Utc.with_ymd_and_hms(2014, 1, 15, 10, 0, 0).unwrap();
        let sql = baseline_query(Counter::InErrors, lookback, before);

        assert!(sql.contains("\"in-errors\" AS value"));
        assert!(sql.contains("PARTITION BY dzd_pubkey, intf ORDER BY time DESC"));
        assert!(sql.contains("\"in-errors\" IS NOT NULL"));
        assert!(sql.ends_with("WHERE rn = 1"));
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let cfg = UsageConfig {
            endpoint: "http://influx:8181/".to_string(),
            bucket: "telemetry".to_string(),
            ..Default::default()
        };
        let client = InfluxClient::new(&cfg).expect("should build");
        assert_eq!(client.endpoint, "http://influx:8181");
        assert_eq!(client.database, "telemetry");
    }
}
