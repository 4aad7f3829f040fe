pub mod baseline;
pub mod convert;
pub mod influx;
pub mod link;
pub mod sample;
pub mod store;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::with_cancel;
use crate::export::health::HealthMetrics;
use crate::view::Refresh;

use self::baseline::resolve_baselines;
use self::convert::convert;
use self::influx::{window_query, Row, TimeSeriesClient};
use self::link::build_link_lookup;
use self::sample::CounterSample;
use self::store::UsageStore;

/// Re-scan applied behind the last stored sample to pick up late arrivals.
pub const OVERLAP: chrono::Duration = chrono::Duration::minutes(5);

/// How a refresh picked its query start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    ColdStart,
    Incremental,
    Stalled,
}

impl WindowMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WindowMode::ColdStart => "cold_start",
            WindowMode::Incremental => "incremental",
            WindowMode::Stalled => "stalled",
        }
    }
}

/// Picks the query start for a refresh at `now`.
///
/// Resumes `overlap` behind `max_time` when it lies inside the rolling
/// window, otherwise restarts at the window's beginning.
pub fn select_window(
    max_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: chrono::Duration,
    overlap: chrono::Duration,
) -> (DateTime<Utc>, WindowMode) {
    let window_start = now - window;
    match max_time {
        None => (window_start, WindowMode::ColdStart),
        Some(max) if max > window_start => (max - overlap, WindowMode::Incremental),
        Some(_) => (window_start, WindowMode::Stalled),
    }
}

/// Converts source rows into time-ordered samples, dropping rows without a usable time.
pub fn parse_samples(rows: &[Row]) -> (Vec<CounterSample>, usize) {
    let mut samples: Vec<CounterSample> = rows.iter().filter_map(CounterSample::from_row).collect();
    let dropped = rows.len() - samples.len();
    samples.sort_by_key(|s| s.time);
    (samples, dropped)
}

/// Refresh body for the interface usage view.
pub struct UsageRefresher<S, T> {
    store: S,
    source: T,
    query_window: chrono::Duration,
    baseline_timeout: Duration,
    health: Arc<HealthMetrics>,
}

impl<S: UsageStore, T: TimeSeriesClient> UsageRefresher<S, T> {
    pub fn new(
        store: S,
        source: T,
        query_window: Duration,
        baseline_timeout: Duration,
        health: Arc<HealthMetrics>,
    ) -> Result<Self> {
        let query_window =
            chrono::Duration::from_std(query_window).context("query window out of range")?;
        Ok(Self {
            store,
            source,
            query_window,
            baseline_timeout,
            health,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn source(&self) -> &T {
        &self.source
    }

    fn count_rows(&self, stage: &str, n: usize) {
        self.health
            .usage_rows_total
            .with_label_values(&[stage])
            .inc_by(n as f64);
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let start = Instant::now();
        let now = Utc::now();

        let max_time = with_cancel(cancel, self.store.max_event_time())
            .await
            .context("querying max event time")?;
        let (query_start, mode) = select_window(max_time, now, self.query_window, OVERLAP);
        info!(
            mode = mode.as_str(),
            query_start = %query_start,
            max_time = ?max_time,
            "selected usage window"
        );

        let (baselines, source) = resolve_baselines(
            &self.store,
            &self.source,
            query_start,
            self.baseline_timeout,
            cancel,
        )
        .await?;
        self.health
            .usage_baseline_source_total
            .with_label_values(&[source.as_str()])
            .inc();

        let already_written = match with_cancel(cancel, self.store.max_time_by_key(query_start)).await {
            Ok(m) => Some(m),
            Err(e) if crate::error::is_cancelled(&e) => return Err(e),
            Err(e) => {
                warn!(error = %e, "failed to load written timestamps, proceeding without dedup");
                None
            }
        };

        let rows = with_cancel(cancel, self.source.query_sql(&window_query(query_start, now)))
            .await
            .context("querying counter window")?;
        let (samples, dropped) = parse_samples(&rows);
        self.count_rows("queried", rows.len());
        if dropped > 0 {
            debug!(dropped, "dropped rows without a parseable time");
        }

        let links = match with_cancel(cancel, self.store.current_link_endpoints()).await {
            Ok(links) => build_link_lookup(&links),
            Err(e) if crate::error::is_cancelled(&e) => return Err(e),
            Err(e) => {
                warn!(error = %e, "failed to load link lookup, proceeding without link info");
                Default::default()
            }
        };

        let usage = convert(&samples, &baselines, &links, already_written.as_ref());
        self.count_rows("converted", usage.len());

        if usage.is_empty() {
            warn!(queried = rows.len(), "no usage rows to insert");
            return Ok(());
        }

        let inserted = with_cancel(cancel, self.store.insert_usage(&usage, Utc::now()))
            .await
            .context("inserting usage rows")?;
        self.count_rows("inserted", inserted);

        info!(
            queried = rows.len(),
            converted = usage.len(),
            inserted,
            link_keys = links.len(),
            duration = ?start.elapsed(),
            "usage refresh complete"
        );
        Ok(())
    }
}

impl<S: UsageStore, T: TimeSeriesClient> Refresh for UsageRefresher<S, T> {
    async fn refresh(&self, cancel: &CancellationToken) -> Result<()> {
        self.run(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_select_window_cold_start() {
        let window = chrono::Duration::hours(1);
        let (start, mode) = select_window(None, now(), window, OVERLAP);
        assert_eq!(start, now() - window);
        assert_eq!(mode, WindowMode::ColdStart);
    }

    #[test]
    fn test_select_window_boundaries() {
        let window = chrono::Duration::hours(1);
        let one = chrono::Duration::seconds(1);

        let outside = now() - window - one;
        let (start, mode) = select_window(Some(outside), now(), window, OVERLAP);
        assert_eq!(start, now() - window);
        assert_eq!(mode, WindowMode::Stalled);

        let inside = now() - window + one;
        let (start, mode) = select_window(Some(inside), now(), window, OVERLAP);
        assert_eq!(start, inside - OVERLAP);
        assert_eq!(mode, WindowMode::Incremental);
    }

    #[test]
    fn test_select_window_recent_data() {
        let window = chrono::Duration::hours(1);
        let max = now() - chrono::Duration::minutes(2);
        let (start, _) = select_window(Some(max), now(), window, OVERLAP);
        assert_eq!(start, now() - chrono::Duration::minutes(7));
    }

    #[test]
    fn test_parse_samples_sorts_and_drops() {
        let rows: Vec<Row> = [
            json!({"time": "2024-01-15T10:02:00Z", "dzd_pubkey": "dev1", "intf": "eth0"}),
            json!({"time": "not a time", "dzd_pubkey": "dev1", "intf": "eth0"}),
            json!({"time": "2024-01-15 10:01:00 +0000 UTC", "dzd_pubkey": "dev1", "intf": "eth0"}),
        ]
        .into_iter()
        .filter_map(|v| match v {
            serde_json::Value::Object(m) => Some(m),
            _ => None,
        })
        .collect();

        let (samples, dropped) = parse_samples(&rows);
        assert_eq!(dropped, 1);
        assert_eq!(samples.len(), 2);
        assert!(samples[0].time < samples[1].time);
    }
}
