use std::collections::HashMap;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::with_cancel;

use super::influx::{baseline_query, Row, TimeSeriesClient};
use super::sample::{extract_int, extract_string, Counter, CounterKey};
use super::store::UsageStore;

/// Lookback for the columnar-store tier.
pub const STORE_LOOKBACK: chrono::Duration = chrono::Duration::days(90);

/// Lookback for the time-series tier.
pub const TIMESERIES_LOOKBACK: chrono::Duration = chrono::Duration::days(3650);

/// Bound on the whole time-series tier.
pub const TIMESERIES_TIMEOUT: Duration = Duration::from_secs(120);

/// Last known pre-window value per key, for each sparse counter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterBaselines {
    by_counter: HashMap<Counter, HashMap<CounterKey, i64>>,
}

impl CounterBaselines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, counter: Counter, key: CounterKey, value: i64) {
        self.by_counter.entry(counter).or_default().insert(key, value);
    }

    pub fn set_field(&mut self, counter: Counter, values: HashMap<CounterKey, i64>) {
        self.by_counter.insert(counter, values);
    }

    pub fn get(&self, counter: Counter, key: &CounterKey) -> Option<i64> {
        self.by_counter.get(&counter)?.get(key).copied()
    }

    /// Number of entries for one counter.
    pub fn field_len(&self, counter: Counter) -> usize {
        self.by_counter.get(&counter).map_or(0, HashMap::len)
    }

    /// Distinct keys across all counters.
    pub fn unique_keys(&self) -> usize {
        self.by_counter
            .values()
            .flat_map(HashMap::keys)
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.unique_keys() == 0
    }
}

/// Where the baselines for a refresh came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineSource {
    ClickHouse,
    TimeSeries,
    Empty,
}

impl BaselineSource {
    pub fn as_str(self) -> &'static str {
        match self {
            BaselineSource::ClickHouse => "clickhouse",
            BaselineSource::TimeSeries => "timeseries",
            BaselineSource::Empty => "empty",
        }
    }
}

/// Resolves sparse-counter baselines for a window starting at `window_start`.
///
/// Tries the columnar store first and queries the time-series source only
/// when the store knows no keys at all. Failures in either tier degrade to
/// fewer baselines; only cancellation is returned as an error.
pub async fn resolve_baselines<S, T>(
    store: &S,
    source: &T,
    window_start: DateTime<Utc>,
    timeseries_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(CounterBaselines, BaselineSource)>
where
    S: UsageStore,
    T: TimeSeriesClient,
{
    let start = Instant::now();
    let from_store = with_cancel(cancel, store_baselines(store, window_start)).await?;
    let keys = from_store.unique_keys();
    if keys > 0 {
        info!(
            source = "clickhouse",
            unique_keys = keys,
            duration = ?start.elapsed(),
            "resolved counter baselines"
        );
        return Ok((from_store, BaselineSource::ClickHouse));
    }
    debug!("no baselines in clickhouse, querying time-series source");

    let start = Instant::now();
    let fallback = tokio::time::timeout(
        timeseries_timeout,
        with_cancel(cancel, timeseries_baselines(source, window_start)),
    )
    .await;

    let baselines = match fallback {
        Ok(res) => res?,
        Err(_) => {
            warn!(
                duration = ?start.elapsed(),
                "baseline query timed out, proceeding without baselines"
            );
            return Ok((CounterBaselines::new(), BaselineSource::Empty));
        }
    };

    let keys = baselines.unique_keys();
    if keys == 0 {
        info!(duration = ?start.elapsed(), "no baselines found, proceeding without baselines");
        return Ok((baselines, BaselineSource::Empty));
    }

    info!(
        source = "timeseries",
        unique_keys = keys,
        duration = ?start.elapsed(),
        "resolved counter baselines"
    );
    Ok((baselines, BaselineSource::TimeSeries))
}

async fn store_baselines<S: UsageStore>(
    store: &S,
    window_start: DateTime<Utc>,
) -> Result<CounterBaselines> {
    let mut baselines = CounterBaselines::new();
    for counter in Counter::SPARSE {
        match store
            .sparse_baseline(counter, window_start - STORE_LOOKBACK, window_start)
            .await
        {
            Ok(values) => baselines.set_field(counter, values),
            Err(e) => {
                warn!(counter = %counter, error = %e, "baseline query failed in clickhouse");
            }
        }
    }
    Ok(baselines)
}

/// One concurrent query per sparse counter; each owns its result until the join.
async fn timeseries_baselines<T: TimeSeriesClient>(
    source: &T,
    window_start: DateTime<Utc>,
) -> Result<CounterBaselines> {
    let lookback_start = window_start - TIMESERIES_LOOKBACK;

    let queries = Counter::SPARSE.map(|counter| async move {
        let sql = baseline_query(counter, lookback_start, window_start);
        (counter, source.query_sql(&sql).await)
    });

    let mut baselines = CounterBaselines::new();
    for (counter, result) in join_all(queries).await {
        match result {
            Ok(rows) => baselines.set_field(counter, rows_to_baseline(&rows)),
            Err(e) => {
                warn!(counter = %counter, error = %e, "baseline query failed in time-series source");
            }
        }
    }
    Ok(baselines)
}

fn rows_to_baseline(rows: &[Row]) -> HashMap<CounterKey, i64> {
    let mut values = HashMap::with_capacity(rows.len());
    for row in rows {
        let (Some(pk), Some(intf), Some(value)) = (
            extract_string(row.get("dzd_pubkey")),
            extract_string(row.get("intf")),
            extract_int(row.get("value")),
        ) else {
            continue;
        };
        if pk.is_empty() || intf.is_empty() {
            continue;
        }
        values.insert(CounterKey::new(pk, intf), value);
    }
    values
}
