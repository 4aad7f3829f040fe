//! End-to-end usage refresh against in-memory stores.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use lake_indexer::export::health::HealthMetrics;
use lake_indexer::telemetry::usage::baseline::TIMESERIES_TIMEOUT;
use lake_indexer::telemetry::usage::convert::InterfaceUsage;
use lake_indexer::telemetry::usage::influx::{Row, TimeSeriesClient};
use lake_indexer::telemetry::usage::link::{LinkEndpoints, LinkSide};
use lake_indexer::telemetry::usage::sample::{Counter, CounterKey, MaxTimestampsByKey};
use lake_indexer::telemetry::usage::store::UsageStore;
use lake_indexer::telemetry::usage::UsageRefresher;
use lake_indexer::view::View;

#[derive(Default)]
struct MemoryStore {
    max_event_time: Option<DateTime<Utc>>,
    store_baselines: HashMap<Counter, HashMap<CounterKey, i64>>,
    written: MaxTimestampsByKey,
    links: Vec<LinkEndpoints>,
    fail_insert: bool,
    fail_written: bool,
    fail_links: bool,
    inserted: Mutex<Vec<InterfaceUsage>>,
}

impl UsageStore for MemoryStore {
    async fn max_event_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.max_event_time)
    }

    async fn sparse_baseline(
        &self,
        counter: Counter,
        _from: DateTime<Utc>,
        _before: DateTime<Utc>,
    ) -> Result<HashMap<CounterKey, i64>> {
        Ok(self.store_baselines.get(&counter).cloned().unwrap_or_default())
    }

    async fn max_time_by_key(&self, _floor: DateTime<Utc>) -> Result<MaxTimestampsByKey> {
        if self.fail_written {
            bail!("read timeout");
        }
        Ok(self.written.clone())
    }

    async fn current_link_endpoints(&self) -> Result<Vec<LinkEndpoints>> {
        if self.fail_links {
            bail!("table dim_dz_links_history is unavailable");
        }
        Ok(self.links.clone())
    }

    async fn insert_usage(&self, rows: &[InterfaceUsage], _ingested_at: DateTime<Utc>) -> Result<usize> {
        if self.fail_insert {
            bail!("connection refused");
        }
        self.inserted.lock().extend_from_slice(rows);
        Ok(rows.len())
    }
}

#[derive(Default)]
struct MemorySource {
    window_rows: Vec<Value>,
    /// Fallback baseline rows keyed by source field name.
    baseline_rows: HashMap<&'static str, Vec<Value>>,
    queries: Mutex<Vec<String>>,
}

impl MemorySource {
    fn baseline_queries(&self) -> usize {
        self.queries
            .lock()
            .iter()
            .filter(|q| q.contains("ROW_NUMBER"))
            .count()
    }
}

fn to_rows(values: &[Value]) -> Vec<Row> {
    values
        .iter()
        .filter_map(|v| v.as_object().cloned())
        .collect()
}

impl TimeSeriesClient for MemorySource {
    async fn query_sql(&self, sql: &str) -> Result<Vec<Row>> {
        self.queries.lock().push(sql.to_string());
        if !sql.contains("ROW_NUMBER") {
            return Ok(to_rows(&self.window_rows));
        }
        for (field, rows) in &self.baseline_rows {
            if sql.contains(&format!("\"{field}\" AS value")) {
                return Ok(to_rows(rows));
            }
        }
        Ok(Vec::new())
    }
}

fn sample(t: DateTime<Utc>, octets: i64, errors: Option<i64>) -> Value {
    let mut row = json!({
        "time": t.to_rfc3339(),
        "dzd_pubkey": "dev1",
        "host": "dz-ny7-sw01",
        "intf": "Ethernet1/1",
        "in-octets": octets,
    });
    if let Some(errors) = errors {
        row["in-errors"] = json!(errors);
    }
    row
}

fn usage_view(store: MemoryStore, source: MemorySource) -> (View<UsageRefresher<MemoryStore, MemorySource>>, Arc<HealthMetrics>) {
    let health = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("metrics"));
    let refresher = UsageRefresher::new(
        store,
        source,
        Duration::from_secs(3600),
        TIMESERIES_TIMEOUT,
        Arc::clone(&health),
    )
    .expect("refresher");
    (
        View::new("telemetry_usage", refresher, Duration::from_secs(60), Arc::clone(&health)),
        health,
    )
}

fn link_endpoints() -> Vec<LinkEndpoints> {
    vec![LinkEndpoints {
        pk: "link1".to_string(),
        side_a_pk: "dev1".to_string(),
        side_a_iface_name: "Ethernet1/1".to_string(),
        side_z_pk: "dev2".to_string(),
        side_z_iface_name: "Ethernet1/2".to_string(),
    }]
}

#[tokio::test]
async fn test_cold_start_uses_timeseries_baseline() {
    let now = Utc::now();
    let t1 = now - chrono::Duration::minutes(10);
    let t2 = t1 + chrono::Duration::seconds(90);

    let store = MemoryStore {
        links: link_endpoints(),
        ..Default::default()
    };
    let source = MemorySource {
        window_rows: vec![sample(t1, 1000, Some(3)), sample(t2, 2500, Some(5))],
        baseline_rows: HashMap::from([(
            "in-errors",
            vec![json!({"dzd_pubkey": "dev1", "intf": "Ethernet1/1", "value": 3})],
        )]),
        ..Default::default()
    };

    let (view, health) = usage_view(store, source);
    view.refresh(&CancellationToken::new()).await.expect("refresh ok");
    assert!(view.ready());

    let inserted = view.body().store().inserted.lock();
    assert_eq!(inserted.len(), 1, "first row is consumed as baseline");

    let row = &inserted[0];
    assert_eq!(row.time, t2);
    assert_eq!(row.value(Counter::InOctets), Some(2500));
    assert_eq!(row.delta(Counter::InOctets), Some(1500));
    assert_eq!(row.value(Counter::InErrors), Some(5));
    assert_eq!(row.delta(Counter::InErrors), Some(2));
    assert_eq!(row.link_pk.as_deref(), Some("link1"));
    assert_eq!(row.link_side, Some(LinkSide::A));
    let duration = row.delta_duration.expect("duration");
    assert!((duration - 90.0).abs() < 1e-6);

    assert_eq!(
        health
            .usage_baseline_source_total
            .with_label_values(&["timeseries"])
            .get(),
        1.0
    );
    assert_eq!(
        health.usage_rows_total.with_label_values(&["inserted"]).get(),
        1.0
    );
}

#[tokio::test]
async fn test_store_baseline_skips_timeseries_fallback() {
    let now = Utc::now();
    let t1 = now - chrono::Duration::minutes(4);
    let t2 = t1 + chrono::Duration::seconds(60);

    let store = MemoryStore {
        max_event_time: Some(now - chrono::Duration::minutes(5)),
        store_baselines: HashMap::from([(
            Counter::InErrors,
            HashMap::from([(CounterKey::new("dev1", "Ethernet1/1"), 1)]),
        )]),
        ..Default::default()
    };
    let source = MemorySource {
        window_rows: vec![sample(t1, 100, None), sample(t2, 200, Some(4))],
        ..Default::default()
    };

    let (view, health) = usage_view(store, source);
    view.refresh(&CancellationToken::new()).await.expect("refresh ok");

    assert_eq!(view.body().source().baseline_queries(), 0);
    let inserted = view.body().store().inserted.lock();
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].delta(Counter::InErrors), Some(3));
    assert_eq!(
        health
            .usage_baseline_source_total
            .with_label_values(&["clickhouse"])
            .get(),
        1.0
    );
}

#[tokio::test]
async fn test_already_written_rows_are_not_reinserted() {
    let now = Utc::now();
    let t1 = now - chrono::Duration::minutes(3);
    let t2 = t1 + chrono::Duration::seconds(60);

    let mut written = MaxTimestampsByKey::new();
    written.insert(CounterKey::new("dev1", "Ethernet1/1"), t2);

    let store = MemoryStore {
        max_event_time: Some(t2),
        written,
        ..Default::default()
    };
    let source = MemorySource {
        window_rows: vec![sample(t1, 100, None), sample(t2, 200, None)],
        ..Default::default()
    };

    let (view, _health) = usage_view(store, source);
    view.refresh(&CancellationToken::new()).await.expect("refresh ok");

    assert!(view.ready(), "a refresh with nothing new still counts as success");
    assert!(view.body().store().inserted.lock().is_empty());
}

#[tokio::test]
async fn test_insert_failure_keeps_view_not_ready() {
    let now = Utc::now();
    let t1 = now - chrono::Duration::minutes(3);

    let store = MemoryStore {
        fail_insert: true,
        ..Default::default()
    };
    let source = MemorySource {
        window_rows: vec![sample(t1, 100, None), sample(t1 + chrono::Duration::seconds(30), 150, None)],
        ..Default::default()
    };

    let (view, _health) = usage_view(store, source);
    let err = view
        .refresh(&CancellationToken::new())
        .await
        .expect_err("insert fails");
    assert!(format!("{err:#}").contains("connection refused"));
    assert!(!view.ready());
}

#[tokio::test]
async fn test_written_lookup_failure_inserts_without_dedup() {
    let now = Utc::now();
    let t1 = now - chrono::Duration::minutes(3);
    let t2 = t1 + chrono::Duration::seconds(60);

    let mut written = MaxTimestampsByKey::new();
    written.insert(CounterKey::new("dev1", "Ethernet1/1"), t2);

    let store = MemoryStore {
        max_event_time: Some(t2),
        written,
        fail_written: true,
        links: link_endpoints(),
        ..Default::default()
    };
    let source = MemorySource {
        window_rows: vec![sample(t1, 100, None), sample(t2, 200, None)],
        ..Default::default()
    };

    let (view, _health) = usage_view(store, source);
    view.refresh(&CancellationToken::new()).await.expect("refresh ok");
    assert!(view.ready());

    let inserted = view.body().store().inserted.lock();
    assert_eq!(inserted.len(), 1, "row at the written max is inserted again");
    assert_eq!(inserted[0].time, t2);
    assert_eq!(inserted[0].delta(Counter::InOctets), Some(100));
    assert_eq!(inserted[0].link_pk.as_deref(), Some("link1"));
}

#[tokio::test]
async fn test_link_lookup_failure_inserts_without_link_info() {
    let now = Utc::now();
    let t1 = now - chrono::Duration::minutes(3);
    let t2 = t1 + chrono::Duration::seconds(60);

    let store = MemoryStore {
        links: link_endpoints(),
        fail_links: true,
        ..Default::default()
    };
    let source = MemorySource {
        window_rows: vec![sample(t1, 100, None), sample(t2, 300, None)],
        ..Default::default()
    };

    let (view, health) = usage_view(store, source);
    view.refresh(&CancellationToken::new()).await.expect("refresh ok");
    assert!(view.ready());

    let inserted = view.body().store().inserted.lock();
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].delta(Counter::InOctets), Some(200));
    assert_eq!(inserted[0].link_pk, None);
    assert_eq!(inserted[0].link_side, None);
    assert_eq!(
        health.usage_rows_total.with_label_values(&["inserted"]).get(),
        1.0
    );
}
