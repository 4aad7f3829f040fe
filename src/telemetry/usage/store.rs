use std::collections::HashMap;
use std::fmt::Write;
use std::future::Future;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::export::{
    format_datetime, format_datetime_nanos, from_unix_nanos, sql_opt_f64, sql_opt_i64,
    sql_opt_str, ClickHouseClient,
};
use crate::serviceability::store::{current_rows_sql, LINKS_TABLE};

use super::convert::InterfaceUsage;
use super::link::LinkEndpoints;
use super::sample::{Counter, CounterKey, MaxTimestampsByKey};

/// Append-only usage fact table.
pub const USAGE_TABLE: &str = "fact_dz_device_interface_counters";

/// Persistence used by the usage refresh.
pub trait UsageStore: Send + Sync + 'static {
    /// Latest stored sample time, `None` when the table is empty.
    fn max_event_time(&self) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send;

    /// Last non-null value of `counter` per key in `[from, before)`.
    fn sparse_baseline(
        &self,
        counter: Counter,
        from: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> impl Future<Output = Result<HashMap<CounterKey, i64>>> + Send;

    /// Latest stored sample time per key at or after `floor`.
    fn max_time_by_key(
        &self,
        floor: DateTime<Utc>,
    ) -> impl Future<Output = Result<MaxTimestampsByKey>> + Send;

    /// Endpoints of the current (non-deleted) links.
    fn current_link_endpoints(&self) -> impl Future<Output = Result<Vec<LinkEndpoints>>> + Send;

    /// Appends rows stamped with `ingested_at`, returning the count written.
    fn insert_usage(
        &self,
        rows: &[InterfaceUsage],
        ingested_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize>> + Send;
}

/// [`UsageStore`] backed by ClickHouse.
#[derive(Clone)]
pub struct ClickHouseUsageStore {
    client: ClickHouseClient,
}

impl ClickHouseUsageStore {
    pub fn new(client: ClickHouseClient) -> Self {
        Self { client }
    }
}

fn usage_columns() -> String {
    let mut cols = String::from(
        "event_ts, ingested_at, device_pk, host, intf, user_tunnel_id, link_pk, link_side, \
         model_name, serial_number",
    );
    for counter in Counter::ALL {
        let _ = write!(cols, ", {}", counter.column());
    }
    for counter in Counter::ALL {
        let _ = write!(cols, ", {}_delta", counter.column());
    }
    cols.push_str(", delta_duration");
    cols
}

fn render_usage_row(row: &InterfaceUsage, ingested_at: &str) -> String {
    let mut out = String::with_capacity(512);
    let _ = write!(
        out,
        "({}, {}, {}, {}, {}, {}, {}, {}, {}, {}",
        format_datetime_nanos(row.time),
        ingested_at,
        sql_opt_str(row.device_pk.as_deref()),
        sql_opt_str(row.host.as_deref()),
        sql_opt_str(row.intf.as_deref()),
        sql_opt_i64(row.user_tunnel_id),
        sql_opt_str(row.link_pk.as_deref()),
        sql_opt_str(row.link_side.map(|s| s.as_str())),
        sql_opt_str(row.model_name.as_deref()),
        sql_opt_str(row.serial_number.as_deref()),
    );
    for value in row.values.iter().chain(row.deltas.iter()) {
        let _ = write!(out, ", {}", sql_opt_i64(*value));
    }
    let _ = write!(out, ", {})", sql_opt_f64(row.delta_duration));
    out
}

impl UsageStore for ClickHouseUsageStore {
    async fn max_event_time(&self) -> Result<Option<DateTime<Utc>>> {
        let sql = format!("SELECT toUnixTimestamp64Nano(max(event_ts)) AS max_ts FROM {USAGE_TABLE}");
        let block = self.client.query(&sql).await?;

        let Some(row) = block.rows().next() else {
            return Ok(None);
        };
        let nanos: i64 = row.get("max_ts").context("reading max_ts")?;
        if nanos <= 0 {
            return Ok(None);
        }
        Ok(Some(from_unix_nanos(nanos)))
    }

    async fn sparse_baseline(
        &self,
        counter: Counter,
        from: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<HashMap<CounterKey, i64>> {
        let col = counter.column();
        let sql = format!(
            "SELECT assumeNotNull(device_pk) AS pk, assumeNotNull(intf) AS iface, \
             argMax(assumeNotNull({col}), event_ts) AS value \
             FROM {USAGE_TABLE} \
             WHERE event_ts >= {} AND event_ts < {} \
             AND {col} IS NOT NULL AND device_pk IS NOT NULL AND intf IS NOT NULL \
             AND device_pk != '' AND intf != '' \
             GROUP BY pk, iface",
            format_datetime_nanos(from),
            format_datetime_nanos(before),
        );
        let block = self
            .client
            .query(&sql)
            .await
            .with_context(|| format!("querying {counter} baseline"))?;

        let mut values = HashMap::new();
        for row in block.rows() {
            let pk: String = row.get("pk")?;
            let iface: String = row.get("iface")?;
            let value: i64 = row.get("value")?;
            values.insert(CounterKey::new(pk, iface), value);
        }
        Ok(values)
    }

    async fn max_time_by_key(&self, floor: DateTime<Utc>) -> Result<MaxTimestampsByKey> {
        let sql = format!(
            "SELECT assumeNotNull(device_pk) AS pk, assumeNotNull(intf) AS iface, \
             toUnixTimestamp64Nano(max(event_ts)) AS max_ts \
             FROM {USAGE_TABLE} \
             WHERE event_ts >= {} AND device_pk IS NOT NULL AND intf IS NOT NULL \
             GROUP BY pk, iface",
            format_datetime_nanos(floor),
        );
        let block = self.client.query(&sql).await.context("querying max time by key")?;

        let mut out = MaxTimestampsByKey::new();
        for row in block.rows() {
            let pk: String = row.get("pk")?;
            let iface: String = row.get("iface")?;
            let nanos: i64 = row.get("max_ts")?;
            out.insert(CounterKey::new(pk, iface), from_unix_nanos(nanos));
        }
        Ok(out)
    }

    async fn current_link_endpoints(&self) -> Result<Vec<LinkEndpoints>> {
        let sql = current_rows_sql(
            LINKS_TABLE,
            &[
                "pk",
                "side_a_pk",
                "side_a_iface_name",
                "side_z_pk",
                "side_z_iface_name",
            ],
        );
        let block = self.client.query(&sql).await.context("querying current links")?;

        let mut links = Vec::new();
        for row in block.rows() {
            links.push(LinkEndpoints {
                pk: row.get("pk")?,
                side_a_pk: row.get("side_a_pk")?,
                side_a_iface_name: row.get("side_a_iface_name")?,
                side_z_pk: row.get("side_z_pk")?,
                side_z_iface_name: row.get("side_z_iface_name")?,
            });
        }
        Ok(links)
    }

    async fn insert_usage(&self, rows: &[InterfaceUsage], ingested_at: DateTime<Utc>) -> Result<usize> {
        let ingested_at = format_datetime(ingested_at);
        let rendered: Vec<String> = rows
            .iter()
            .map(|r| render_usage_row(r, &ingested_at))
            .collect();
        self.client
            .insert_rows(USAGE_TABLE, &usage_columns(), &rendered)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::usage::link::LinkSide;
    use crate::telemetry::usage::sample::COUNTER_COUNT;
    use chrono::TimeZone;

    #[test]
    fn test_usage_columns_count() {
        let cols = usage_columns();
        assert_eq!(cols.split(", ").count(), 10 + COUNTER_COUNT * 2 + 1);
        assert!(cols.contains("in_octets_delta"));
        assert!(cols.ends_with("delta_duration"));
    }

    #[test]
    fn test_render_usage_row() {
        let mut values = [None; COUNTER_COUNT];
        values[Counter::InOctets.index()] = Some(2500);
        let mut deltas = [None; COUNTER_COUNT];
        deltas[Counter::InOctets.index()] = Some(1500);

        let row = InterfaceUsage {
            time: Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap(),
            device_pk: Some("dev1".to_string()),
            host: None,
            intf: Some("eth0".to_string()),
            user_tunnel_id: None,
            link_pk: Some("link1".to_string()),
            link_side: Some(LinkSide::A),
            model_name: None,
            serial_number: Some("it's".to_string()),
            values,
            deltas,
            delta_duration: Some(60.0),
        };
        let rendered = render_usage_row(&row, "'2024-01-15 10:05:00.000'");

        assert!(rendered.starts_with("('2024-01-15 10:00:00.000000000', '2024-01-15 10:05:00.000', 'dev1', NULL, 'eth0', NULL, 'link1', 'A', NULL, 'it\\'s'"));
        assert!(rendered.contains(", 2500, "));
        assert!(rendered.contains(", 1500, "));
        assert!(rendered.ends_with(", 60)"));
        assert_eq!(rendered.split(", ").count(), 10 + COUNTER_COUNT * 2 + 1);
    }
}
