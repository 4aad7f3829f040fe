use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{is_cancelled, with_cancel};
use crate::export::{format_datetime, sql_opt_i64, sql_str, ClickHouseClient};
use crate::serviceability::store::ServiceabilityStore;
use crate::serviceability::Link;
use crate::solana::EpochSource;
use crate::view::{Readiness, Refresh};

use super::rpc::{LatencySamples, LatencySource, SeriesKey};

pub const LATENCY_TABLE: &str = "fact_dz_device_link_latency";

/// One latency probe result.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyRow {
    pub time: DateTime<Utc>,
    pub epoch: u64,
    pub sample_index: i64,
    pub key: SeriesKey,
    /// `None` when the probe was lost.
    pub rtt_us: Option<i64>,
}

impl LatencyRow {
    pub fn loss(&self) -> bool {
        self.rtt_us.is_none()
    }
}

/// Persistence used by the latency refresh.
pub trait LatencyStore: Send + Sync + 'static {
    fn current_links(&self) -> impl Future<Output = Result<Vec<Link>>> + Send;

    /// Highest stored sample index per series for `epoch`.
    fn max_sample_index(
        &self,
        epoch: u64,
    ) -> impl Future<Output = Result<HashMap<SeriesKey, i64>>> + Send;

    fn insert_latency(
        &self,
        rows: &[LatencyRow],
        ingested_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize>> + Send;
}

/// Both directions of every link with two known endpoints.
pub fn series_for_links(links: &[Link]) -> Vec<SeriesKey> {
    let mut keys = Vec::with_capacity(links.len() * 2);
    for link in links {
        if link.side_a_pk.is_empty() || link.side_z_pk.is_empty() {
            continue;
        }
        keys.push(SeriesKey {
            origin_device_pk: link.side_a_pk.clone(),
            target_device_pk: link.side_z_pk.clone(),
            link_pk: link.pk.clone(),
        });
        keys.push(SeriesKey {
            origin_device_pk: link.side_z_pk.clone(),
            target_device_pk: link.side_a_pk.clone(),
            link_pk: link.pk.clone(),
        });
    }
    keys
}

/// Expands fetched samples into rows, keeping only indexes above `after`.
pub fn latency_rows(
    key: &SeriesKey,
    samples: &LatencySamples,
    after: Option<i64>,
) -> Vec<LatencyRow> {
    samples
        .samples
        .iter()
        .enumerate()
        .filter_map(|(offset, rtt)| {
            let index = samples.start_index + offset as i64;
            if after.is_some_and(|a| index <= a) {
                return None;
            }
            let ts_us = samples.start_timestamp_us + index * samples.sampling_interval_us;
            let time = Utc.timestamp_micros(ts_us).single()?;
            Some(LatencyRow {
                time,
                epoch: samples.epoch,
                sample_index: index,
                key: key.clone(),
                rtt_us: (*rtt != 0).then_some(i64::from(*rtt)),
            })
        })
        .collect()
}

/// Refresh body for the device-link latency view.
pub struct LatencyRefresher<S, L, E> {
    store: S,
    source: L,
    epochs: E,
    serviceability: Readiness,
    ready_timeout: Duration,
    max_concurrency: usize,
}

impl<S: LatencyStore, L: LatencySource, E: EpochSource> LatencyRefresher<S, L, E> {
    pub fn new(
        store: S,
        source: L,
        epochs: E,
        serviceability: Readiness,
        ready_timeout: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            source,
            epochs,
            serviceability,
            ready_timeout,
            max_concurrency: max_concurrency.max(1),
        }
    }
}

impl<S: LatencyStore, L: LatencySource, E: EpochSource> Refresh for LatencyRefresher<S, L, E> {
    async fn refresh(&self, cancel: &CancellationToken) -> Result<()> {
        let start = Instant::now();

        self.serviceability
            .wait_timeout(cancel, self.ready_timeout)
            .await
            .context("serviceability view not ready")?;

        let links = with_cancel(cancel, self.store.current_links())
            .await
            .context("querying links")?;
        let epoch = with_cancel(cancel, self.epochs.current_epoch())
            .await
            .context("fetching epoch")?;
        let existing = with_cancel(cancel, self.store.max_sample_index(epoch))
            .await
            .context("querying stored sample indexes")?;

        let series = series_for_links(&links);
        let series_count = series.len();

        let fetches = stream::iter(series)
            .map(|key| {
                let after = existing.get(&key).copied();
                async move {
                    let res = self.source.samples_after(&key, epoch, after).await;
                    (key, after, res)
                }
            })
            .buffer_unordered(self.max_concurrency)
            .collect::<Vec<_>>();
        let results = with_cancel(cancel, async { Ok(fetches.await) }).await?;

        let mut rows = Vec::new();
        let mut failed = 0usize;
        for (key, after, res) in results {
            match res {
                Ok(Some(samples)) => rows.extend(latency_rows(&key, &samples, after)),
                Ok(None) => {}
                Err(e) if is_cancelled(&e) => return Err(e),
                Err(e) => {
                    failed += 1;
                    debug!(link = %key.link_pk, error = %e, "latency fetch failed");
                }
            }
        }
        if failed > 0 {
            warn!(failed, series = series_count, "some latency fetches failed");
        }

        let inserted = with_cancel(cancel, self.store.insert_latency(&rows, Utc::now()))
            .await
            .context("inserting latency samples")?;

        info!(
            epoch,
            series = series_count,
            inserted,
            duration = ?start.elapsed(),
            "latency refresh complete"
        );
        Ok(())
    }
}

/// [`LatencyStore`] backed by ClickHouse.
#[derive(Clone)]
pub struct ClickHouseLatencyStore {
    client: ClickHouseClient,
    serviceability: ServiceabilityStore,
}

impl ClickHouseLatencyStore {
    pub fn new(client: ClickHouseClient) -> Self {
        let serviceability = ServiceabilityStore::new(client.clone());
        Self {
            client,
            serviceability,
        }
    }
}

impl LatencyStore for ClickHouseLatencyStore {
    async fn current_links(&self) -> Result<Vec<Link>> {
        self.serviceability.current_links().await
    }

    async fn max_sample_index(&self, epoch: u64) -> Result<HashMap<SeriesKey, i64>> {
        let sql = format!(
            "SELECT origin_device_pk, target_device_pk, link_pk, max(sample_index) AS max_idx \
             FROM {LATENCY_TABLE} WHERE epoch = {epoch} \
             GROUP BY origin_device_pk, target_device_pk, link_pk"
        );
        let block = self.client.query(&sql).await?;

        let mut out = HashMap::new();
        for row in block.rows() {
            let key = SeriesKey {
                origin_device_pk: row.get("origin_device_pk")?,
                target_device_pk: row.get("target_device_pk")?,
                link_pk: row.get("link_pk")?,
            };
            let idx: i64 = row.get("max_idx")?;
            out.insert(key, idx);
        }
        Ok(out)
    }

    async fn insert_latency(&self, rows: &[LatencyRow], ingested_at: DateTime<Utc>) -> Result<usize> {
        let ingested_at = format_datetime(ingested_at);
        let rendered: Vec<String> = rows
            .iter()
            .map(|r| {
                format!(
                    "('{}', {ingested_at}, {}, {}, {}, {}, {}, {}, {})",
                    r.time.format("%Y-%m-%d %H:%M:%S%.6f"),
                    r.epoch,
                    r.sample_index,
                    sql_str(&r.key.origin_device_pk),
                    sql_str(&r.key.target_device_pk),
                    sql_str(&r.key.link_pk),
                    sql_opt_i64(r.rtt_us),
                    u8::from(r.loss()),
                )
            })
            .collect();

        self.client
            .insert_rows(
                LATENCY_TABLE,
                "event_ts, ingested_at, epoch, sample_index, origin_device_pk, target_device_pk, \
                 link_pk, rtt_us, loss",
                &rendered,
            )
            .await
    }
}
