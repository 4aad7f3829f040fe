use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::future::Future;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::types::{Complex, Row};
use tracing::debug;

use crate::export::{format_datetime, sql_str, ClickHouseClient};

use super::{Contributor, Device, Interface, Link, Metro, Snapshot, User};

pub const CONTRIBUTORS_TABLE: &str = "dim_dz_contributors_history";
pub const DEVICES_TABLE: &str = "dim_dz_devices_history";
pub const METROS_TABLE: &str = "dim_dz_metros_history";
pub const LINKS_TABLE: &str = "dim_dz_links_history";
pub const USERS_TABLE: &str = "dim_dz_users_history";

const META_COLUMNS: &str = "entity_id, snapshot_ts, ingested_at, op_id, is_deleted";

/// Latest non-deleted row per entity of a history table.
pub fn current_rows_sql(table: &str, columns: &[&str]) -> String {
    format!(
        "SELECT {} FROM (\
         SELECT * FROM {table} \
         ORDER BY entity_id, snapshot_ts DESC, ingested_at DESC, op_id DESC \
         LIMIT 1 BY entity_id\
         ) WHERE is_deleted = 0",
        columns.join(", ")
    )
}

/// An entity kept as type-2 history, one row per observed change.
pub trait Dimension: Clone + PartialEq + Send + Sync + Sized + 'static {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    fn pk(&self) -> &str;

    /// SQL literals for [`Self::COLUMNS`], comma-separated.
    fn values(&self) -> String;

    fn from_row(row: &Row<'_, Complex>) -> Result<Self>;
}

/// Writes whole topology snapshots.
pub trait SnapshotWriter: Send + Sync + 'static {
    fn write_snapshot(
        &self,
        snapshot: &Snapshot,
        snapshot_ts: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// ClickHouse-backed serviceability dimensions.
#[derive(Clone)]
pub struct ServiceabilityStore {
    client: ClickHouseClient,
}

impl ServiceabilityStore {
    pub fn new(client: ClickHouseClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ClickHouseClient {
        &self.client
    }

    /// Current (latest, non-deleted) rows of one dimension.
    pub async fn current<D: Dimension>(&self) -> Result<Vec<D>> {
        let sql = current_rows_sql(D::TABLE, D::COLUMNS);
        let block = self
            .client
            .query(&sql)
            .await
            .with_context(|| format!("querying current rows of {}", D::TABLE))?;

        block.rows().map(|row| D::from_row(&row)).collect()
    }

    pub async fn current_devices(&self) -> Result<Vec<Device>> {
        self.current().await
    }

    pub async fn current_links(&self) -> Result<Vec<Link>> {
        self.current().await
    }

    pub async fn current_users(&self) -> Result<Vec<User>> {
        self.current().await
    }

    /// Applies one snapshot of a dimension.
    ///
    /// Writes a row for every new or changed entity and a tombstone for every
    /// current entity missing from `entities`. Returns the rows written.
    pub async fn replace<D: Dimension>(
        &self,
        entities: &[D],
        snapshot_ts: DateTime<Utc>,
    ) -> Result<usize> {
        let current: Vec<D> = self.current().await?;
        let rows = history_rows(&current, entities, snapshot_ts, Utc::now());
        if rows.is_empty() {
            debug!(table = D::TABLE, "no changes");
            return Ok(0);
        }

        let columns = format!("{META_COLUMNS}, {}", D::COLUMNS.join(", "));
        self.client.insert_rows(D::TABLE, &columns, &rows).await
    }
}

/// Rendered history rows turning `current` into `next`.
fn history_rows<D: Dimension>(
    current: &[D],
    next: &[D],
    snapshot_ts: DateTime<Utc>,
    ingested_at: DateTime<Utc>,
) -> Vec<String> {
    let by_pk: HashMap<&str, &D> = current.iter().map(|d| (d.pk(), d)).collect();
    let next_pks: HashSet<&str> = next.iter().map(|d| d.pk()).collect();

    let snapshot_ts = format_datetime(snapshot_ts);
    let ingested_at = format_datetime(ingested_at);
    let mut rows = Vec::new();
    let mut op_id = 0u64;

    let mut push = |entity: &D, deleted: bool| {
        op_id += 1;
        rows.push(format!(
            "({}, {snapshot_ts}, {ingested_at}, {op_id}, {}, {})",
            sql_str(entity.pk()),
            u8::from(deleted),
            entity.values()
        ));
    };

    for entity in next {
        if by_pk.get(entity.pk()) != Some(&entity) {
            push(entity, false);
        }
    }
    for entity in current {
        if !next_pks.contains(entity.pk()) {
            push(entity, true);
        }
    }

    rows
}

impl SnapshotWriter for ServiceabilityStore {
    async fn write_snapshot(&self, snapshot: &Snapshot, snapshot_ts: DateTime<Utc>) -> Result<()> {
        let contributors = self
            .replace(&snapshot.contributors, snapshot_ts)
            .await
            .context("replacing contributors")?;
        let devices = self
            .replace(&snapshot.devices, snapshot_ts)
            .await
            .context("replacing devices")?;
        let users = self
            .replace(&snapshot.users, snapshot_ts)
            .await
            .context("replacing users")?;
        let metros = self
            .replace(&snapshot.metros, snapshot_ts)
            .await
            .context("replacing metros")?;
        let links = self
            .replace(&snapshot.links, snapshot_ts)
            .await
            .context("replacing links")?;

        debug!(contributors, devices, users, metros, links, "history rows written");
        Ok(())
    }
}

// --- Dimension impls ---

impl Dimension for Contributor {
    const TABLE: &'static str = CONTRIBUTORS_TABLE;
    const COLUMNS: &'static [&'static str] = &["pk", "code", "name"];

    fn pk(&self) -> &str {
        &self.pk
    }

    fn values(&self) -> String {
        format!("{}, {}, {}", sql_str(&self.pk), sql_str(&self.code), sql_str(&self.name))
    }

    fn from_row(row: &Row<'_, Complex>) -> Result<Self> {
        Ok(Self {
            pk: row.get("pk")?,
            code: row.get("code")?,
            name: row.get("name")?,
        })
    }
}

impl Dimension for Device {
    const TABLE: &'static str = DEVICES_TABLE;
    const COLUMNS: &'static [&'static str] = &[
        "pk",
        "status",
        "device_type",
        "code",
        "public_ip",
        "contributor_pk",
        "metro_pk",
        "max_users",
        "interfaces",
    ];

    fn pk(&self) -> &str {
        &self.pk
    }

    fn values(&self) -> String {
        let interfaces = serde_json::to_string(&self.interfaces).unwrap_or_else(|_| "[]".to_string());
        let mut out = String::new();
        for s in [
            &self.pk,
            &self.status,
            &self.device_type,
            &self.code,
            &self.public_ip,
            &self.contributor_pk,
            &self.metro_pk,
        ] {
            let _ = write!(out, "{}, ", sql_str(s));
        }
        let _ = write!(out, "{}, {}", self.max_users, sql_str(&interfaces));
        out
    }

    fn from_row(row: &Row<'_, Complex>) -> Result<Self> {
        let interfaces: String = row.get("interfaces")?;
        let interfaces: Vec<Interface> = if interfaces.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&interfaces).context("decoding device interfaces")?
        };
        Ok(Self {
            pk: row.get("pk")?,
            status: row.get("status")?,
            device_type: row.get("device_type")?,
            code: row.get("code")?,
            public_ip: row.get("public_ip")?,
            contributor_pk: row.get("contributor_pk")?,
            metro_pk: row.get("metro_pk")?,
            max_users: row.get("max_users")?,
            interfaces,
        })
    }
}

impl Dimension for Metro {
    const TABLE: &'static str = METROS_TABLE;
    const COLUMNS: &'static [&'static str] = &["pk", "code", "name", "longitude", "latitude"];

    fn pk(&self) -> &str {
        &self.pk
    }

    fn values(&self) -> String {
        format!(
            "{}, {}, {}, {}, {}",
            sql_str(&self.pk),
            sql_str(&self.code),
            sql_str(&self.name),
            self.longitude,
            self.latitude
        )
    }

    fn from_row(row: &Row<'_, Complex>) -> Result<Self> {
        Ok(Self {
            pk: row.get("pk")?,
            code: row.get("code")?,
            name: row.get("name")?,
            longitude: row.get("longitude")?,
            latitude: row.get("latitude")?,
        })
    }
}

impl Dimension for Link {
    const TABLE: &'static str = LINKS_TABLE;
    const COLUMNS: &'static [&'static str] = &[
        "pk",
        "status",
        "code",
        "tunnel_net",
        "contributor_pk",
        "side_a_pk",
        "side_z_pk",
        "side_a_iface_name",
        "side_z_iface_name",
        "side_a_ip",
        "side_z_ip",
        "link_type",
        "committed_rtt_ns",
        "committed_jitter_ns",
        "bandwidth",
        "isis_delay_override_ns",
    ];

    fn pk(&self) -> &str {
        &self.pk
    }

    fn values(&self) -> String {
        let mut out = String::new();
        for s in [
            &self.pk,
            &self.status,
            &self.code,
            &self.tunnel_net,
            &self.contributor_pk,
            &self.side_a_pk,
            &self.side_z_pk,
            &self.side_a_iface_name,
            &self.side_z_iface_name,
            &self.side_a_ip,
            &self.side_z_ip,
            &self.link_type,
        ] {
            let _ = write!(out, "{}, ", sql_str(s));
        }
        let _ = write!(
            out,
            "{}, {}, {}, {}",
            self.committed_rtt_ns, self.committed_jitter_ns, self.bandwidth, self.isis_delay_override_ns
        );
        out
    }

    fn from_row(row: &Row<'_, Complex>) -> Result<Self> {
        Ok(Self {
            pk: row.get("pk")?,
            status: row.get("status")?,
            code: row.get("code")?,
            tunnel_net: row.get("tunnel_net")?,
            contributor_pk: row.get("contributor_pk")?,
            side_a_pk: row.get("side_a_pk")?,
            side_z_pk: row.get("side_z_pk")?,
            side_a_iface_name: row.get("side_a_iface_name")?,
            side_z_iface_name: row.get("side_z_iface_name")?,
            side_a_ip: row.get("side_a_ip")?,
            side_z_ip: row.get("side_z_ip")?,
            link_type: row.get("link_type")?,
            committed_rtt_ns: row.get("committed_rtt_ns")?,
            committed_jitter_ns: row.get("committed_jitter_ns")?,
            bandwidth: row.get("bandwidth")?,
            isis_delay_override_ns: row.get("isis_delay_override_ns")?,
        })
    }
}

impl Dimension for User {
    const TABLE: &'static str = USERS_TABLE;
    const COLUMNS: &'static [&'static str] = &[
        "pk",
        "owner_pubkey",
        "status",
        "kind",
        "client_ip",
        "dz_ip",
        "device_pk",
        "tunnel_id",
    ];

    fn pk(&self) -> &str {
        &self.pk
    }

    fn values(&self) -> String {
        let mut out = String::new();
        for s in [
            &self.pk,
            &self.owner_pubkey,
            &self.status,
            &self.kind,
            &self.client_ip,
            &self.dz_ip,
            &self.device_pk,
        ] {
            let _ = write!(out, "{}, ", sql_str(s));
        }
        let _ = write!(out, "{}", self.tunnel_id);
        out
    }

    fn from_row(row: &Row<'_, Complex>) -> Result<Self> {
        Ok(Self {
            pk: row.get("pk")?,
            owner_pubkey: row.get("owner_pubkey")?,
            status: row.get("status")?,
            kind: row.get("kind")?,
            client_ip: row.get("client_ip")?,
            dz_ip: row.get("dz_ip")?,
            device_pk: row.get("device_pk")?,
            tunnel_id: row.get("tunnel_id")?,
        })
    }
}
