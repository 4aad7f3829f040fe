use std::collections::BTreeSet;
use std::future::Future;
use std::net::IpAddr;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use maxminddb::{geoip2, Reader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::GeoIpConfig;
use crate::error::with_cancel;
use crate::export::{format_datetime, sql_opt_f64, sql_opt_i64, sql_opt_str, sql_str, ClickHouseClient};
use crate::serviceability::store::ServiceabilityStore;
use crate::solana::{ClickHouseSolanaStore, SolanaStore};
use crate::view::Refresh;

pub const GEOIP_TABLE: &str = "geoip_records";

/// Location and network owner of one address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoRecord {
    pub ip: String,
    pub country_code: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub time_zone: Option<String>,
    pub asn: Option<u32>,
    pub asn_org: Option<String>,
}

/// Resolves IPs to location records.
pub trait Resolver: Send + Sync + 'static {
    /// `None` when the address is not resolvable.
    fn resolve(&self, ip: IpAddr) -> Option<GeoRecord>;
}

/// [`Resolver`] over MaxMind City and ASN databases.
pub struct MaxMindResolver {
    city: Reader<Vec<u8>>,
    asn: Option<Reader<Vec<u8>>>,
}

impl MaxMindResolver {
    /// Opens the configured databases. The ASN database is optional.
    pub fn open(cfg: &GeoIpConfig) -> Result<Self> {
        let city = Reader::open_readfile(&cfg.city_db_path)
            .with_context(|| format!("opening city database {}", cfg.city_db_path.display()))?;
        let asn = if cfg.asn_db_path.as_os_str().is_empty() {
            None
        } else {
            Some(
                Reader::open_readfile(&cfg.asn_db_path)
                    .with_context(|| format!("opening ASN database {}", cfg.asn_db_path.display()))?,
            )
        };
        Ok(Self { city, asn })
    }
}

fn english(names: Option<&std::collections::BTreeMap<&str, &str>>) -> Option<String> {
    names.and_then(|n| n.get("en")).map(|s| s.to_string())
}

impl Resolver for MaxMindResolver {
    fn resolve(&self, ip: IpAddr) -> Option<GeoRecord> {
        let city: geoip2::City = self.city.lookup(ip).ok()?;

        let mut record = GeoRecord {
            ip: ip.to_string(),
            ..Default::default()
        };
        if let Some(country) = &city.country {
            record.country_code = country.iso_code.map(str::to_string);
            record.country = english(country.names.as_ref());
        }
        if let Some(subdivision) = city.subdivisions.as_ref().and_then(|s| s.first()) {
            record.region = english(subdivision.names.as_ref());
        }
        if let Some(c) = &city.city {
            record.city = english(c.names.as_ref());
        }
        if let Some(location) = &city.location {
            record.latitude = location.latitude;
            record.longitude = location.longitude;
            record.time_zone = location.time_zone.map(str::to_string);
        }

        if let Some(asn_reader) = &self.asn {
            if let Ok(asn) = asn_reader.lookup::<geoip2::Asn>(ip) {
                record.asn = asn.autonomous_system_number;
                record.asn_org = asn.autonomous_system_organization.map(str::to_string);
            }
        }

        Some(record)
    }
}

/// Whether an address can carry public location data.
fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation())
        }
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
    }
}

/// Inputs and output of the geoip view.
pub trait GeoIpStore: Send + Sync + 'static {
    fn user_client_ips(&self) -> impl Future<Output = Result<Vec<IpAddr>>> + Send;

    fn gossip_ips(&self) -> impl Future<Output = Result<Vec<IpAddr>>> + Send;

    fn upsert_records(
        &self,
        records: &[GeoRecord],
        updated_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize>> + Send;
}

/// Refresh body for the geoip view.
pub struct GeoIpRefresher<R, S> {
    resolver: R,
    store: S,
}

impl<R: Resolver, S: GeoIpStore> GeoIpRefresher<R, S> {
    pub fn new(resolver: R, store: S) -> Self {
        Self { resolver, store }
    }
}

impl<R: Resolver, S: GeoIpStore> Refresh for GeoIpRefresher<R, S> {
    async fn refresh(&self, cancel: &CancellationToken) -> Result<()> {
        let start = Instant::now();

        let users = with_cancel(cancel, self.store.user_client_ips())
            .await
            .context("querying user client IPs")?;
        let gossip = with_cancel(cancel, self.store.gossip_ips())
            .await
            .context("querying gossip IPs")?;

        let ips: BTreeSet<IpAddr> = users
            .into_iter()
            .chain(gossip)
            .filter(is_routable)
            .collect();
        debug!(count = ips.len(), "found unique IPs");

        let records: Vec<GeoRecord> = ips.iter().filter_map(|ip| self.resolver.resolve(*ip)).collect();

        let written = with_cancel(cancel, self.store.upsert_records(&records, Utc::now()))
            .await
            .context("updating geoip records")?;

        info!(
            ips = ips.len(),
            records = written,
            duration = ?start.elapsed(),
            "geoip records updated"
        );
        Ok(())
    }
}

/// [`GeoIpStore`] backed by ClickHouse.
#[derive(Clone)]
pub struct ClickHouseGeoIpStore {
    client: ClickHouseClient,
    serviceability: ServiceabilityStore,
    solana: ClickHouseSolanaStore,
}

impl ClickHouseGeoIpStore {
    pub fn new(client: ClickHouseClient) -> Self {
        Self {
            serviceability: ServiceabilityStore::new(client.clone()),
            solana: ClickHouseSolanaStore::new(client.clone()),
            client,
        }
    }
}

fn render_record(r: &GeoRecord, updated_at: &str) -> String {
    format!(
        "({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {updated_at})",
        sql_str(&r.ip),
        sql_opt_str(r.country_code.as_deref()),
        sql_opt_str(r.country.as_deref()),
        sql_opt_str(r.region.as_deref()),
        sql_opt_str(r.city.as_deref()),
        sql_opt_f64(r.latitude),
        sql_opt_f64(r.longitude),
        sql_opt_str(r.time_zone.as_deref()),
        sql_opt_i64(r.asn.map(i64::from)),
        sql_opt_str(r.asn_org.as_deref()),
    )
}

impl GeoIpStore for ClickHouseGeoIpStore {
    async fn user_client_ips(&self) -> Result<Vec<IpAddr>> {
        let users = self.serviceability.current_users().await?;
        Ok(users.iter().filter_map(|u| u.client_ip.parse().ok()).collect())
    }

    async fn gossip_ips(&self) -> Result<Vec<IpAddr>> {
        self.solana.gossip_ips().await
    }

    async fn upsert_records(&self, records: &[GeoRecord], updated_at: DateTime<Utc>) -> Result<usize> {
        let updated_at = format_datetime(updated_at);
        let rows: Vec<String> = records.iter().map(|r| render_record(r, &updated_at)).collect();
        self.client
            .insert_rows(
                GEOIP_TABLE,
                "ip, country_code, country, region, city, latitude, longitude, time_zone, asn, asn_org, updated_at",
                &rows,
            )
            .await
    }
}
