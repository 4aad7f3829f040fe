pub mod rpc;
pub mod store;

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{with_cancel, Error};
use crate::view::Refresh;

use self::rpc::{ProgramData, ProgramDataSource};
use self::store::SnapshotWriter;

// --- Dimension entities ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contributor {
    pub pk: String,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    /// Address in `a.b.c.d/len` form.
    pub ip: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub pk: String,
    pub status: String,
    pub device_type: String,
    pub code: String,
    pub public_ip: String,
    pub contributor_pk: String,
    pub metro_pk: String,
    pub max_users: i64,
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metro {
    pub pk: String,
    pub code: String,
    pub name: String,
    pub longitude: f64,
    pub latitude: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub pk: String,
    pub status: String,
    pub code: String,
    pub tunnel_net: String,
    pub contributor_pk: String,
    pub side_a_pk: String,
    pub side_z_pk: String,
    pub side_a_iface_name: String,
    pub side_z_iface_name: String,
    pub side_a_ip: String,
    pub side_z_ip: String,
    pub link_type: String,
    pub committed_rtt_ns: i64,
    pub committed_jitter_ns: i64,
    pub bandwidth: i64,
    pub isis_delay_override_ns: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub pk: String,
    pub owner_pubkey: String,
    pub status: String,
    pub kind: String,
    pub client_ip: String,
    pub dz_ip: String,
    pub device_pk: String,
    pub tunnel_id: i64,
}

/// One consistent topology snapshot, ready to be written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub contributors: Vec<Contributor>,
    pub devices: Vec<Device>,
    pub metros: Vec<Metro>,
    pub links: Vec<Link>,
    pub users: Vec<User>,
}

/// Display name for a known contributor code.
pub fn contributor_name(code: &str) -> Option<&'static str> {
    let name = match code {
        "jump_" => "Jump Crypto",
        "dgt" => "Distributed Global",
        "cherry" => "Cherry Servers",
        "cdrw" => "Cumberland/DRW",
        "glxy" => "Galaxy",
        "latitude" => "Latitude",
        "rox" => "RockawayX",
        "s3v" => "S3V",
        "stakefac" => "Staking Facilities",
        "tsw" => "Terraswitch",
        _ => return None,
    };
    Some(name)
}

/// Address part of `a.b.c.d/len`, when the prefix length is in `1..=32`.
fn interface_addr(ip_net: &str) -> Option<&str> {
    let (addr, len) = ip_net.split_once('/')?;
    let len: u8 = len.parse().ok()?;
    (1..=32).contains(&len).then_some(addr)
}

impl Snapshot {
    /// Builds a snapshot from raw program data.
    ///
    /// Fails when contributors, devices or metros are missing, since writing
    /// such a snapshot would tombstone every existing entity of that kind.
    pub fn from_program_data(pd: ProgramData) -> Result<Self> {
        if pd.contributors.is_empty() {
            return Err(Error::RefusingEmptySnapshot("contributors").into());
        }
        if pd.devices.is_empty() {
            return Err(Error::RefusingEmptySnapshot("devices").into());
        }
        if pd.exchanges.is_empty() {
            return Err(Error::RefusingEmptySnapshot("metros").into());
        }

        let links = link_rows(&pd);

        let contributors = pd
            .contributors
            .into_iter()
            .map(|c| Contributor {
                name: contributor_name(&c.code).unwrap_or_default().to_string(),
                pk: c.pubkey,
                code: c.code,
            })
            .collect();

        let devices = pd
            .devices
            .into_iter()
            .map(|d| Device {
                pk: d.pubkey,
                status: d.status,
                device_type: d.device_type,
                code: d.code,
                public_ip: d.public_ip,
                contributor_pk: d.contributor_pubkey,
                metro_pk: d.exchange_pubkey,
                max_users: d.max_users,
                interfaces: d
                    .interfaces
                    .into_iter()
                    .map(|i| Interface {
                        name: i.name,
                        ip: i.ip_net,
                        status: i.status,
                    })
                    .collect(),
            })
            .collect();

        let metros = pd
            .exchanges
            .into_iter()
            .map(|e| Metro {
                pk: e.pubkey,
                code: e.code,
                name: e.name,
                longitude: e.lng,
                latitude: e.lat,
            })
            .collect();

        let users = pd
            .users
            .into_iter()
            .map(|u| User {
                pk: u.pubkey,
                owner_pubkey: u.owner,
                status: u.status,
                kind: u.user_type,
                client_ip: u.client_ip,
                dz_ip: u.dz_ip,
                device_pk: u.device_pubkey,
                tunnel_id: u.tunnel_id,
            })
            .collect();

        Ok(Self {
            contributors,
            devices,
            metros,
            links,
            users,
        })
    }
}

/// Converts raw links, resolving side IPs from the endpoint device interfaces.
fn link_rows(pd: &ProgramData) -> Vec<Link> {
    let mut iface_ips: HashMap<&str, HashMap<&str, &str>> = HashMap::new();
    for device in &pd.devices {
        let ips = iface_ips.entry(device.pubkey.as_str()).or_default();
        for iface in &device.interfaces {
            if let Some(addr) = interface_addr(&iface.ip_net) {
                ips.insert(iface.name.as_str(), addr);
            }
        }
    }
    let side_ip = |device_pk: &str, iface: &str| -> String {
        iface_ips
            .get(device_pk)
            .and_then(|m| m.get(iface))
            .map(|s| s.to_string())
            .unwrap_or_default()
    };

    pd.links
        .iter()
        .map(|l| Link {
            pk: l.pubkey.clone(),
            status: l.status.clone(),
            code: l.code.clone(),
            tunnel_net: l.tunnel_net.clone(),
            contributor_pk: l.contributor_pubkey.clone(),
            side_a_pk: l.side_a_pubkey.clone(),
            side_z_pk: l.side_z_pubkey.clone(),
            side_a_iface_name: l.side_a_iface_name.clone(),
            side_z_iface_name: l.side_z_iface_name.clone(),
            side_a_ip: side_ip(&l.side_a_pubkey, &l.side_a_iface_name),
            side_z_ip: side_ip(&l.side_z_pubkey, &l.side_z_iface_name),
            link_type: l.link_type.clone(),
            committed_rtt_ns: l.delay_ns,
            committed_jitter_ns: l.jitter_ns,
            bandwidth: l.bandwidth,
            isis_delay_override_ns: l.delay_override_ns,
        })
        .collect()
}

/// Refresh body for the serviceability view.
pub struct ServiceabilityRefresher<P, W> {
    source: P,
    store: W,
}

impl<P: ProgramDataSource, W: SnapshotWriter> ServiceabilityRefresher<P, W> {
    pub fn new(source: P, store: W) -> Self {
        Self { source, store }
    }

    pub fn store(&self) -> &W {
        &self.store
    }
}

impl<P: ProgramDataSource, W: SnapshotWriter> Refresh for ServiceabilityRefresher<P, W> {
    async fn refresh(&self, cancel: &CancellationToken) -> Result<()> {
        let start = Instant::now();

        let pd = with_cancel(cancel, self.source.get_program_data())
            .await
            .context("fetching program data")?;
        debug!(
            contributors = pd.contributors.len(),
            devices = pd.devices.len(),
            users = pd.users.len(),
            links = pd.links.len(),
            metros = pd.exchanges.len(),
            "fetched program data"
        );

        let snapshot = Snapshot::from_program_data(pd)?;
        let snapshot_ts = Utc::now();

        with_cancel(cancel, self.store.write_snapshot(&snapshot, snapshot_ts))
            .await
            .context("writing serviceability snapshot")?;

        info!(
            devices = snapshot.devices.len(),
            links = snapshot.links.len(),
            users = snapshot.users.len(),
            duration = ?start.elapsed(),
            "serviceability snapshot written"
        );
        Ok(())
    }
}
