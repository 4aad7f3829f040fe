use std::collections::HashMap;
use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::isis::Lsp;
use crate::serviceability::{Contributor, Device, Link, Metro, Snapshot, User};

use super::{GraphClient, Statement};

/// Clears every topology node while keeping the environment lock.
const CLEAR_GRAPH: &str = "MATCH (n) WHERE NOT n:_EnvLock DETACH DELETE n";

const TUNNEL_LINKS: &str = "MATCH (link:Link) \
     WHERE link.tunnel_net IS NOT NULL AND link.tunnel_net <> '' \
     MATCH (link)-[:CONNECTS {side: 'A'}]->(devA:Device) \
     MATCH (link)-[:CONNECTS {side: 'Z'}]->(devZ:Device) \
     RETURN link.pk AS pk, link.tunnel_net AS tunnel_net, devA.pk AS side_a_pk, devZ.pk AS side_z_pk";

/// Link and devices reached through one tunnel address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelMapping {
    pub link_pk: String,
    /// Device configured with this address.
    pub neighbor_pk: String,
    /// Device on the other end of the link.
    pub local_pk: String,
}

/// Tunnel address to mapping.
pub type TunnelMap = HashMap<String, TunnelMapping>;

#[derive(Debug, Deserialize)]
struct TunnelLinkRow {
    pk: String,
    tunnel_net: String,
    side_a_pk: String,
    side_z_pk: String,
}

/// Both addresses of a `/31` network, lower first.
pub fn parse_tunnel_net31(cidr: &str) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let (addr, len) = cidr.split_once('/')?;
    if len != "31" {
        return None;
    }
    let network = u32::from(addr.parse::<Ipv4Addr>().ok()?) & !1;
    Some((Ipv4Addr::from(network), Ipv4Addr::from(network | 1)))
}

fn add_tunnel(map: &mut TunnelMap, link_pk: &str, tunnel_net: &str, side_a_pk: &str, side_z_pk: &str) {
    let Some((low, high)) = parse_tunnel_net31(tunnel_net) else {
        debug!(link_pk, tunnel_net, "skipping link without /31 tunnel net");
        return;
    };
    map.insert(
        low.to_string(),
        TunnelMapping {
            link_pk: link_pk.to_string(),
            neighbor_pk: side_a_pk.to_string(),
            local_pk: side_z_pk.to_string(),
        },
    );
    map.insert(
        high.to_string(),
        TunnelMapping {
            link_pk: link_pk.to_string(),
            neighbor_pk: side_z_pk.to_string(),
            local_pk: side_a_pk.to_string(),
        },
    );
}

/// Tunnel map derived from topology links.
pub fn tunnel_map_from_links(links: &[Link]) -> TunnelMap {
    let mut map = TunnelMap::new();
    for l in links.iter().filter(|l| !l.tunnel_net.is_empty()) {
        add_tunnel(&mut map, &l.pk, &l.tunnel_net, &l.side_a_pk, &l.side_z_pk);
    }
    map
}

/// Counts from applying one set of LSPs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsisStats {
    pub lsps: usize,
    pub adjacencies: usize,
    pub unmatched_neighbors: usize,
}

fn contributor_statement(c: &Contributor) -> Statement {
    Statement::new("MERGE (cont:Contributor {pk: $pk}) SET cont.code = $code, cont.name = $name")
        .param("pk", c.pk.as_str())
        .param("code", c.code.as_str())
        .param("name", c.name.as_str())
}

fn metro_statement(m: &Metro) -> Statement {
    Statement::new(
        "MERGE (m:Metro {pk: $pk}) \
         SET m.code = $code, m.name = $name, m.longitude = $longitude, m.latitude = $latitude",
    )
    .param("pk", m.pk.as_str())
    .param("code", m.code.as_str())
    .param("name", m.name.as_str())
    .param("longitude", m.longitude)
    .param("latitude", m.latitude)
}

fn device_statement(d: &Device) -> Statement {
    Statement::new(
        "MERGE (dev:Device {pk: $pk}) \
         SET dev.status = $status, dev.device_type = $device_type, dev.code = $code, \
             dev.public_ip = $public_ip, dev.max_users = $max_users \
         WITH dev \
         OPTIONAL MATCH (c:Contributor {pk: $contributor_pk}) \
         FOREACH (_ IN CASE WHEN c IS NULL THEN [] ELSE [1] END | MERGE (dev)-[:OPERATES]->(c)) \
         WITH dev \
         OPTIONAL MATCH (m:Metro {pk: $metro_pk}) \
         FOREACH (_ IN CASE WHEN m IS NULL THEN [] ELSE [1] END | MERGE (dev)-[:LOCATED_IN]->(m))",
    )
    .param("pk", d.pk.as_str())
    .param("status", d.status.as_str())
    .param("device_type", d.device_type.as_str())
    .param("code", d.code.as_str())
    .param("public_ip", d.public_ip.as_str())
    .param("max_users", d.max_users)
    .param("contributor_pk", d.contributor_pk.as_str())
    .param("metro_pk", d.metro_pk.as_str())
}

fn link_statement(l: &Link) -> Statement {
    Statement::new(
        "MERGE (link:Link {pk: $pk}) \
         SET link.status = $status, link.code = $code, link.tunnel_net = $tunnel_net, \
             link.link_type = $link_type, link.committed_rtt_ns = $committed_rtt_ns, \
             link.committed_jitter_ns = $committed_jitter_ns, link.bandwidth = $bandwidth, \
             link.isis_delay_override_ns = $isis_delay_override_ns \
         WITH link \
         OPTIONAL MATCH (c:Contributor {pk: $contributor_pk}) \
         FOREACH (_ IN CASE WHEN c IS NULL THEN [] ELSE [1] END | MERGE (link)-[:OWNED_BY]->(c)) \
         WITH link \
         OPTIONAL MATCH (devA:Device {pk: $side_a_pk}) \
         FOREACH (_ IN CASE WHEN devA IS NULL THEN [] ELSE [1] END | \
             MERGE (link)-[:CONNECTS {side: 'A', iface_name: $side_a_iface_name}]->(devA)) \
         WITH link \
         OPTIONAL MATCH (devZ:Device {pk: $side_z_pk}) \
         FOREACH (_ IN CASE WHEN devZ IS NULL THEN [] ELSE [1] END | \
             MERGE (link)-[:CONNECTS {side: 'Z', iface_name: $side_z_iface_name}]->(devZ))",
    )
    .param("pk", l.pk.as_str())
    .param("status", l.status.as_str())
    .param("code", l.code.as_str())
    .param("tunnel_net", l.tunnel_net.as_str())
    .param("link_type", l.link_type.as_str())
    .param("committed_rtt_ns", l.committed_rtt_ns)
    .param("committed_jitter_ns", l.committed_jitter_ns)
    .param("bandwidth", l.bandwidth)
    .param("isis_delay_override_ns", l.isis_delay_override_ns)
    .param("contributor_pk", l.contributor_pk.as_str())
    .param("side_a_pk", l.side_a_pk.as_str())
    .param("side_z_pk", l.side_z_pk.as_str())
    .param("side_a_iface_name", l.side_a_iface_name.as_str())
    .param("side_z_iface_name", l.side_z_iface_name.as_str())
}

fn user_statement(u: &User) -> Statement {
    Statement::new(
        "MERGE (user:User {pk: $pk}) \
         SET user.owner_pubkey = $owner_pubkey, user.status = $status, user.kind = $kind, \
             user.client_ip = $client_ip, user.dz_ip = $dz_ip, user.tunnel_id = $tunnel_id \
         WITH user \
         MATCH (dev:Device {pk: $device_pk}) \
         MERGE (user)-[:ASSIGNED_TO]->(dev)",
    )
    .param("pk", u.pk.as_str())
    .param("owner_pubkey", u.owner_pubkey.as_str())
    .param("status", u.status.as_str())
    .param("kind", u.kind.as_str())
    .param("client_ip", u.client_ip.as_str())
    .param("dz_ip", u.dz_ip.as_str())
    .param("tunnel_id", u.tunnel_id)
    .param("device_pk", u.device_pk.as_str())
}

/// Statements that rebuild the graph from a topology snapshot.
pub fn topology_statements(topo: &Snapshot) -> Vec<Statement> {
    let mut stmts = Vec::with_capacity(
        1 + topo.contributors.len()
            + topo.metros.len()
            + topo.devices.len()
            + topo.links.len()
            + topo.users.len(),
    );
    stmts.push(Statement::new(CLEAR_GRAPH));
    stmts.extend(topo.contributors.iter().map(contributor_statement));
    stmts.extend(topo.metros.iter().map(metro_statement));
    stmts.extend(topo.devices.iter().map(device_statement));
    stmts.extend(topo.links.iter().map(link_statement));
    stmts.extend(topo.users.iter().map(user_statement));
    stmts
}

/// Statements that apply IS-IS adjacencies onto an existing topology.
pub fn isis_statements(lsps: &[Lsp], tunnels: &TunnelMap, now: DateTime<Utc>) -> (Vec<Statement>, IsisStats) {
    let last_sync = now.timestamp();
    let mut stmts = Vec::new();
    let mut stats = IsisStats {
        lsps: lsps.len(),
        ..Default::default()
    };

    for lsp in lsps {
        for neighbor in &lsp.neighbors {
            let Some(mapping) = tunnels.get(&neighbor.neighbor_addr) else {
                stats.unmatched_neighbors += 1;
                debug!(
                    neighbor_addr = %neighbor.neighbor_addr,
                    neighbor_system_id = %neighbor.system_id,
                    "unmatched IS-IS neighbor"
                );
                continue;
            };
            let adj_sids: Vec<i64> = neighbor.adj_sids.iter().map(|s| i64::from(*s)).collect();

            stmts.push(
                Statement::new(
                    "MATCH (link:Link {pk: $pk}) \
                     SET link.isis_metric = $metric, link.isis_adj_sids = $adj_sids, \
                         link.isis_last_sync = $last_sync",
                )
                .param("pk", mapping.link_pk.as_str())
                .param("metric", neighbor.metric)
                .param("adj_sids", adj_sids.clone())
                .param("last_sync", last_sync),
            );
            stmts.push(
                Statement::new(
                    "MATCH (d:Device {pk: $pk}) \
                     SET d.isis_system_id = $system_id, d.isis_router_id = $router_id, \
                         d.isis_last_sync = $last_sync",
                )
                .param("pk", mapping.local_pk.as_str())
                .param("system_id", lsp.system_id.as_str())
                .param("router_id", lsp.router_id.as_str())
                .param("last_sync", last_sync),
            );
            stmts.push(
                Statement::new(
                    "MATCH (d1:Device {pk: $from_pk}) \
                     MATCH (d2:Device {pk: $to_pk}) \
                     MERGE (d1)-[r:ISIS_ADJACENT]->(d2) \
                     SET r.metric = $metric, r.neighbor_addr = $neighbor_addr, \
                         r.adj_sids = $adj_sids, r.last_seen = $last_seen",
                )
                .param("from_pk", mapping.local_pk.as_str())
                .param("to_pk", mapping.neighbor_pk.as_str())
                .param("metric", neighbor.metric)
                .param("neighbor_addr", neighbor.neighbor_addr.as_str())
                .param("adj_sids", adj_sids)
                .param("last_seen", last_sync),
            );
            stats.adjacencies += 1;
        }
    }

    (stmts, stats)
}

/// Writes topology and IS-IS state into the graph.
pub struct GraphStore<G> {
    client: G,
}

impl<G: GraphClient> GraphStore<G> {
    pub fn new(client: G) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &G {
        &self.client
    }

    /// Rebuilds the graph from `topo` and, when given, the IS-IS LSPs, in one
    /// transaction.
    pub async fn sync_with_isis(
        &self,
        topo: &Snapshot,
        lsps: Option<&[Lsp]>,
        now: DateTime<Utc>,
    ) -> Result<Option<IsisStats>> {
        let mut stmts = topology_statements(topo);

        let stats = lsps.map(|lsps| {
            let tunnels = tunnel_map_from_links(&topo.links);
            let (isis, stats) = isis_statements(lsps, &tunnels, now);
            stmts.extend(isis);
            stats
        });

        self.client
            .write_atomic(stmts)
            .await
            .context("applying graph sync")?;

        info!(
            contributors = topo.contributors.len(),
            devices = topo.devices.len(),
            metros = topo.metros.len(),
            links = topo.links.len(),
            users = topo.users.len(),
            isis = stats.is_some(),
            "graph sync completed"
        );
        Ok(stats)
    }

    /// Tunnel map built from the links currently in the graph.
    pub async fn tunnel_map(&self) -> Result<TunnelMap> {
        let rows: Vec<TunnelLinkRow> = self
            .client
            .fetch(Statement::new(TUNNEL_LINKS))
            .await
            .context("querying tunnel links")?;

        let mut map = TunnelMap::new();
        for r in &rows {
            add_tunnel(&mut map, &r.pk, &r.tunnel_net, &r.side_a_pk, &r.side_z_pk);
        }
        Ok(map)
    }

    /// Applies IS-IS adjacencies onto the topology already in the graph.
    pub async fn sync_isis(&self, lsps: &[Lsp], now: DateTime<Utc>) -> Result<IsisStats> {
        let tunnels = self.tunnel_map().await?;
        debug!(mappings = tunnels.len(), "built tunnel map");

        let (stmts, stats) = isis_statements(lsps, &tunnels, now);
        if !stmts.is_empty() {
            self.client
                .write_atomic(stmts)
                .await
                .context("applying isis sync")?;
        }

        info!(
            lsps = stats.lsps,
            adjacencies = stats.adjacencies,
            unmatched_neighbors = stats.unmatched_neighbors,
            "isis sync completed"
        );
        Ok(stats)
    }
}
