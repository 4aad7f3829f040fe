pub mod rpc;

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::with_cancel;
use crate::export::{format_datetime, sql_opt_i64, sql_opt_str, sql_str, ClickHouseClient};
use crate::view::Refresh;

use self::rpc::{ClusterNode, EpochInfo, SolanaRpc, VoteAccount};

pub use self::rpc::SolanaClient;

pub const GOSSIP_NODES_TABLE: &str = "fact_solana_gossip_nodes";
pub const VOTE_ACCOUNTS_TABLE: &str = "fact_solana_vote_accounts";

/// Current chain epoch.
pub trait EpochSource: Send + Sync + 'static {
    fn current_epoch(&self) -> impl Future<Output = Result<u64>> + Send;
}

impl EpochSource for SolanaClient {
    async fn current_epoch(&self) -> Result<u64> {
        Ok(self.get_epoch_info().await?.epoch)
    }
}

/// One gossip node as observed at a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct GossipNode {
    pub pubkey: String,
    pub gossip_ip: Option<IpAddr>,
    pub gossip_port: Option<u16>,
    pub tpu_quic: Option<String>,
    pub version: Option<String>,
    pub shred_version: Option<i64>,
}

impl From<ClusterNode> for GossipNode {
    fn from(node: ClusterNode) -> Self {
        let addr = node.gossip.as_deref().and_then(|s| s.parse::<SocketAddr>().ok());
        Self {
            pubkey: node.pubkey,
            gossip_ip: addr.map(|a| a.ip()),
            gossip_port: addr.map(|a| a.port()),
            tpu_quic: node.tpu_quic,
            version: node.version,
            shred_version: node.shred_version,
        }
    }
}

/// One chain snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSnapshot {
    pub epoch: EpochInfo,
    pub nodes: Vec<GossipNode>,
    /// Vote accounts with their delinquency flag.
    pub votes: Vec<(VoteAccount, bool)>,
}

/// Persistence for the chain-node view.
pub trait SolanaStore: Send + Sync + 'static {
    fn write_snapshot(
        &self,
        snapshot: &ChainSnapshot,
        snapshot_ts: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Distinct gossip IPs of the latest snapshot.
    fn gossip_ips(&self) -> impl Future<Output = Result<Vec<IpAddr>>> + Send;
}

/// Refresh body for the chain-node view.
pub struct SolanaRefresher<R, S> {
    rpc: R,
    store: S,
}

impl<R: SolanaRpc, S: SolanaStore> SolanaRefresher<R, S> {
    pub fn new(rpc: R, store: S) -> Self {
        Self { rpc, store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<R: SolanaRpc, S: SolanaStore> Refresh for SolanaRefresher<R, S> {
    async fn refresh(&self, cancel: &CancellationToken) -> Result<()> {
        let start = Instant::now();

        let epoch = with_cancel(cancel, self.rpc.get_epoch_info())
            .await
            .context("fetching epoch info")?;
        let nodes = with_cancel(cancel, self.rpc.get_cluster_nodes())
            .await
            .context("fetching cluster nodes")?;
        let votes = with_cancel(cancel, self.rpc.get_vote_accounts())
            .await
            .context("fetching vote accounts")?;
        debug!(
            epoch = epoch.epoch,
            nodes = nodes.len(),
            current = votes.current.len(),
            delinquent = votes.delinquent.len(),
            "fetched chain state"
        );

        let snapshot = ChainSnapshot {
            epoch,
            nodes: nodes.into_iter().map(GossipNode::from).collect(),
            votes: votes
                .current
                .into_iter()
                .map(|v| (v, false))
                .chain(votes.delinquent.into_iter().map(|v| (v, true)))
                .collect(),
        };

        with_cancel(cancel, self.store.write_snapshot(&snapshot, Utc::now()))
            .await
            .context("writing chain snapshot")?;

        info!(
            epoch = snapshot.epoch.epoch,
            nodes = snapshot.nodes.len(),
            votes = snapshot.votes.len(),
            duration = ?start.elapsed(),
            "solana snapshot written"
        );
        Ok(())
    }
}

/// [`SolanaStore`] backed by ClickHouse.
#[derive(Clone)]
pub struct ClickHouseSolanaStore {
    client: ClickHouseClient,
}

impl ClickHouseSolanaStore {
    pub fn new(client: ClickHouseClient) -> Self {
        Self { client }
    }
}

fn render_node(node: &GossipNode, prefix: &str) -> String {
    format!(
        "({prefix}, {}, {}, {}, {}, {}, {})",
        sql_str(&node.pubkey),
        sql_opt_str(node.gossip_ip.map(|ip| ip.to_string()).as_deref()),
        sql_opt_i64(node.gossip_port.map(i64::from)),
        sql_opt_str(node.tpu_quic.as_deref()),
        sql_opt_str(node.version.as_deref()),
        sql_opt_i64(node.shred_version),
    )
}

fn render_vote(vote: &VoteAccount, delinquent: bool, prefix: &str) -> String {
    format!(
        "({prefix}, {}, {}, {}, {}, {}, {}, {}, {})",
        sql_str(&vote.vote_pubkey),
        sql_str(&vote.node_pubkey),
        vote.activated_stake,
        vote.commission,
        vote.last_vote,
        vote.root_slot,
        u8::from(vote.epoch_vote_account),
        u8::from(delinquent),
    )
}

impl SolanaStore for ClickHouseSolanaStore {
    async fn write_snapshot(&self, snapshot: &ChainSnapshot, snapshot_ts: DateTime<Utc>) -> Result<()> {
        let prefix = format!("{}, {}", format_datetime(snapshot_ts), snapshot.epoch.epoch);

        let nodes: Vec<String> = snapshot.nodes.iter().map(|n| render_node(n, &prefix)).collect();
        self.client
            .insert_rows(
                GOSSIP_NODES_TABLE,
                "snapshot_ts, epoch, pubkey, gossip_ip, gossip_port, tpu_quic, version, shred_version",
                &nodes,
            )
            .await
            .context("inserting gossip nodes")?;

        let votes: Vec<String> = snapshot
            .votes
            .iter()
            .map(|(v, delinquent)| render_vote(v, *delinquent, &prefix))
            .collect();
        self.client
            .insert_rows(
                VOTE_ACCOUNTS_TABLE,
                "snapshot_ts, epoch, vote_pubkey, node_pubkey, activated_stake, commission, \
                 last_vote, root_slot, epoch_vote_account, delinquent",
                &votes,
            )
            .await
            .context("inserting vote accounts")?;

        Ok(())
    }

    async fn gossip_ips(&self) -> Result<Vec<IpAddr>> {
        let sql = format!(
            "SELECT DISTINCT assumeNotNull(gossip_ip) AS ip FROM {GOSSIP_NODES_TABLE} \
             WHERE snapshot_ts = (SELECT max(snapshot_ts) FROM {GOSSIP_NODES_TABLE}) \
             AND gossip_ip IS NOT NULL"
        );
        let block = self.client.query(&sql).await.context("querying gossip ips")?;

        let mut ips = Vec::new();
        for row in block.rows() {
            let ip: String = row.get("ip")?;
            if let Ok(ip) = ip.parse() {
                ips.push(ip);
            }
        }
        Ok(ips)
    }
}
