use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{is_cancelled, with_cancel, Error};
use crate::export::health::HealthMetrics;
use crate::isis::{self, Lsp, Source};
use crate::serviceability::store::ServiceabilityStore;
use crate::serviceability::{Contributor, Metro, Snapshot};
use crate::view::Readiness;

use super::store::{GraphStore, IsisStats};
use super::GraphClient;

/// Current base topology to mirror into the graph.
pub trait TopologySource: Send + Sync + 'static {
    fn current_topology(&self) -> impl Future<Output = Result<Snapshot>> + Send;
}

impl TopologySource for ServiceabilityStore {
    async fn current_topology(&self) -> Result<Snapshot> {
        Ok(Snapshot {
            contributors: self
                .current::<Contributor>()
                .await
                .context("querying contributors")?,
            devices: self.current_devices().await.context("querying devices")?,
            metros: self.current::<Metro>().await.context("querying metros")?,
            links: self.current_links().await.context("querying links")?,
            users: self.current_users().await.context("querying users")?,
        })
    }
}

/// Sync kind label on `graph_sync_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Topology plus IS-IS in one transaction.
    Full,
    /// Topology only, IS-IS disabled or unavailable.
    Topology,
    /// IS-IS adjacencies only.
    Isis,
}

impl SyncKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncKind::Full => "full",
            SyncKind::Topology => "topology",
            SyncKind::Isis => "isis",
        }
    }
}

/// Keeps the graph store in step with the base topology and IS-IS state.
///
/// The full-sync loop waits for the serviceability view, then rebuilds the
/// graph every `interval`. The IS-IS loop refreshes adjacencies every
/// `isis_interval` and only starts once a full sync has completed.
pub struct GraphSync<G, T, S> {
    store: GraphStore<G>,
    topology: T,
    isis: Option<S>,
    serviceability: Readiness,
    interval: Duration,
    isis_interval: Duration,
    health: Arc<HealthMetrics>,
    synced: watch::Sender<bool>,
}

impl<G, T, S> GraphSync<G, T, S>
where
    G: GraphClient,
    T: TopologySource,
    S: Source,
{
    pub fn new(
        store: GraphStore<G>,
        topology: T,
        isis: Option<S>,
        serviceability: Readiness,
        interval: Duration,
        isis_interval: Duration,
        health: Arc<HealthMetrics>,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            store,
            topology,
            isis,
            serviceability,
            interval,
            isis_interval,
            health,
            synced,
        }
    }

    pub fn store(&self) -> &GraphStore<G> {
        &self.store
    }

    /// Whether a full sync has completed.
    pub fn synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Blocks until a full sync has completed or `cancel` fires.
    pub async fn wait_synced(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.synced.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => Err(anyhow::Error::new(Error::Cancelled)),
            res = rx.wait_for(|synced| *synced) => res
                .map(|_| ())
                .map_err(|_| anyhow!("graph sync dropped before first sync")),
        }
    }

    async fn fetch_lsps(&self, source: &S, cancel: &CancellationToken) -> Result<Vec<Lsp>> {
        let dump = with_cancel(cancel, source.fetch_latest())
            .await
            .context("fetching isis dump")?;
        debug!(file = %dump.file_name, bytes = dump.raw_json.len(), "fetched isis dump");
        isis::parse(&dump.raw_json).with_context(|| format!("parsing isis dump {}", dump.file_name))
    }

    /// One full sync. IS-IS fetch or parse failures degrade to a
    /// topology-only sync.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<SyncKind> {
        let start = Instant::now();

        let topo = with_cancel(cancel, self.topology.current_topology())
            .await
            .context("loading topology")?;

        let lsps = match &self.isis {
            None => None,
            Some(source) => match self.fetch_lsps(source, cancel).await {
                Ok(lsps) => Some(lsps),
                Err(e) if is_cancelled(&e) => return Err(e),
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "isis unavailable, syncing topology only");
                    None
                }
            },
        };
        let kind = if lsps.is_some() {
            SyncKind::Full
        } else {
            SyncKind::Topology
        };

        let res = with_cancel(
            cancel,
            self.store.sync_with_isis(&topo, lsps.as_deref(), Utc::now()),
        )
        .await;

        match res {
            Ok(stats) => {
                if let Some(stats) = stats {
                    self.record_isis(&stats);
                }
                self.record(kind, "success", start.elapsed());
                self.synced.send_if_modified(|synced| !std::mem::replace(synced, true));
                Ok(kind)
            }
            Err(e) => {
                if !is_cancelled(&e) {
                    self.record(kind, "error", start.elapsed());
                }
                Err(e)
            }
        }
    }

    /// One IS-IS-only sync onto the topology already in the graph.
    pub async fn sync_isis(&self, cancel: &CancellationToken) -> Result<IsisStats> {
        let source = self
            .isis
            .as_ref()
            .ok_or_else(|| anyhow!("isis source not configured"))?;
        let start = Instant::now();

        let res = async {
            let lsps = self.fetch_lsps(source, cancel).await?;
            with_cancel(cancel, self.store.sync_isis(&lsps, Utc::now())).await
        }
        .await;

        match res {
            Ok(stats) => {
                self.record_isis(&stats);
                self.record(SyncKind::Isis, "success", start.elapsed());
                Ok(stats)
            }
            Err(e) => {
                if !is_cancelled(&e) {
                    self.record(SyncKind::Isis, "error", start.elapsed());
                }
                Err(e)
            }
        }
    }

    fn record(&self, kind: SyncKind, status: &str, elapsed: Duration) {
        self.health
            .graph_sync_total
            .with_label_values(&[kind.as_str(), status])
            .inc();
        self.health
            .graph_sync_duration
            .with_label_values(&[kind.as_str()])
            .observe(elapsed.as_secs_f64());
        info!(kind = kind.as_str(), status, duration = ?elapsed, "graph sync finished");
    }

    fn record_isis(&self, stats: &IsisStats) {
        self.health
            .isis_unmatched_neighbors
            .set(stats.unmatched_neighbors as f64);
        if stats.unmatched_neighbors > 0 {
            warn!(unmatched = stats.unmatched_neighbors, "isis neighbors without a matching link");
        }
    }
}

impl<G, T, S> GraphSync<G, T, S>
where
    G: GraphClient,
    T: TopologySource,
    S: Source,
{
    /// Spawns the full-sync loop and, when IS-IS is configured, the IS-IS loop.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        let this = Arc::clone(self);
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = this.serviceability.wait(&token).await {
                if !is_cancelled(&e) {
                    error!(error = %format!("{e:#}"), "graph sync not started");
                }
                return;
            }
            info!(interval = ?this.interval, "starting graph sync loop");
            this.run_loop(this.interval, &token, SyncKind::Full).await;
        }));

        if self.isis.is_some() {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                if this.wait_synced(&cancel).await.is_err() {
                    return;
                }
                info!(interval = ?this.isis_interval, "starting isis sync loop");
                this.run_loop(this.isis_interval, &cancel, SyncKind::Isis).await;
            }));
        }

        handles
    }

    async fn run_loop(&self, interval: Duration, cancel: &CancellationToken, kind: SyncKind) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // The IS-IS loop starts right after a full sync, so skip its first tick.
        if kind == SyncKind::Isis {
            ticker.tick().await;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.supervised(cancel, kind).await,
            }
        }
    }

    async fn supervised(&self, cancel: &CancellationToken, kind: SyncKind) {
        let res = match kind {
            SyncKind::Isis => AssertUnwindSafe(async { self.sync_isis(cancel).await.map(|_| ()) })
                .catch_unwind()
                .await,
            _ => AssertUnwindSafe(async { self.sync(cancel).await.map(|_| ()) })
                .catch_unwind()
                .await,
        };

        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) if is_cancelled(&e) => {}
            Ok(Err(e)) => error!(kind = kind.as_str(), error = %format!("{e:#}"), "graph sync failed"),
            Err(_) => {
                self.health
                    .graph_sync_total
                    .with_label_values(&[kind.as_str(), "panic"])
                    .inc();
                error!(kind = kind.as_str(), "graph sync panicked");
            }
        }
    }
}
