pub mod env_lock;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::export::health::{HealthMetrics, ReadinessCheck};
use crate::export::ClickHouseClient;
use crate::geoip::{ClickHouseGeoIpStore, GeoIpRefresher, MaxMindResolver};
use crate::graph::{GraphStore, GraphSync, Neo4jClient};
use crate::isis::DumpSource;
use crate::migrate::{ClickHouseMigrator, Migrator};
use crate::serviceability::rpc::ServiceabilityClient;
use crate::serviceability::store::ServiceabilityStore;
use crate::serviceability::ServiceabilityRefresher;
use crate::solana::{ClickHouseSolanaStore, SolanaClient, SolanaRefresher};
use crate::telemetry::latency::{ClickHouseLatencyStore, LatencyRefresher};
use crate::telemetry::rpc::TelemetryClient;
use crate::telemetry::usage::baseline::TIMESERIES_TIMEOUT;
use crate::telemetry::usage::influx::InfluxClient;
use crate::telemetry::usage::store::ClickHouseUsageStore;
use crate::telemetry::usage::UsageRefresher;
use crate::view::{Readiness, View};

use self::env_lock::{ensure_env_lock, GraphEnvLock};

/// Request metrics callback shared by every upstream client.
type RpcMetrics = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

fn rpc_metrics(health: &Arc<HealthMetrics>, client: &'static str) -> RpcMetrics {
    let health = Arc::clone(health);
    Box::new(move |endpoint, status, elapsed| {
        health.record_rpc(client, endpoint, status, elapsed.as_secs_f64())
    })
}

/// Top-level orchestrator.
///
/// Connects the stores, checks their environment locks, then starts every
/// view and the graph sync loops under one cancellation token.
pub struct Indexer {
    cfg: Config,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Indexer {
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate()?;
        let health = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
        Ok(Self {
            cfg,
            health,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    fn phase_done(&self, phase: &str, started: Instant) {
        let elapsed = started.elapsed();
        self.health
            .start_duration
            .with_label_values(&[phase])
            .set(elapsed.as_secs_f64());
        info!(phase, duration = ?elapsed, "startup phase complete");
    }

    pub async fn start(&mut self) -> Result<()> {
        let started = Instant::now();
        let total = started;

        // Phase 0: probes, reporting not ready until the predicate is installed.
        self.health.start().await.context("starting health server")?;
        self.phase_done("health", started);

        // Phase 1: ClickHouse.
        let started = Instant::now();
        let clickhouse = ClickHouseClient::new(self.cfg.clickhouse.clone());
        clickhouse.connect().await?;
        self.health
            .store_connected
            .with_label_values(&["clickhouse"])
            .set(1.0);
        if self.cfg.clickhouse.migrations.enabled {
            ClickHouseMigrator::new(clickhouse.clone())
                .up()
                .await
                .context("running clickhouse migrations")?;
        }
        self.phase_done("clickhouse", started);

        // Phase 2: Neo4j.
        let started = Instant::now();
        let neo4j = if self.cfg.neo4j.enabled {
            let client = Neo4jClient::connect(&self.cfg.neo4j).await?;
            self.health.store_connected.with_label_values(&["neo4j"]).set(1.0);
            if self.cfg.neo4j.migrations.enabled {
                client.ensure_constraints().await?;
            }
            Some(client)
        } else {
            info!("neo4j disabled, graph sync will not run");
            None
        };
        self.phase_done("neo4j", started);

        // Phase 3: environment locks, before anything writes.
        let started = Instant::now();
        ensure_env_lock(&clickhouse, &self.cfg.dz_env).await?;
        if let Some(client) = &neo4j {
            ensure_env_lock(&GraphEnvLock::new(client), &self.cfg.dz_env).await?;
        }
        self.phase_done("env_lock", started);

        // Phase 4: base views.
        let started = Instant::now();
        let interval = self.cfg.refresh_interval;

        let svc = Arc::new(View::new(
            "serviceability",
            ServiceabilityRefresher::new(
                ServiceabilityClient::new(&self.cfg.serviceability)?
                    .with_metrics(rpc_metrics(&self.health, "serviceability")),
                ServiceabilityStore::new(clickhouse.clone()),
            ),
            interval,
            Arc::clone(&self.health),
        ));

        let latency = Arc::new(View::new(
            "telemetry_latency",
            LatencyRefresher::new(
                ClickHouseLatencyStore::new(clickhouse.clone()),
                TelemetryClient::new(&self.cfg.telemetry)?
                    .with_metrics(rpc_metrics(&self.health, "telemetry")),
                SolanaClient::new(&self.cfg.solana)?.with_metrics(rpc_metrics(&self.health, "solana")),
                svc.readiness(),
                self.cfg.telemetry_ready_timeout(),
                self.cfg.max_concurrency,
            ),
            interval,
            Arc::clone(&self.health),
        ));

        let sol = Arc::new(View::new(
            "solana",
            SolanaRefresher::new(
                SolanaClient::new(&self.cfg.solana)?.with_metrics(rpc_metrics(&self.health, "solana")),
                ClickHouseSolanaStore::new(clickhouse.clone()),
            ),
            interval,
            Arc::clone(&self.health),
        ));
        self.phase_done("base_views", started);

        // Phase 5: views built on the base stores.
        let started = Instant::now();
        let geoip = Arc::new(View::new(
            "geoip",
            GeoIpRefresher::new(
                MaxMindResolver::open(&self.cfg.geoip)?,
                ClickHouseGeoIpStore::new(clickhouse.clone()),
            ),
            interval,
            Arc::clone(&self.health),
        ));

        let usage = if self.cfg.usage.enabled {
            let source = InfluxClient::new(&self.cfg.usage)?
                .with_metrics(rpc_metrics(&self.health, "influx"));
            Some(Arc::new(View::new(
                "telemetry_usage",
                UsageRefresher::new(
                    ClickHouseUsageStore::new(clickhouse.clone()),
                    source,
                    self.cfg.usage.query_window,
                    TIMESERIES_TIMEOUT,
                    Arc::clone(&self.health),
                )?,
                self.cfg.usage_refresh_interval(),
                Arc::clone(&self.health),
            )))
        } else {
            None
        };
        self.phase_done("dependent_views", started);

        // Phase 6: loops.
        let started = Instant::now();
        let mut required: Vec<Readiness> = vec![
            svc.readiness(),
            latency.readiness(),
            sol.readiness(),
            geoip.readiness(),
        ];

        self.handles.push(svc.start(self.cancel.clone()));
        self.handles.push(latency.start(self.cancel.clone()));
        self.handles.push(sol.start(self.cancel.clone()));
        self.handles.push(geoip.start(self.cancel.clone()));
        if let Some(usage) = &usage {
            if self.cfg.ready_includes_usage {
                required.push(usage.readiness());
            }
            self.handles.push(usage.start(self.cancel.clone()));
        }

        if let Some(client) = neo4j {
            let isis = if self.cfg.isis.enabled {
                match DumpSource::from_config(&self.cfg.isis).await {
                    Ok(source) => Some(source),
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "isis source unavailable, graph sync without isis");
                        None
                    }
                }
            } else {
                None
            };

            let sync = Arc::new(GraphSync::new(
                GraphStore::new(client),
                ServiceabilityStore::new(clickhouse.clone()),
                isis,
                svc.readiness(),
                interval,
                self.cfg.isis.refresh_interval,
                Arc::clone(&self.health),
            ));
            self.handles.extend(sync.start(self.cancel.clone()));
        }
        self.phase_done("start_loops", started);

        let skip = self.cfg.skip_ready_wait;
        let check: ReadinessCheck =
            Arc::new(move || skip || required.iter().all(Readiness::is_ready));
        self.health.set_readiness(check);

        self.phase_done("total", total);
        info!(
            env = %self.cfg.dz_env,
            usage = usage.is_some(),
            skip_ready_wait = skip,
            "indexer started"
        );
        Ok(())
    }

    /// Cancels every loop and waits for them to exit.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        for handle in futures::future::join_all(self.handles.drain(..)).await {
            if let Err(e) = handle {
                warn!(error = %e, "task exited abnormally");
            }
        }
        self.health.stop().await?;
        info!("indexer stopped");
        Ok(())
    }
}
