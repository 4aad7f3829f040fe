use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Readiness predicate evaluated on every /readyz request.
pub type ReadinessCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Prometheus metrics for indexer health and observability.
///
/// All metrics use the "lake_indexer" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    readiness: parking_lot::Mutex<Option<ReadinessCheck>>,

    // === Views ===
    /// View refreshes by view and status (success/error/panic).
    pub view_refresh_total: CounterVec,
    /// View refresh duration by view.
    pub view_refresh_duration: HistogramVec,

    // === Graph ===
    /// Graph syncs by kind (full/topology/isis) and status.
    pub graph_sync_total: CounterVec,
    /// Graph sync duration by kind.
    pub graph_sync_duration: HistogramVec,
    /// IS-IS neighbors without a matching tunnel in the last apply.
    pub isis_unmatched_neighbors: Gauge,

    // === Usage ===
    /// Usage rows by stage (queried/converted/inserted).
    pub usage_rows_total: CounterVec,
    /// Baseline resolutions by chosen source.
    pub usage_baseline_source_total: CounterVec,

    // === Upstreams ===
    /// Upstream RPC requests by client, endpoint, and status.
    pub rpc_requests_total: CounterVec,
    /// Upstream RPC request duration by client and endpoint.
    pub rpc_request_duration: HistogramVec,
    /// Store connection state (1=connected, 0=disconnected).
    pub store_connected: GaugeVec,

    // === Lifecycle ===
    /// Whether the readiness predicate currently holds (1=yes, 0=no).
    pub indexer_ready: Gauge,
    /// Indexer startup duration by phase.
    pub start_duration: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Views ===
        let view_refresh_total = CounterVec::new(
            Opts::new(
                "view_refresh_total",
                "Total view refreshes by view and status.",
            )
            .namespace("lake_indexer"),
            &["view", "status"],
        )?;
        let view_refresh_duration = HistogramVec::new(
            HistogramOpts::new(
                "view_refresh_duration_seconds",
                "View refresh duration by view.",
            )
            .namespace("lake_indexer")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["view"],
        )?;

        // === Graph ===
        let graph_sync_total = CounterVec::new(
            Opts::new(
                "graph_sync_total",
                "Total graph syncs by kind and status.",
            )
            .namespace("lake_indexer"),
            &["kind", "status"],
        )?;
        let graph_sync_duration = HistogramVec::new(
            HistogramOpts::new(
                "graph_sync_duration_seconds",
                "Graph sync duration by kind.",
            )
            .namespace("lake_indexer")
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
            &["kind"],
        )?;
        let isis_unmatched_neighbors = Gauge::with_opts(
            Opts::new(
                "isis_unmatched_neighbors",
                "IS-IS neighbors with no matching tunnel in the last apply.",
            )
            .namespace("lake_indexer"),
        )?;

        // === Usage ===
        let usage_rows_total = CounterVec::new(
            Opts::new("usage_rows_total", "Total usage rows by pipeline stage.")
                .namespace("lake_indexer"),
            &["stage"],
        )?;
        let usage_baseline_source_total = CounterVec::new(
            Opts::new(
                "usage_baseline_source_total",
                "Total baseline resolutions by chosen source.",
            )
            .namespace("lake_indexer"),
            &["source"],
        )?;

        // === Upstreams ===
        let rpc_requests_total = CounterVec::new(
            Opts::new(
                "rpc_requests_total",
                "Total upstream RPC requests by client, endpoint and status.",
            )
            .namespace("lake_indexer"),
            &["client", "endpoint", "status"],
        )?;
        let rpc_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "rpc_request_duration_seconds",
                "Upstream RPC request duration by client and endpoint.",
            )
            .namespace("lake_indexer")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["client", "endpoint"],
        )?;
        let store_connected = GaugeVec::new(
            Opts::new(
                "store_connected",
                "Whether the store connection is established (1=yes, 0=no).",
            )
            .namespace("lake_indexer"),
            &["store"],
        )?;

        // === Lifecycle ===
        let indexer_ready = Gauge::with_opts(
            Opts::new(
                "indexer_ready",
                "Whether the indexer readiness predicate holds (1=yes, 0=no).",
            )
            .namespace("lake_indexer"),
        )?;
        let start_duration = GaugeVec::new(
            Opts::new(
                "start_duration_seconds",
                "Duration of indexer startup phases.",
            )
            .namespace("lake_indexer"),
            &["phase"],
        )?;

        registry.register(Box::new(view_refresh_total.clone()))?;
        registry.register(Box::new(view_refresh_duration.clone()))?;
        registry.register(Box::new(graph_sync_total.clone()))?;
        registry.register(Box::new(graph_sync_duration.clone()))?;
        registry.register(Box::new(isis_unmatched_neighbors.clone()))?;
        registry.register(Box::new(usage_rows_total.clone()))?;
        registry.register(Box::new(usage_baseline_source_total.clone()))?;
        registry.register(Box::new(rpc_requests_total.clone()))?;
        registry.register(Box::new(rpc_request_duration.clone()))?;
        registry.register(Box::new(store_connected.clone()))?;
        registry.register(Box::new(indexer_ready.clone()))?;
        registry.register(Box::new(start_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            readiness: parking_lot::Mutex::new(None),
            view_refresh_total,
            view_refresh_duration,
            graph_sync_total,
            graph_sync_duration,
            isis_unmatched_neighbors,
            usage_rows_total,
            usage_baseline_source_total,
            rpc_requests_total,
            rpc_request_duration,
            store_connected,
            indexer_ready,
            start_duration,
        })
    }

    /// Installs the predicate backing /readyz.
    pub fn set_readiness(&self, check: ReadinessCheck) {
        *self.readiness.lock() = Some(check);
    }

    /// Evaluates the readiness predicate. False until one is installed.
    pub fn is_ready(&self) -> bool {
        let check = self.readiness.lock().clone();
        let ready = check.is_some_and(|check| check());
        self.indexer_ready.set(if ready { 1.0 } else { 0.0 });
        ready
    }

    /// Records one upstream request outcome.
    pub fn record_rpc(&self, client: &str, endpoint: &str, status: &str, secs: f64) {
        self.rpc_requests_total
            .with_label_values(&[client, endpoint, status])
            .inc();
        self.rpc_request_duration
            .with_label_values(&[client, endpoint])
            .observe(secs);
    }

    /// Renders all registered metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Starts the HTTP server serving /metrics, /healthz, and /readyz.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            self.addr.as_str()
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/readyz", get(readyz_handler))
            .with_state(Arc::clone(self));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<HealthMetrics>>) -> impl IntoResponse {
    match state.render() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple liveness check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /readyz - 200 once the readiness predicate holds, 503 before.
async fn readyz_handler(State(state): State<Arc<HealthMetrics>>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_new_registers_all_metrics() {
        let health = HealthMetrics::new(":0").expect("should build");
        health
            .view_refresh_total
            .with_label_values(&["usage", "success"])
            .inc();
        health.record_rpc("solana", "getEpochInfo", "success", 0.02);

        let text = health.render().expect("should render");
        assert!(text.contains("lake_indexer_view_refresh_total"));
        assert!(text.contains("lake_indexer_rpc_requests_total"));
    }

    #[test]
    fn test_readiness_defaults_to_not_ready() {
        let health = HealthMetrics::new(":0").expect("should build");
        assert!(!health.is_ready());
    }

    #[test]
    fn test_readiness_follows_predicate() {
        let health = HealthMetrics::new(":0").expect("should build");
        let flag = Arc::new(AtomicBool::new(false));
        let probe = Arc::clone(&flag);
        health.set_readiness(Arc::new(move || probe.load(Ordering::SeqCst)));

        assert!(!health.is_ready());
        flag.store(true, Ordering::SeqCst);
        assert!(health.is_ready());
        assert_eq!(health.indexer_ready.get(), 1.0);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let health = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("should build"));
        health.start().await.expect("should bind");
        health.stop().await.expect("should stop");
    }
}
