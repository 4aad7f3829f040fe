use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Environments an indexer may be bound to.
pub const KNOWN_ENVS: &[&str] = &["devnet", "testnet", "mainnet-beta"];

/// Top-level configuration for the lake indexer.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Deployment environment this indexer writes for. Default: "mainnet-beta".
    #[serde(default = "default_dz_env")]
    pub dz_env: String,

    /// Base refresh interval shared by all views. Default: 60s.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Upper bound on concurrent upstream fetches within a refresh. Default: 64.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Report ready immediately instead of waiting for the first refresh of every view.
    #[serde(default)]
    pub skip_ready_wait: bool,

    /// Include the usage view in the readiness predicate.
    #[serde(default)]
    pub ready_includes_usage: bool,

    /// ClickHouse connection configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Neo4j graph store configuration.
    #[serde(default)]
    pub neo4j: Neo4jConfig,

    /// Serviceability program RPC.
    #[serde(default)]
    pub serviceability: RpcConfig,

    /// Telemetry program RPC (device-link latency samples).
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Solana JSON-RPC endpoint.
    #[serde(default)]
    pub solana: RpcConfig,

    /// MaxMind databases for IP geolocation.
    #[serde(default)]
    pub geoip: GeoIpConfig,

    /// Interface counter usage view.
    #[serde(default)]
    pub usage: UsageConfig,

    /// IS-IS control-plane dump ingestion.
    #[serde(default)]
    pub isis: IsisConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Apply embedded migrations on startup.
    #[serde(default)]
    pub enabled: bool,
}

/// Neo4j graph store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Neo4jConfig {
    /// Enable the graph store and its sync loops.
    #[serde(default)]
    pub enabled: bool,

    /// Bolt URI (e.g., "bolt://localhost:7687").
    #[serde(default)]
    pub uri: String,

    /// Target database name. Default: "neo4j".
    #[serde(default = "default_neo4j_database")]
    pub database: String,

    /// Neo4j username. Default: "neo4j".
    #[serde(default = "default_neo4j_username")]
    pub username: String,

    /// Neo4j password.
    #[serde(default)]
    pub password: String,

    /// Create uniqueness constraints on startup.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Generic JSON-over-HTTP RPC endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Base URL.
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_rpc_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Telemetry RPC plus the latency view's dependency wait.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Base URL.
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_rpc_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// How long to wait for the serviceability view. Zero means 2x refresh_interval.
    #[serde(default, with = "humantime_serde")]
    pub ready_timeout: Duration,
}

/// MaxMind database paths.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct GeoIpConfig {
    /// GeoLite2/GeoIP2 City database.
    #[serde(default)]
    pub city_db_path: PathBuf,

    /// GeoLite2/GeoIP2 ASN database.
    #[serde(default)]
    pub asn_db_path: PathBuf,
}

/// Interface counter usage view configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UsageConfig {
    /// Enable the usage view.
    #[serde(default)]
    pub enabled: bool,

    /// Time-series database URL (InfluxDB v3).
    #[serde(default)]
    pub endpoint: String,

    /// Bearer token for the time-series database.
    #[serde(default)]
    pub token: String,

    /// Database (bucket) holding the intfCounters table.
    #[serde(default)]
    pub bucket: String,

    /// Lookback window when nothing has been written yet. Default: 1h.
    #[serde(default = "default_usage_query_window", with = "humantime_serde")]
    pub query_window: Duration,

    /// Refresh interval for this view. Zero falls back to refresh_interval. Default: 5m.
    #[serde(default = "default_usage_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Timeout for the time-series request. Default: 120s.
    #[serde(default = "default_usage_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Where IS-IS dumps are read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsisSourceKind {
    #[default]
    S3,
    Dir,
}

/// IS-IS dump ingestion configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IsisConfig {
    /// Enable IS-IS enrichment of the graph.
    #[serde(default)]
    pub enabled: bool,

    /// Dump source. Default: s3.
    #[serde(default)]
    pub source: IsisSourceKind,

    /// S3 bucket. Default: "doublezero-mn-beta-isis-db".
    #[serde(default = "default_isis_bucket")]
    pub bucket: String,

    /// S3 region. Default: "us-east-1".
    #[serde(default = "default_isis_region")]
    pub region: String,

    /// Custom S3 endpoint (path-style addressing is used when set).
    #[serde(default)]
    pub endpoint_url: String,

    /// Local directory of dumps when source is "dir".
    #[serde(default)]
    pub dir: PathBuf,

    /// IS-IS-only sync interval. Default: 30s.
    #[serde(default = "default_isis_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_dz_env() -> String {
    "mainnet-beta".to_string()
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_concurrency() -> usize {
    64
}

fn default_database() -> String {
    "default".to_string()
}

fn default_neo4j_database() -> String {
    "neo4j".to_string()
}

fn default_neo4j_username() -> String {
    "neo4j".to_string()
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_usage_query_window() -> Duration {
    Duration::from_secs(3600)
}

fn default_usage_refresh_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_usage_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_isis_bucket() -> String {
    "doublezero-mn-beta-isis-db".to_string()
}

fn default_isis_region() -> String {
    "us-east-1".to_string()
}

fn default_isis_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            dz_env: default_dz_env(),
            refresh_interval: default_refresh_interval(),
            max_concurrency: default_max_concurrency(),
            skip_ready_wait: false,
            ready_includes_usage: false,
            clickhouse: ClickHouseConfig::default(),
            neo4j: Neo4jConfig::default(),
            serviceability: RpcConfig::default(),
            telemetry: TelemetryConfig::default(),
            solana: RpcConfig::default(),
            geoip: GeoIpConfig::default(),
            usage: UsageConfig::default(),
            isis: IsisConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            uri: String::new(),
            database: default_neo4j_database(),
            username: default_neo4j_username(),
            password: String::new(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_rpc_timeout(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_rpc_timeout(),
            ready_timeout: Duration::ZERO,
        }
    }
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            token: String::new(),
            bucket: String::new(),
            query_window: default_usage_query_window(),
            refresh_interval: default_usage_refresh_interval(),
            timeout: default_usage_timeout(),
        }
    }
}

impl Default for IsisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source: IsisSourceKind::default(),
            bucket: default_isis_bucket(),
            region: default_isis_region(),
            endpoint_url: String::new(),
            dir: PathBuf::new(),
            refresh_interval: default_isis_refresh_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;

        Ok(cfg)
    }

    /// Overrides secrets and the environment name from process environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = non_empty_env("DZ_ENV") {
            self.dz_env = v;
        }
        if let Some(v) = non_empty_env("CLICKHOUSE_PASSWORD") {
            self.clickhouse.password = v;
        }
        if let Some(v) = non_empty_env("NEO4J_PASSWORD") {
            self.neo4j.password = v;
        }
        if let Some(v) = non_empty_env("INFLUX_TOKEN") {
            self.usage.token = v;
        }
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if !KNOWN_ENVS.contains(&self.dz_env.as_str()) {
            bail!(
                "dz_env must be one of {}, got {:?}",
                KNOWN_ENVS.join(", "),
                self.dz_env
            );
        }

        if self.refresh_interval.is_zero() {
            bail!("refresh_interval must be positive");
        }

        if self.max_concurrency == 0 {
            bail!("max_concurrency must be positive");
        }

        if self.clickhouse.endpoint.is_empty() {
            bail!("clickhouse.endpoint is required");
        }

        if self.serviceability.endpoint.is_empty() {
            bail!("serviceability.endpoint is required");
        }

        if self.telemetry.endpoint.is_empty() {
            bail!("telemetry.endpoint is required");
        }

        if self.solana.endpoint.is_empty() {
            bail!("solana.endpoint is required");
        }

        if self.geoip.city_db_path.as_os_str().is_empty() {
            bail!("geoip.city_db_path is required");
        }

        if self.geoip.asn_db_path.as_os_str().is_empty() {
            bail!("geoip.asn_db_path is required");
        }

        if self.neo4j.enabled && self.neo4j.uri.is_empty() {
            bail!("neo4j.uri is required when neo4j is enabled");
        }

        if self.usage.enabled {
            if self.usage.endpoint.is_empty() {
                bail!("usage.endpoint is required when usage is enabled");
            }
            if self.usage.bucket.is_empty() {
                bail!("usage.bucket is required when usage is enabled");
            }
            if self.usage.query_window.is_zero() {
                bail!("usage.query_window must be positive");
            }
        }

        if self.ready_includes_usage && !self.usage.enabled {
            bail!("ready_includes_usage requires usage.enabled");
        }

        if self.isis.enabled {
            if !self.neo4j.enabled {
                bail!("isis.enabled requires neo4j.enabled");
            }
            if self.isis.refresh_interval.is_zero() {
                bail!("isis.refresh_interval must be positive");
            }
            match self.isis.source {
                IsisSourceKind::S3 if self.isis.bucket.is_empty() => {
                    bail!("isis.bucket is required for the s3 source");
                }
                IsisSourceKind::Dir if self.isis.dir.as_os_str().is_empty() => {
                    bail!("isis.dir is required for the dir source");
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Effective usage refresh interval.
    pub fn usage_refresh_interval(&self) -> Duration {
        if self.usage.refresh_interval.is_zero() {
            self.refresh_interval
        } else {
            self.usage.refresh_interval
        }
    }

    /// Effective serviceability wait for the latency view.
    pub fn telemetry_ready_timeout(&self) -> Duration {
        if self.telemetry.ready_timeout.is_zero() {
            self.refresh_interval * 2
        } else {
            self.telemetry.ready_timeout
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
