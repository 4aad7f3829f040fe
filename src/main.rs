use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use lake_indexer::config::Config;
use lake_indexer::export::ClickHouseClient;
use lake_indexer::indexer::Indexer;
use lake_indexer::migrate::{ClickHouseMigrator, Migrator};

/// Network topology and telemetry indexer.
#[derive(Parser)]
#[command(name = "lake-indexer", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Manage ClickHouse schema migrations and exit.
    Migrate {
        #[command(subcommand)]
        action: Option<MigrateAction>,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
enum MigrateAction {
    /// Apply all pending migrations (default).
    Up,
    /// Roll back the latest applied migration.
    Down,
    /// Print the current schema version.
    Status,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("lake-indexer {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Migrate { action }) => {
            rt.block_on(migrate(cfg, action.unwrap_or(MigrateAction::Up)))
        }
        _ => {
            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                env = %cfg.dz_env,
                "starting lake-indexer",
            );
            rt.block_on(run(cfg))
        }
    }
}

async fn migrate(cfg: Config, action: MigrateAction) -> Result<()> {
    let client = ClickHouseClient::new(cfg.clickhouse);
    client.connect().await?;
    let migrator = ClickHouseMigrator::new(client);

    match action {
        MigrateAction::Up => {
            let applied = migrator.up().await?;
            tracing::info!(applied, "migrations complete");
        }
        MigrateAction::Down => {
            migrator.down().await?;
            let (version, _) = migrator.status().await?;
            tracing::info!(version, "rollback complete");
        }
        MigrateAction::Status => {
            let (version, dirty) = migrator.status().await?;
            println!("version: {version}, dirty: {dirty}");
        }
    }
    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut indexer = Indexer::new(cfg)?;
    indexer.start().await?;

    let _ = shutdown_rx.await;

    indexer.stop().await?;

    tracing::info!("lake-indexer stopped");

    Ok(())
}
