use std::future::Future;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::export::ClickHouseClient;

/// One embedded schema change.
struct Migration {
    version: u32,
    name: &'static str,
    up_sql: &'static str,
    down_sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "init",
        up_sql: include_str!("sql/001_init.up.sql"),
        down_sql: include_str!("sql/001_init.down.sql"),
    },
    Migration {
        version: 2,
        name: "geoip_env_lock",
        up_sql: include_str!("sql/002_geoip_env_lock.up.sql"),
        down_sql: include_str!("sql/002_geoip_env_lock.down.sql"),
    },
];

/// Schema migration runner.
///
/// Tracks state in a golang-migrate compatible `schema_migrations` table.
pub trait Migrator: Send + Sync {
    /// Applies all pending migrations.
    fn up(&self) -> impl Future<Output = Result<u32>> + Send;

    /// Rolls back the latest applied migration.
    fn down(&self) -> impl Future<Output = Result<()>> + Send;

    /// Current version and dirty flag.
    fn status(&self) -> impl Future<Output = Result<(u32, bool)>> + Send;
}

pub struct ClickHouseMigrator {
    client: ClickHouseClient,
}

impl ClickHouseMigrator {
    pub fn new(client: ClickHouseClient) -> Self {
        Self { client }
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        self.client
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version Int64,
                    dirty UInt8,
                    sequence UInt64
                ) ENGINE = TinyLog",
            )
            .await
            .context("creating schema_migrations table")
    }

    async fn current_version(&self) -> Result<(u32, bool)> {
        let block = self
            .client
            .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
            .await
            .context("querying migration version")?;

        match block.rows().next() {
            Some(row) => {
                let version: i64 = row.get("version").context("reading version")?;
                let dirty: u8 = row.get("dirty").context("reading dirty flag")?;
                let version = u32::try_from(version)
                    .with_context(|| format!("invalid migration version {version}"))?;
                Ok((version, dirty != 0))
            }
            None => Ok((0, false)),
        }
    }

    async fn set_version(&self, version: u32, dirty: bool) -> Result<()> {
        // golang-migrate keeps a single row.
        self.client
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        if version == 0 {
            return Ok(());
        }

        let sql = format!(
            "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({version}, {}, 1)",
            u8::from(dirty)
        );
        self.client
            .execute(&sql)
            .await
            .context("inserting migration version")
    }

    async fn execute_sql(&self, sql: &str) -> Result<()> {
        for statement in split_statements(sql) {
            self.client.execute(statement).await?;
        }
        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<u32> {
        self.ensure_migrations_table().await?;

        let (current, dirty) = self.current_version().await?;
        if dirty {
            bail!("migration version {current} is dirty, manual intervention required");
        }

        let mut applied = 0;
        for m in pending(current) {
            info!(version = m.version, name = m.name, "applying migration");

            self.set_version(m.version, true).await?;
            self.execute_sql(m.up_sql)
                .await
                .with_context(|| format!("applying migration {} ({})", m.version, m.name))?;
            self.set_version(m.version, false).await?;

            applied += 1;
        }

        if applied == 0 {
            info!(version = current, "schema up to date");
        } else {
            info!(from = current, applied, "migrations applied");
        }
        Ok(applied)
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current, _) = self.current_version().await?;
        if current == 0 {
            info!("no migrations to roll back");
            return Ok(());
        }

        let m = MIGRATIONS
            .iter()
            .find(|m| m.version == current)
            .with_context(|| format!("migration version {current} not found"))?;

        info!(version = m.version, name = m.name, "rolling back migration");
        self.set_version(current, true).await?;
        self.execute_sql(m.down_sql)
            .await
            .with_context(|| format!("rolling back migration {current}"))?;

        self.set_version(previous_version(current), false).await
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.ensure_migrations_table().await?;
        self.current_version().await
    }
}

/// Migrations newer than `current`, in order.
fn pending(current: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.version > current)
}

fn previous_version(current: u32) -> u32 {
    MIGRATIONS
        .iter()
        .map(|m| m.version)
        .filter(|v| *v < current)
        .max()
        .unwrap_or(0)
}

/// Splits SQL text on semicolons, dropping blank segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
