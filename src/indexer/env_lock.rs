use std::future::Future;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::error::Error;
use crate::export::{sql_str, ClickHouseClient};
use crate::graph::{GraphClient, Statement};

pub const ENV_LOCK_TABLE: &str = "_env_lock";

/// A store that records which environment it belongs to.
pub trait EnvLockStore: Send + Sync {
    /// Name used in mismatch errors.
    fn store_name(&self) -> &'static str;

    fn read_env_lock(&self) -> impl Future<Output = Result<Option<String>>> + Send;

    fn write_env_lock(&self, env: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Binds `store` to `env` on first use and refuses any other environment
/// afterwards.
pub async fn ensure_env_lock<S: EnvLockStore>(store: &S, env: &str) -> Result<()> {
    match store
        .read_env_lock()
        .await
        .with_context(|| format!("reading {} env lock", store.store_name()))?
    {
        Some(locked) if locked == env => Ok(()),
        Some(locked) => Err(Error::EnvLockMismatch {
            store: store.store_name(),
            locked,
            configured: env.to_string(),
        }
        .into()),
        None => {
            store
                .write_env_lock(env)
                .await
                .with_context(|| format!("writing {} env lock", store.store_name()))?;
            info!(store = store.store_name(), env, "env lock created");
            Ok(())
        }
    }
}

impl EnvLockStore for ClickHouseClient {
    fn store_name(&self) -> &'static str {
        "clickhouse"
    }

    async fn read_env_lock(&self) -> Result<Option<String>> {
        let block = self
            .query(&format!("SELECT dz_env FROM {ENV_LOCK_TABLE} LIMIT 1"))
            .await?;
        match block.rows().next() {
            Some(row) => Ok(Some(row.get("dz_env")?)),
            None => Ok(None),
        }
    }

    async fn write_env_lock(&self, env: &str) -> Result<()> {
        self.execute(&format!(
            "INSERT INTO {ENV_LOCK_TABLE} (dz_env) VALUES ({})",
            sql_str(env)
        ))
        .await
    }
}

/// Graph-store view of the lock node.
pub struct GraphEnvLock<'a, G> {
    client: &'a G,
}

impl<'a, G: GraphClient> GraphEnvLock<'a, G> {
    pub fn new(client: &'a G) -> Self {
        Self { client }
    }
}

#[derive(Deserialize)]
struct LockRow {
    dz_env: Option<String>,
}

impl<G: GraphClient> EnvLockStore for GraphEnvLock<'_, G> {
    fn store_name(&self) -> &'static str {
        "neo4j"
    }

    async fn read_env_lock(&self) -> Result<Option<String>> {
        let rows: Vec<LockRow> = self
            .client
            .fetch(Statement::new("MATCH (l:_EnvLock) RETURN l.dz_env AS dz_env LIMIT 1"))
            .await?;
        Ok(rows.into_iter().next().and_then(|r| r.dz_env))
    }

    async fn write_env_lock(&self, env: &str) -> Result<()> {
        self.client
            .write_atomic(vec![
                Statement::new("CREATE (l:_EnvLock {dz_env: $env})").param("env", env)
            ])
            .await
    }
}
