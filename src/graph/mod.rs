pub mod store;
pub mod sync;

use std::future::Future;

use anyhow::{Context, Result};
use neo4rs::{ConfigBuilder, Graph, Query};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::Neo4jConfig;

pub use self::store::GraphStore;
pub use self::sync::{GraphSync, TopologySource};

/// Node labels keyed by `pk`.
pub const NODE_LABELS: &[&str] = &["Contributor", "Metro", "Device", "Link", "User"];

/// A parameter bound into a [`Statement`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    IntList(Vec<i64>),
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Vec<i64>> for ParamValue {
    fn from(v: Vec<i64>) -> Self {
        Self::IntList(v)
    }
}

/// One parameterised Cypher statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub cypher: String,
    pub params: Vec<(&'static str, ParamValue)>,
}

impl Statement {
    pub fn new(cypher: impl Into<String>) -> Self {
        Self {
            cypher: cypher.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: &'static str, value: impl Into<ParamValue>) -> Self {
        self.params.push((key, value.into()));
        self
    }

    /// Value bound to `key`, if any.
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.params.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    fn into_query(self) -> Query {
        self.params
            .into_iter()
            .fold(neo4rs::query(&self.cypher), |q, (key, value)| match value {
                ParamValue::Str(v) => q.param(key, v),
                ParamValue::Int(v) => q.param(key, v),
                ParamValue::Float(v) => q.param(key, v),
                ParamValue::Bool(v) => q.param(key, v),
                ParamValue::IntList(v) => q.param(key, v),
            })
    }
}

/// Read and transactional write access to the graph store.
pub trait GraphClient: Send + Sync + 'static {
    /// Runs a read statement and decodes each returned row.
    fn fetch<T: DeserializeOwned + Send>(
        &self,
        stmt: Statement,
    ) -> impl Future<Output = Result<Vec<T>>> + Send;

    /// Runs all statements in one transaction. Either every statement is
    /// committed or none is.
    fn write_atomic(&self, stmts: Vec<Statement>) -> impl Future<Output = Result<()>> + Send;
}

/// [`GraphClient`] backed by a Neo4j bolt connection pool.
#[derive(Clone)]
pub struct Neo4jClient {
    graph: Graph,
}

impl Neo4jClient {
    pub async fn connect(cfg: &Neo4jConfig) -> Result<Self> {
        let config = ConfigBuilder::default()
            .uri(cfg.uri.as_str())
            .user(cfg.username.as_str())
            .password(cfg.password.as_str())
            .db(cfg.database.as_str())
            .build()
            .context("building neo4j config")?;

        let graph = Graph::connect(config)
            .await
            .with_context(|| format!("connecting to neo4j at {}", cfg.uri))?;

        let client = Self { graph };
        client
            .fetch::<serde_json::Value>(Statement::new("RETURN 1 AS ok"))
            .await
            .context("pinging neo4j")?;
        Ok(client)
    }

    /// Creates a `pk` uniqueness constraint for every node label.
    pub async fn ensure_constraints(&self) -> Result<()> {
        for label in NODE_LABELS {
            let cypher = format!(
                "CREATE CONSTRAINT {}_pk IF NOT EXISTS FOR (n:{label}) REQUIRE n.pk IS UNIQUE",
                label.to_lowercase()
            );
            self.graph
                .run(neo4rs::query(&cypher))
                .await
                .with_context(|| format!("creating constraint for {label}"))?;
        }
        debug!(labels = NODE_LABELS.len(), "neo4j constraints ensured");
        Ok(())
    }
}

impl GraphClient for Neo4jClient {
    async fn fetch<T: DeserializeOwned + Send>(&self, stmt: Statement) -> Result<Vec<T>> {
        let mut stream = self
            .graph
            .execute(stmt.into_query())
            .await
            .context("running read query")?;

        let mut out = Vec::new();
        while let Some(row) = stream.next().await.context("reading row")? {
            out.push(row.to::<T>().context("decoding row")?);
        }
        Ok(out)
    }

    async fn write_atomic(&self, stmts: Vec<Statement>) -> Result<()> {
        let mut txn = self.graph.start_txn().await.context("starting transaction")?;

        let queries: Vec<Query> = stmts.into_iter().map(Statement::into_query).collect();
        if let Err(e) = txn.run_queries(queries).await {
            if let Err(rollback) = txn.rollback().await {
                warn!(error = %rollback, "rollback failed");
            }
            return Err(e).context("running write transaction");
        }

        txn.commit().await.context("committing transaction")
    }
}
