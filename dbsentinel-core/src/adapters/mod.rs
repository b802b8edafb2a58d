//! Engine adapters and the context they extract with.
//!
//! An adapter knows the system views of one engine family. It turns rows
//! into [`Node`]s, [`Session`]s, [`Transaction`]s and [`Statement`]s and
//! nothing else: caching, liveness gating and error absorption happen one
//! level up in [`Database`](crate::database::Database).
//!
//! # Module Structure
//! - `mysql`: MySQL, MariaDB and Galera clusters
//! - `vertica`: Vertica MPP clusters

pub mod mysql;
pub mod vertica;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::MonitorConfig;
use crate::connection::{ConnectionFactory, ConnectionSource, PoolTarget};
use crate::datasource::{DataSource, to_identifier};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::models::{EngineType, Session, Transaction};
use crate::node::{DEFAULT_PROBE_SQL, Node};
use crate::registry::DataSourceRegistry;
use crate::statement::Statement;

/// Extraction capabilities of one engine family.
///
/// # Object Safety
/// This trait is object-safe; databases hold adapters as
/// `Arc<dyn EngineAdapter>`.
#[async_trait]
pub trait EngineAdapter: Send + Sync + std::fmt::Debug {
    /// Engine handled by this adapter.
    fn engine(&self) -> EngineType;

    /// Cheap read-only statement used to validate nodes.
    fn probe_sql(&self) -> &'static str {
        DEFAULT_PROBE_SQL
    }

    /// Discovers the nodes of the database.
    ///
    /// # Errors
    /// Connectivity errors mean the database could not be reached; any
    /// other error is an unexpected extraction failure.
    async fn extract_nodes(&self, ctx: &DatabaseContext) -> Result<Vec<Node>>;

    /// Samples sessions of the given, available, nodes.
    async fn extract_sessions(
        &self,
        ctx: &DatabaseContext,
        nodes: &[Arc<Node>],
    ) -> Result<Vec<Session>>;

    /// Samples transactions of the given, available, nodes.
    ///
    /// # Default Implementation
    /// Returns an empty vector (no transaction support).
    async fn extract_transactions(
        &self,
        _ctx: &DatabaseContext,
        _nodes: &[Arc<Node>],
    ) -> Result<Vec<Transaction>> {
        Ok(Vec::new())
    }

    /// Statements executed between `start` and `end`.
    ///
    /// # Default Implementation
    /// Returns an empty vector (no statement history).
    async fn extract_statements(
        &self,
        _ctx: &DatabaseContext,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<Statement>> {
        Ok(Vec::new())
    }
}

/// Creates the adapter of an engine.
pub fn create_adapter(engine: EngineType) -> Arc<dyn EngineAdapter> {
    match engine {
        EngineType::MySql => Arc::new(mysql::MySqlAdapter::new()),
        EngineType::Vertica => Arc::new(vertica::VerticaAdapter::new()),
    }
}

/// What an adapter needs to know about the database it extracts from.
#[derive(Debug, Clone)]
pub struct DatabaseContext {
    data_source: DataSource,
    config: Arc<MonitorConfig>,
    factory: Arc<dyn ConnectionFactory>,
    registry: Arc<DataSourceRegistry>,
    metrics: Metrics,
    probe_sql: &'static str,
}

impl DatabaseContext {
    /// Creates a context for a registered, non-node descriptor.
    pub fn new(
        data_source: DataSource,
        config: Arc<MonitorConfig>,
        factory: Arc<dyn ConnectionFactory>,
        registry: Arc<DataSourceRegistry>,
        metrics: Metrics,
    ) -> Self {
        Self {
            data_source,
            config,
            factory,
            registry,
            metrics,
            probe_sql: DEFAULT_PROBE_SQL,
        }
    }

    /// Sets the statement used to validate nodes.
    #[must_use]
    pub const fn with_probe_sql(mut self, probe_sql: &'static str) -> Self {
        self.probe_sql = probe_sql;
        self
    }

    /// Database id
    pub fn id(&self) -> &str {
        self.data_source.id()
    }

    /// Database name
    pub fn name(&self) -> &str {
        self.data_source.name()
    }

    /// Descriptor of the database itself
    pub const fn data_source(&self) -> &DataSource {
        &self.data_source
    }

    /// Monitor settings
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Timer facility of the engine group
    pub const fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Connection of the database descriptor.
    ///
    /// # Errors
    /// Returns a configuration error when no connection is attached.
    pub fn connection(&self) -> Result<&Arc<dyn ConnectionSource>> {
        self.data_source.require_connection()
    }

    /// The single node standing for a non-clustered database.
    ///
    /// It shares the database id and descriptor.
    pub fn self_node(&self) -> Node {
        self.build_node(self.id(), self.name(), self.data_source.clone())
    }

    /// Creates a node reached at `host:port`.
    ///
    /// # Errors
    /// Returns a configuration error when no descriptor can be derived for
    /// the host.
    pub fn node(&self, id: &str, name: &str, host: &str, port: Option<u16>) -> Result<Node> {
        let data_source = self.node_data_source(host, port)?;
        Ok(self.build_node(id, name, data_source))
    }

    /// Returns the descriptor of a cluster member, creating its pool once.
    ///
    /// Ids are derived from the database id and the host, so rediscovering
    /// the same host reuses the registered descriptor and its pool. Pools are
    /// created lazily and never contact the host here.
    ///
    /// # Errors
    /// Returns a configuration error when the host cannot be put in the
    /// database URI or the factory rejects the target.
    pub fn node_data_source(&self, host: &str, port: Option<u16>) -> Result<DataSource> {
        let id = to_identifier(&format!("{}_{}", self.id(), host));
        self.registry.get_or_try_insert_with(&id, || {
            let data_source = self
                .data_source
                .with_id(id.clone())
                .with_name(host)
                .with_host_port(host, port)?
                .with_node(true);
            let target = PoolTarget::for_data_source(&data_source, &self.config.pool);
            let connection = self.factory.create(&target)?;
            tracing::debug!("Created pool for node {} of {}", host, self.id());
            Ok(data_source.with_connection(connection))
        })
    }

    fn build_node(&self, id: &str, name: &str, data_source: DataSource) -> Node {
        Node::new(self.id(), id, name, data_source, &self.config)
            .with_probe_sql(self.probe_sql)
            .with_metrics(self.metrics.clone())
    }
}

/// Builds the statement attached to a sample, if there is SQL text.
pub(crate) fn sampled_statement(
    sql: Option<&str>,
    user_name: Option<&str>,
    node_id: &str,
) -> Option<Arc<Statement>> {
    let sql = sql?;
    Statement::new(sql, user_name.unwrap_or_default())
        .map(|statement| Arc::new(statement.with_node(node_id)))
}
