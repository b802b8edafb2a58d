//! A monitored database and its node discovery cache.
//!
//! The node set is published as an immutable `Arc<Vec<Arc<Node>>>` and
//! swapped wholesale after each discovery; readers clone the pointer and
//! never wait on a refresh. Refreshes are serialized by an async mutex and
//! re-check freshness after acquiring it, so concurrent callers trigger a
//! single extraction.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::adapters::{DatabaseContext, EngineAdapter};
use crate::datasource::{DataSource, to_identifier};
use crate::error::Result;
use crate::models::{EngineType, Session, Transaction};
use crate::node::Node;
use crate::statement::Statement;

/// Published collection of nodes.
pub type NodeSet = Vec<Arc<Node>>;

/// One registered database: an adapter plus its cached nodes.
pub struct Database {
    ctx: DatabaseContext,
    adapter: Arc<dyn EngineAdapter>,
    nodes: RwLock<Arc<NodeSet>>,
    refresh: tokio::sync::Mutex<()>,
    last_refresh: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id())
            .field("engine", &self.engine())
            .field("nodes", &self.nodes.read().len())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Creates a database with no known nodes.
    pub fn new(ctx: DatabaseContext, adapter: Arc<dyn EngineAdapter>) -> Self {
        let ctx = ctx.with_probe_sql(adapter.probe_sql());
        Self {
            ctx,
            adapter,
            nodes: RwLock::new(Arc::new(Vec::new())),
            refresh: tokio::sync::Mutex::new(()),
            last_refresh: Mutex::new(None),
        }
    }

    /// Database id, equal to the id of its descriptor
    pub fn id(&self) -> &str {
        self.ctx.id()
    }

    /// Display name
    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    /// Engine family
    pub fn engine(&self) -> EngineType {
        self.adapter.engine()
    }

    /// Descriptor of the database
    pub const fn data_source(&self) -> &DataSource {
        self.ctx.data_source()
    }

    /// Extraction context
    pub const fn context(&self) -> &DatabaseContext {
        &self.ctx
    }

    /// Nodes published by the last successful discovery, without refreshing
    pub fn cached_nodes(&self) -> Arc<NodeSet> {
        self.nodes.read().clone()
    }

    /// Current nodes, rediscovered when the cache is due.
    ///
    /// Discovery failures keep the previous set: connectivity failures are
    /// logged at debug level, anything else as an error.
    pub async fn nodes(&self) -> Arc<NodeSet> {
        if self.refresh_due() {
            let _guard = self.refresh.lock().await;
            if self.refresh_due() {
                self.refresh_nodes().await;
            }
        }
        self.cached_nodes()
    }

    /// Node with the given id.
    pub async fn node(&self, id: &str) -> Option<Arc<Node>> {
        let wanted = to_identifier(id);
        self.nodes()
            .await
            .iter()
            .find(|node| to_identifier(node.id()) == wanted)
            .cloned()
    }

    /// Nodes passing their availability check
    pub async fn available_nodes(&self) -> NodeSet {
        let nodes = self.nodes().await;
        let checks = join_all(nodes.iter().map(|node| node.is_available())).await;
        nodes
            .iter()
            .zip(checks)
            .filter(|(_, available)| *available)
            .map(|(node, _)| Arc::clone(node))
            .collect()
    }

    /// Samples sessions of the available nodes.
    ///
    /// # Errors
    /// Returns the adapter error; callers aggregating several databases
    /// are expected to log and skip it.
    pub async fn sessions(&self) -> Result<Vec<Session>> {
        let nodes = self.available_nodes().await;
        if nodes.is_empty() {
            debug!("No available nodes in {}, skipping sessions", self.id());
            return Ok(Vec::new());
        }
        self.ctx
            .metrics()
            .time(
                "Extract Sessions",
                self.adapter.extract_sessions(&self.ctx, &nodes),
            )
            .await
    }

    /// Samples transactions of the available nodes.
    ///
    /// # Errors
    /// Returns the adapter error.
    pub async fn transactions(&self) -> Result<Vec<Transaction>> {
        let nodes = self.available_nodes().await;
        if nodes.is_empty() {
            debug!("No available nodes in {}, skipping transactions", self.id());
            return Ok(Vec::new());
        }
        self.ctx
            .metrics()
            .time(
                "Extract Transactions",
                self.adapter.extract_transactions(&self.ctx, &nodes),
            )
            .await
    }

    /// Statements executed between `start` and `end`.
    ///
    /// # Errors
    /// Returns the adapter error.
    pub async fn statements(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Statement>> {
        self.ctx
            .metrics()
            .time(
                "Extract Statements",
                self.adapter.extract_statements(&self.ctx, start, end),
            )
            .await
    }

    /// Validates every cached node and returns how many are available.
    pub async fn validate(&self) -> usize {
        let nodes = self.cached_nodes();
        join_all(nodes.iter().map(|node| node.validate()))
            .await
            .into_iter()
            .filter(|available| *available)
            .count()
    }

    /// Releases the pools of the database and its cluster members.
    pub async fn close(&self) {
        self.close_nodes().await;
        if let Some(connection) = self.data_source().connection() {
            connection.close().await;
        }
        info!("Closed database {}", self.id());
    }

    /// Releases the pools created for cluster members only.
    pub async fn close_nodes(&self) {
        let nodes = self.cached_nodes();
        for node in nodes.iter().filter(|node| node.data_source().is_node()) {
            if let Some(connection) = node.data_source().connection() {
                connection.close().await;
            }
        }
    }

    fn refresh_due(&self) -> bool {
        let config = self.ctx.config();
        let interval = if self.nodes.read().is_empty() {
            config.node_retry_interval
        } else {
            config.node_refresh_interval
        };
        self.last_refresh
            .lock()
            .is_none_or(|at| at.elapsed() >= interval)
    }

    async fn refresh_nodes(&self) {
        *self.last_refresh.lock() = Some(Instant::now());
        let extracted = self
            .ctx
            .metrics()
            .time("Extract Nodes", self.adapter.extract_nodes(&self.ctx))
            .await;

        match extracted {
            Ok(discovered) => {
                let previous = self.cached_nodes();
                let mut seen = HashSet::new();
                let nodes: NodeSet = discovered
                    .into_iter()
                    .filter(|node| seen.insert(to_identifier(node.id())))
                    .map(|node| {
                        if let Some(prior) = previous
                            .iter()
                            .find(|prior| prior.id() == node.id() && prior.is_validated())
                        {
                            node.inherit_validation(prior);
                        }
                        Arc::new(node)
                    })
                    .collect();
                debug!("Discovered {} node(s) in {}", nodes.len(), self.id());
                *self.nodes.write() = Arc::new(nodes);
            }
            Err(e) if e.is_connectivity() => {
                debug!(
                    "Failed to extract nodes of {}, database is not available: {}",
                    self.id(),
                    e
                );
            }
            Err(e) => error!("Failed to extract nodes of {}: {}", self.id(), e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::adapters::create_adapter;
    use crate::config::MonitorConfig;
    use crate::connection::Row;
    use crate::connection::memory::{MemoryConnection, MemoryConnectionFactory, Scripted};
    use crate::metrics::{Metrics, TimerRegistry};
    use crate::models::NodeState;
    use crate::registry::DataSourceRegistry;

    fn database(
        primary: Arc<MemoryConnection>,
        factory: MemoryConnectionFactory,
        config: MonitorConfig,
        metrics: Metrics,
    ) -> Database {
        let ds = DataSource::new("galera", "Galera", "mysql://monitor:pw@db1:3306/app")
            .unwrap()
            .with_connection(primary);
        let ctx = DatabaseContext::new(
            ds,
            Arc::new(config),
            Arc::new(factory),
            Arc::new(DataSourceRegistry::new()),
            metrics,
        );
        Database::new(ctx, create_adapter(EngineType::MySql))
    }

    fn vertica(primary: Arc<MemoryConnection>, config: MonitorConfig) -> Database {
        let ds = DataSource::new("analytics", "Analytics", "vertica://dbadmin@vnode1:5433/analytics")
            .unwrap()
            .with_connection(primary);
        let ctx = DatabaseContext::new(
            ds,
            Arc::new(config),
            Arc::new(MemoryConnectionFactory::new()),
            Arc::new(DataSourceRegistry::new()),
            Metrics::detached("Vertica"),
        );
        Database::new(ctx, create_adapter(EngineType::Vertica))
    }

    fn members(addresses: &[&str]) -> Scripted {
        Scripted::Rows(
            addresses
                .iter()
                .enumerate()
                .map(|(i, address)| {
                    Row::new()
                        .with("node_uuid", format!("u{i}"))
                        .with("node_name", format!("n{i}"))
                        .with("node_incoming_address", *address)
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_discovery() {
        let primary = Arc::new(
            MemoryConnection::new("db1").on("wsrep_cluster_members", members(&["db1", "db2"])),
        );
        let db = database(
            primary.clone(),
            MemoryConnectionFactory::new(),
            MonitorConfig::default(),
            Metrics::detached("MySQL"),
        );

        let (a, b, c) = tokio::join!(db.nodes(), db.nodes(), db.nodes());

        assert_eq!(a.len(), 2);
        assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
        assert_eq!(primary.calls_matching("wsrep_cluster_members"), 1);
    }

    #[tokio::test]
    async fn test_stale_nodes_survive_connectivity_loss() {
        let primary = Arc::new(
            MemoryConnection::new("db1").on("wsrep_cluster_members", members(&["db1", "db2"])),
        );
        let config = MonitorConfig::default().with_node_refresh_interval(Duration::from_millis(5));
        let db = database(primary.clone(), MemoryConnectionFactory::new(), config, Metrics::detached("MySQL"));
        let first = db.nodes().await;

        primary.script("wsrep_cluster_members", Scripted::Unreachable("refused".into()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = db.nodes().await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(primary.calls_matching("wsrep_cluster_members"), 2);
    }

    #[tokio::test]
    async fn test_stale_nodes_survive_catalog_errors() {
        let primary = Arc::new(MemoryConnection::new("vnode1").on(
            "v_catalog.nodes",
            Scripted::Rows(vec![
                Row::new()
                    .with("node_id", "45035996273704980")
                    .with("node_name", "v_analytics_node0001")
                    .with("node_state", "UP")
                    .with("export_address", "vnode1"),
            ]),
        ));
        let config = MonitorConfig::default().with_node_refresh_interval(Duration::from_millis(5));
        let db = vertica(primary.clone(), config);
        let first = db.nodes().await;
        assert_eq!(first.len(), 1);

        primary.script(
            "v_catalog.nodes",
            Scripted::QueryError {
                code: 4566,
                sql_state: Some("42V01".to_string()),
                message: "Relation \"v_catalog.nodes\" does not exist".to_string(),
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = db.nodes().await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(primary.calls_matching("v_catalog.nodes"), 2);
    }

    #[tokio::test]
    async fn test_rediscovery_carries_validation_forward() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let primary = Arc::new(
            MemoryConnection::new("db1").on("wsrep_cluster_members", members(&[address.as_str()])),
        );
        let config = MonitorConfig::default().with_node_refresh_interval(Duration::from_millis(5));
        let db = database(primary, MemoryConnectionFactory::new(), config, Metrics::detached("MySQL"));

        let first = db.nodes().await;
        assert_eq!(db.validate().await, 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = db.nodes().await;

        assert!(!Arc::ptr_eq(&first[0], &second[0]));
        assert_eq!(second[0].state(), NodeState::Up);
        assert!(second[0].is_validated());
    }

    #[tokio::test]
    async fn test_sessions_only_from_available_nodes() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_address = format!("127.0.0.1:{}", live.local_addr().unwrap().port());
        let dead_address = format!("localhost:{}", dead.local_addr().unwrap().port());
        drop(dead);

        let processlist = |id: i64| {
            Scripted::Rows(vec![
                Row::new()
                    .with("id", id)
                    .with("user", "app")
                    .with("command", "Sleep"),
            ])
        };
        let factory = MemoryConnectionFactory::new()
            .with_host("127.0.0.1", MemoryConnection::new("live").on("processlist", processlist(1)))
            .with_host("localhost", MemoryConnection::new("dead").on("processlist", processlist(2)));
        let primary = Arc::new(
            MemoryConnection::new("db1").on(
                "wsrep_cluster_members",
                members(&[live_address.as_str(), dead_address.as_str()]),
            ),
        );
        let registry = Arc::new(TimerRegistry::new());
        let db = database(
            primary,
            factory,
            MonitorConfig::default(),
            Metrics::new("MySQL", registry.clone()),
        );

        let sessions = db.sessions().await.unwrap();

        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].node_id(), "u0");
        assert_eq!(db.node("U1").await.unwrap().state(), NodeState::Down);
        assert_eq!(registry.get("MySQL", "Extract Nodes").unwrap().count, 1);
        assert_eq!(registry.get("MySQL", "Extract Sessions").unwrap().count, 1);
        assert_eq!(registry.get("MySQL", "Validate").unwrap().failures, 1);
    }
}
