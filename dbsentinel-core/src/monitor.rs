//! Cross-database monitoring orchestrator.
//!
//! [`Monitor`] owns the descriptor registry, one [`Database`] per monitored
//! descriptor and the statement registry. Session and transaction samples
//! are aggregated across databases by a bounded fan-out and published as
//! immutable collections. Readers get the last published collection and at
//! most one background refresh runs per collection.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::adapters::{DatabaseContext, create_adapter};
use crate::config::MonitorConfig;
use crate::connection::{ConnectionFactory, PoolTarget};
use crate::database::Database;
use crate::datasource::{DataSource, to_identifier};
use crate::error::{MonitorError, Result, redact_database_url};
use crate::metrics::{Metrics, MetricsSink};
use crate::models::{EngineType, Session, Transaction};
use crate::node::Node;
use crate::registry::DataSourceRegistry;
use crate::snapshot::Snapshot;
use crate::statement::Statement;
use crate::store::{StatementRegistry, StatementStore};

const ABBREVIATION: usize = 80;

/// Last published samples of one kind.
#[derive(Debug)]
struct SampleCache<T> {
    published: RwLock<(Arc<Vec<T>>, Option<Instant>)>,
    refreshing: AtomicBool,
    interval: Duration,
}

impl<T> SampleCache<T> {
    fn new(interval: Duration) -> Self {
        Self {
            published: RwLock::new((Arc::new(Vec::new()), None)),
            refreshing: AtomicBool::new(false),
            interval,
        }
    }

    fn current(&self) -> Arc<Vec<T>> {
        Arc::clone(&self.published.read().0)
    }

    fn is_stale(&self) -> bool {
        let published = self.published.read();
        published.0.is_empty()
            || published
                .1
                .is_none_or(|at| at.elapsed() >= self.interval)
    }

    fn publish(&self, samples: Vec<T>) -> Arc<Vec<T>> {
        let samples = Arc::new(samples);
        *self.published.write() = (Arc::clone(&samples), Some(Instant::now()));
        samples
    }

    /// Claims the refresh slot. False while another refresh holds it.
    fn claim(&self) -> bool {
        self.refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn try_begin(&self) -> Option<InFlight<'_>> {
        self.claim().then(|| InFlight(&self.refreshing))
    }
}

/// Releases a refresh slot on drop.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Outcome of a fan-out over every database.
#[derive(Debug)]
struct Gathered<T> {
    items: Vec<T>,
    failed: Vec<String>,
    pending: usize,
}

/// Monitoring engine over every registered database.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use dbsentinel_core::connection::memory::MemoryConnectionFactory;
/// use dbsentinel_core::metrics::TimerRegistry;
/// use dbsentinel_core::store::MemoryStatementStore;
/// use dbsentinel_core::{DataSource, Monitor, MonitorConfig};
///
/// let rt = tokio::runtime::Runtime::new().unwrap();
/// rt.block_on(async {
///     let monitor = Monitor::new(
///         MonitorConfig::default(),
///         Arc::new(MemoryConnectionFactory::new()),
///         Arc::new(MemoryStatementStore::new()),
///         Arc::new(TimerRegistry::new()),
///     )
///     .unwrap();
///     let ds = DataSource::new("orders", "Orders", "mysql://monitor@db1:3306/orders").unwrap();
///     let database = monitor.register_data_source(ds).await.unwrap();
///     assert!(database.is_some());
///     assert_eq!(monitor.get_database("orders").unwrap().id(), "orders");
/// });
/// ```
#[derive(Debug)]
pub struct Monitor {
    config: Arc<MonitorConfig>,
    factory: Arc<dyn ConnectionFactory>,
    registry: Arc<DataSourceRegistry>,
    databases: DashMap<String, Arc<Database>>,
    statements: StatementRegistry,
    metrics: Metrics,
    workers: Arc<Semaphore>,
    sessions: SampleCache<Session>,
    transactions: SampleCache<Transaction>,
    unsupported_schemes: Mutex<HashSet<String>>,
}

impl Monitor {
    /// Creates a monitor with injected collaborators.
    ///
    /// # Errors
    /// Returns a configuration error when `config` is invalid.
    pub fn new(
        config: MonitorConfig,
        factory: Arc<dyn ConnectionFactory>,
        store: Arc<dyn StatementStore>,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            statements: StatementRegistry::new(store, config.statement_cache_capacity),
            workers: Arc::new(Semaphore::new(config.max_concurrency)),
            sessions: SampleCache::new(config.session_refresh_interval),
            transactions: SampleCache::new(config.transaction_refresh_interval),
            metrics: Metrics::new("Monitor", sink),
            config: Arc::new(config),
            factory,
            registry: Arc::new(DataSourceRegistry::new()),
            databases: DashMap::new(),
            unsupported_schemes: Mutex::new(HashSet::new()),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Registers or replaces a descriptor.
    ///
    /// Descriptors without a connection get one from the factory. When the
    /// factory cannot build one the descriptor is still registered, without
    /// a handle. A top-level descriptor whose scheme has an engine adapter
    /// and a connection becomes a monitored [`Database`], replacing and
    /// closing any previous one with the same id. Other schemes stay
    /// registered as plain connections.
    ///
    /// # Errors
    /// Factory errors are logged rather than returned, so this currently
    /// always succeeds.
    pub async fn register_data_source(&self, data_source: DataSource) -> Result<Option<Arc<Database>>> {
        let data_source = if data_source.connection().is_some() {
            data_source
        } else {
            let target = PoolTarget::for_data_source(&data_source, &self.config.pool);
            match self.factory.create(&target) {
                Ok(connection) => data_source.with_connection(connection),
                Err(e) => {
                    warn!(
                        "No connection for data source {} ({}): {}",
                        data_source.id(),
                        redact_database_url(data_source.uri().as_str()),
                        e
                    );
                    data_source
                }
            }
        };
        let id = data_source.id().to_string();
        self.registry.upsert(data_source.clone());
        info!(
            "Registered data source {} ({})",
            id,
            redact_database_url(data_source.uri().as_str())
        );

        if data_source.is_node() {
            return Ok(None);
        }

        let Some(engine) = EngineType::from_scheme(data_source.scheme()) else {
            let scheme = data_source.scheme().to_ascii_lowercase();
            if self.unsupported_schemes.lock().insert(scheme.clone()) {
                info!(
                    "{}, {} stays an unmonitored connection",
                    MonitorError::UnsupportedEngine { scheme },
                    id
                );
            }
            if let Some((_, previous)) = self.databases.remove(&id) {
                self.retire(&previous, &data_source).await;
            }
            return Ok(None);
        };

        if data_source.connection().is_none() {
            info!("{} is not monitored until a {} driver is available", id, engine);
            if let Some((_, previous)) = self.databases.remove(&id) {
                self.retire(&previous, &data_source).await;
            }
            return Ok(None);
        }

        let ctx = DatabaseContext::new(
            data_source.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.factory),
            Arc::clone(&self.registry),
            self.metrics.with_group(engine.group()),
        );
        let database = Arc::new(Database::new(ctx, create_adapter(engine)));
        if let Some(previous) = self.databases.insert(id, Arc::clone(&database)) {
            self.retire(&previous, &data_source).await;
        }
        debug!("Monitoring {} as {}", database.id(), engine);
        Ok(Some(database))
    }

    /// Reconciles a descriptor with what its live pool resolved and
    /// re-registers it when they differ.
    ///
    /// # Errors
    /// Returns a configuration error when the resolved URI does not parse.
    pub async fn update_properties(&self, data_source: &DataSource) -> Result<DataSource> {
        let Some(resolved) = data_source.connection().and_then(|c| c.resolved()) else {
            return Ok(data_source.clone());
        };

        let mut updated = data_source.with_uri(&resolved.uri)?;
        if let Some(username) = resolved.username.filter(|user| user != data_source.username()) {
            updated = updated.with_username(username);
        }

        let changed = updated.uri() != data_source.uri()
            || updated.username() != data_source.username();
        if changed && self.registry.find(data_source.id()).is_some() {
            info!("Updated properties of data source {}", data_source.id());
            self.register_data_source(updated.clone()).await?;
        }
        Ok(updated)
    }

    /// Closes every database.
    pub async fn close(&self) {
        let databases = self.databases();
        self.databases.clear();
        join_all(databases.iter().map(|database| database.close())).await;
    }

    async fn retire(&self, previous: &Database, replacement: &DataSource) {
        for node in previous.cached_nodes().iter() {
            if node.data_source().is_node() {
                self.registry.remove(node.data_source().id());
            }
        }
        previous.close_nodes().await;

        let shared = match (previous.data_source().connection(), replacement.connection()) {
            (Some(old), Some(new)) => Arc::ptr_eq(old, new),
            _ => false,
        };
        if !shared && let Some(connection) = previous.data_source().connection() {
            connection.close().await;
        }
        info!("Replaced database {}", previous.id());
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Looks a descriptor up.
    pub fn find_data_source(&self, id: &str) -> Option<DataSource> {
        self.registry.find(id)
    }

    /// Looks a descriptor up, failing when it is absent.
    ///
    /// # Errors
    /// Returns [`MonitorError::NotRegistered`] for unknown ids.
    pub fn get_data_source(&self, id: &str) -> Result<DataSource> {
        self.registry.get(id)
    }

    /// Every descriptor, including discovered node descriptors
    pub fn data_sources(&self) -> Vec<DataSource> {
        self.registry.all()
    }

    /// Looks a database up.
    pub fn find_database(&self, id: &str) -> Option<Arc<Database>> {
        self.databases.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Looks a database up, failing when it is absent.
    ///
    /// # Errors
    /// Returns [`MonitorError::NotRegistered`] for unknown ids.
    pub fn get_database(&self, id: &str) -> Result<Arc<Database>> {
        self.find_database(id)
            .ok_or_else(|| MonitorError::not_registered("Database", id))
    }

    /// Monitored databases, sorted by id
    pub fn databases(&self) -> Vec<Arc<Database>> {
        let mut databases: Vec<Arc<Database>> =
            self.databases.iter().map(|e| Arc::clone(e.value())).collect();
        databases.sort_by(|a, b| a.id().cmp(b.id()));
        databases
    }

    /// Nodes of every database.
    pub async fn nodes(&self) -> Vec<Arc<Node>> {
        let databases = self.databases();
        join_all(databases.iter().map(|database| database.nodes()))
            .await
            .iter()
            .flat_map(|nodes| nodes.iter().cloned())
            .collect()
    }

    /// Looks a node up across databases.
    pub async fn find_node(&self, id: &str) -> Option<Arc<Node>> {
        let wanted = to_identifier(id);
        self.nodes()
            .await
            .into_iter()
            .find(|node| to_identifier(node.id()) == wanted)
    }

    /// Looks a node up, failing when no database knows it.
    ///
    /// # Errors
    /// Returns [`MonitorError::NotRegistered`] for unknown ids.
    pub async fn get_node(&self, id: &str) -> Result<Arc<Node>> {
        self.find_node(id)
            .await
            .ok_or_else(|| MonitorError::not_registered("Node", id))
    }

    /// Validates every cached node and returns how many are available.
    ///
    /// Meant to be scheduled at half the availability interval so that
    /// readers rarely pay for a probe.
    pub async fn validate_databases(&self) -> usize {
        let databases = self.databases();
        join_all(databases.iter().map(|database| database.validate()))
            .await
            .into_iter()
            .sum()
    }

    // =========================================================================
    // Sessions and transactions
    // =========================================================================

    /// Last published sessions of every database.
    ///
    /// Never waits for extraction: when the collection is stale a single
    /// background refresh is started and the current one is returned.
    pub async fn sessions(self: &Arc<Self>) -> Arc<Vec<Session>> {
        if self.sessions.is_stale() && self.sessions.claim() {
            let monitor = Arc::clone(self);
            tokio::spawn(async move {
                let _in_flight = InFlight(&monitor.sessions.refreshing);
                monitor.extract_sessions().await;
            });
        }
        self.sessions.current()
    }

    /// Extracts sessions from every database and publishes them.
    ///
    /// Returns the current collection without extracting when another
    /// refresh is in flight.
    pub async fn refresh_sessions(&self) -> Arc<Vec<Session>> {
        let Some(_in_flight) = self.sessions.try_begin() else {
            debug!("Session refresh already in flight");
            return self.sessions.current();
        };
        self.extract_sessions().await
    }

    async fn extract_sessions(&self) -> Arc<Vec<Session>> {
        let gathered = self
            .fan_out("sessions", |database| async move { database.sessions().await })
            .await;
        let mut sessions = Vec::with_capacity(gathered.items.len());
        for session in gathered.items {
            sessions.push(self.intern_session(session).await);
        }
        debug!(
            "Published {} session(s), {} database(s) failed, {} pending",
            sessions.len(),
            gathered.failed.len(),
            gathered.pending
        );
        self.sessions.publish(sessions)
    }

    /// Session with the given id in the published collection
    pub fn find_session(&self, id: &str) -> Option<Session> {
        self.sessions
            .current()
            .iter()
            .find(|session| session.id() == id)
            .cloned()
    }

    /// Last published transactions of every database, refreshed like
    /// [`sessions`](Self::sessions).
    pub async fn transactions(self: &Arc<Self>) -> Arc<Vec<Transaction>> {
        if self.transactions.is_stale() && self.transactions.claim() {
            let monitor = Arc::clone(self);
            tokio::spawn(async move {
                let _in_flight = InFlight(&monitor.transactions.refreshing);
                monitor.extract_transactions().await;
            });
        }
        self.transactions.current()
    }

    /// Extracts transactions from every database and publishes them.
    pub async fn refresh_transactions(&self) -> Arc<Vec<Transaction>> {
        let Some(_in_flight) = self.transactions.try_begin() else {
            debug!("Transaction refresh already in flight");
            return self.transactions.current();
        };
        self.extract_transactions().await
    }

    async fn extract_transactions(&self) -> Arc<Vec<Transaction>> {
        let gathered = self
            .fan_out("transactions", |database| async move {
                database.transactions().await
            })
            .await;
        let mut transactions = Vec::with_capacity(gathered.items.len());
        for transaction in gathered.items {
            transactions.push(self.intern_transaction(transaction).await);
        }
        self.transactions.publish(transactions)
    }

    /// Transaction with the given id in the published collection
    pub fn find_transaction(&self, id: &str) -> Option<Transaction> {
        self.transactions
            .current()
            .iter()
            .find(|transaction| transaction.id() == id)
            .cloned()
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Looks a statement up in the cache, then in the store.
    ///
    /// # Errors
    /// Returns the store error.
    pub async fn get_statement(&self, id: &str) -> Result<Option<Arc<Statement>>> {
        self.statements.get_statement(id).await
    }

    /// Registers a statement and returns the canonical instance for its id.
    ///
    /// # Errors
    /// Returns the store error.
    pub async fn register_statement(&self, statement: Arc<Statement>) -> Result<Arc<Statement>> {
        self.statements.register_statement(statement).await
    }

    /// Statements executed between `start` and `end` on every database,
    /// registered as they are collected.
    pub async fn statements(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Arc<Statement>> {
        let gathered = self
            .fan_out("statements", move |database| async move {
                database.statements(start, end).await
            })
            .await;
        let mut statements = Vec::with_capacity(gathered.items.len());
        for statement in gathered.items {
            let statement = Arc::new(statement);
            match self.statements.register_statement(Arc::clone(&statement)).await {
                Ok(canonical) => statements.push(canonical),
                Err(e) => {
                    warn!(
                        "Failed to register statement {}: {}",
                        statement.abbreviated(ABBREVIATION),
                        e
                    );
                    statements.push(statement);
                }
            }
        }
        statements
    }

    async fn intern_session(&self, session: Session) -> Session {
        let Some(statement) = session.statement().cloned() else {
            return session;
        };
        match self.statements.register_statement(Arc::clone(&statement)).await {
            Ok(canonical) => session.with_statement(Some(canonical)),
            Err(e) => {
                warn!(
                    "Failed to register statement {} of session {}: {}",
                    statement.abbreviated(ABBREVIATION),
                    session.id(),
                    e
                );
                session
            }
        }
    }

    async fn intern_transaction(&self, transaction: Transaction) -> Transaction {
        let Some(statement) = transaction.statement().cloned() else {
            return transaction;
        };
        match self.statements.register_statement(Arc::clone(&statement)).await {
            Ok(canonical) => transaction.with_statement(Some(canonical)),
            Err(e) => {
                warn!(
                    "Failed to register statement {} of transaction {}: {}",
                    statement.abbreviated(ABBREVIATION),
                    transaction.id(),
                    e
                );
                transaction
            }
        }
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Captures one database.
    ///
    /// # Errors
    /// Returns [`MonitorError::NotRegistered`] for unknown ids. Extraction
    /// failures only mark the snapshot incomplete.
    pub async fn snapshot(&self, database_id: &str) -> Result<Snapshot> {
        let database = self.get_database(database_id)?;
        Ok(self.capture(database).await)
    }

    /// Captures every database concurrently.
    pub async fn snapshots(&self) -> Vec<Snapshot> {
        let databases = self.databases();
        let snapshots = join_all(databases.into_iter().map(|database| self.capture(database))).await;
        let incomplete: Vec<&str> = snapshots
            .iter()
            .filter(|snapshot| snapshot.is_incomplete())
            .map(Snapshot::database_id)
            .collect();
        if !incomplete.is_empty() {
            warn!("Incomplete snapshots: {}", incomplete.join(", "));
        }
        snapshots
    }

    async fn capture(&self, database: Arc<Database>) -> Snapshot {
        let wait = self.config.aggregate_wait;
        let captured = tokio::time::timeout(wait, async {
            let nodes = database.nodes().await;
            let (sessions, transactions) = tokio::join!(database.sessions(), database.transactions());
            (nodes, sessions, transactions)
        })
        .await;

        let mut incomplete = false;
        let (nodes, sessions, transactions) = match captured {
            Ok((nodes, sessions, transactions)) => {
                let sessions = sessions.unwrap_or_else(|e| {
                    warn!("Failed to capture sessions of {}: {}", database.id(), e);
                    incomplete = true;
                    Vec::new()
                });
                let transactions = transactions.unwrap_or_else(|e| {
                    warn!("Failed to capture transactions of {}: {}", database.id(), e);
                    incomplete = true;
                    Vec::new()
                });
                (nodes, sessions, transactions)
            }
            Err(_) => {
                warn!("Capture of {} timed out after {:?}", database.id(), wait);
                incomplete = true;
                (database.cached_nodes(), Vec::new(), Vec::new())
            }
        };

        let mut interned_sessions = Vec::with_capacity(sessions.len());
        for session in sessions {
            interned_sessions.push(self.intern_session(session).await);
        }
        let mut interned_transactions = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            interned_transactions.push(self.intern_transaction(transaction).await);
        }
        Snapshot::new(
            database.id(),
            database.engine(),
            nodes.iter().map(|node| node.info()).collect(),
            interned_sessions,
            interned_transactions,
        )
        .with_incomplete(incomplete)
        .with_database(database)
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    /// Runs `task` for every database on the worker pool and gathers what
    /// completes within the aggregate wait. Failed databases are logged and
    /// skipped. Tasks still running at the deadline are cancelled and
    /// counted as pending, which returns their worker permits to the pool.
    async fn fan_out<T, F, Fut>(&self, operation: &'static str, task: F) -> Gathered<T>
    where
        T: Send + 'static,
        F: Fn(Arc<Database>) -> Fut,
        Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
    {
        let wait = self.config.aggregate_wait;
        let deadline = Instant::now().checked_add(wait).unwrap_or_else(Instant::now);
        let mut set = JoinSet::new();
        for database in self.databases() {
            let workers = Arc::clone(&self.workers);
            let id = database.id().to_string();
            let work = task(database);
            set.spawn(async move {
                let outcome = tokio::time::timeout_at(deadline, async move {
                    // The pool is never closed, so a permit is always granted.
                    let _permit = workers.acquire_owned().await.ok();
                    work.await
                })
                .await
                .ok();
                (id, outcome)
            });
        }

        let mut gathered = Gathered {
            items: Vec::new(),
            failed: Vec::new(),
            pending: 0,
        };
        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, Some(Ok(items)))) => gathered.items.extend(items),
                    Ok((id, Some(Err(e)))) => {
                        warn!("Failed to extract {} of {}: {}", operation, id, e);
                        gathered.failed.push(id);
                    }
                    Ok((id, None)) => {
                        debug!("Extraction of {} from {} passed the deadline", operation, id);
                        gathered.pending = gathered.pending.saturating_add(1);
                    }
                    Err(e) => error!("Extraction of {} aborted: {}", operation, e),
                }
            }
        })
        .await;

        if drained.is_err() {
            gathered.pending = gathered.pending.saturating_add(set.len());
            // Remaining tasks stop at the same deadline and release their permits.
            set.detach_all();
        }
        if gathered.pending > 0 {
            warn!(
                "{} {} extraction(s) still pending after {:?}",
                gathered.pending, operation, wait
            );
        }
        gathered
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests;
