//! Sampled entities: node states, sessions and transactions.
//!
//! Sessions and transactions are point-in-time samples. They are rebuilt on
//! every extraction cycle and never mutated afterwards; the `with_*`
//! builders are only used while a sample is being assembled.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::datasource::to_identifier;
use crate::statement::Statement;

/// Database engines with a monitoring adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    /// MySQL, MariaDB and Galera clusters
    MySql,
    /// Vertica MPP clusters
    Vertica,
}

impl EngineType {
    /// Resolves a connection scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Some(Self::MySql),
            "vertica" => Some(Self::Vertica),
            _ => None,
        }
    }

    /// Schemes served by the engine
    pub const fn schemes(self) -> &'static [&'static str] {
        match self {
            Self::MySql => &["mysql", "mariadb"],
            Self::Vertica => &["vertica"],
        }
    }

    /// Every supported engine
    pub const fn all() -> [Self; 2] {
        [Self::MySql, Self::Vertica]
    }

    /// Metric group name
    pub const fn group(self) -> &'static str {
        match self {
            Self::MySql => "MySQL",
            Self::Vertica => "Vertica",
        }
    }
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.group())
    }
}

/// Health of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    /// Never validated and not reported by the engine
    #[default]
    Unknown,
    /// Serving queries
    Up,
    /// Unreachable or failing probes
    Down,
    /// Rejoining the cluster
    Recovering,
    /// Spare node, not serving queries
    Standby,
}

impl NodeState {
    /// Healthy enough to count
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Up | Self::Recovering | Self::Standby)
    }

    /// Safe to route reads to
    pub const fn is_queryable(self) -> bool {
        matches!(self, Self::Up)
    }

    /// Permissive lookup of an engine-reported state. Unrecognized values
    /// map to [`NodeState::Unknown`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "UP" => Self::Up,
            "DOWN" => Self::Down,
            "RECOVERING" => Self::Recovering,
            "STANDBY" => Self::Standby,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Recovering => "RECOVERING",
            Self::Standby => "STANDBY",
        };
        f.write_str(name)
    }
}

/// Activity of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Running a statement
    Active,
    /// Idle
    #[default]
    Inactive,
    /// Waiting on the server
    Waiting,
    /// Blocked on a lock
    Blocked,
    /// Being killed
    Killed,
}

/// A live connection on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    id: String,
    native_id: String,
    node_id: String,
    database_id: String,
    user_name: Option<String>,
    schema: Option<String>,
    client_hostname: Option<String>,
    state: SessionState,
    statement: Option<Arc<Statement>>,
    transaction_id: Option<String>,
    elapsed: Duration,
    started_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    info: Option<String>,
    system: bool,
}

impl Session {
    /// Creates a session sample. The id is derived from the node id and the
    /// engine's native session id.
    pub fn new(database_id: &str, node_id: &str, native_id: impl Into<String>) -> Self {
        let native_id = native_id.into();
        Self {
            id: scoped_id(node_id, &native_id),
            native_id,
            node_id: node_id.to_string(),
            database_id: database_id.to_string(),
            user_name: None,
            schema: None,
            client_hostname: None,
            state: SessionState::Inactive,
            statement: None,
            transaction_id: None,
            elapsed: Duration::ZERO,
            started_at: None,
            created_at: Utc::now(),
            info: None,
            system: false,
        }
    }

    /// Sets the user.
    #[must_use]
    pub fn with_user(mut self, user_name: Option<String>) -> Self {
        self.user_name = user_name;
        self
    }

    /// Sets the current schema.
    #[must_use]
    pub fn with_schema(mut self, schema: Option<String>) -> Self {
        self.schema = schema;
        self
    }

    /// Sets the client host.
    #[must_use]
    pub fn with_client_hostname(mut self, host: Option<String>) -> Self {
        self.client_hostname = host;
        self
    }

    /// Sets the state.
    #[must_use]
    pub const fn with_state(mut self, state: SessionState) -> Self {
        self.state = state;
        self
    }

    /// Attaches the running statement.
    #[must_use]
    pub fn with_statement(mut self, statement: Option<Arc<Statement>>) -> Self {
        self.statement = statement;
        self
    }

    /// Sets the open transaction.
    #[must_use]
    pub fn with_transaction_id(mut self, transaction_id: Option<String>) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    /// Sets how long the current state has lasted.
    #[must_use]
    pub const fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    /// Sets when the current statement started.
    #[must_use]
    pub const fn with_started_at(mut self, started_at: Option<DateTime<Utc>>) -> Self {
        self.started_at = started_at;
        self
    }

    /// Sets when the session logged in. `None` keeps the sampling time.
    #[must_use]
    pub fn with_created_at(mut self, created_at: Option<DateTime<Utc>>) -> Self {
        if let Some(created_at) = created_at {
            self.created_at = created_at;
        }
        self
    }

    /// Sets engine-specific free text.
    #[must_use]
    pub fn with_info(mut self, info: Option<String>) -> Self {
        self.info = info;
        self
    }

    /// Marks an engine-internal session.
    #[must_use]
    pub const fn with_system(mut self, system: bool) -> Self {
        self.system = system;
        self
    }

    /// Unique id, scoped to the node
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Session id as reported by the engine
    pub fn native_id(&self) -> &str {
        &self.native_id
    }

    /// Node the session runs on
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Database the node belongs to
    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// Connected user
    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    /// Current schema
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Client host
    pub fn client_hostname(&self) -> Option<&str> {
        self.client_hostname.as_deref()
    }

    /// Activity state
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Running statement
    pub const fn statement(&self) -> Option<&Arc<Statement>> {
        self.statement.as_ref()
    }

    /// Open transaction
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// Time spent in the current state
    pub const fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Login time
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When the sample was taken
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Engine-specific free text
    pub fn info(&self) -> Option<&str> {
        self.info.as_deref()
    }

    /// True for engine-internal sessions
    pub const fn is_system(&self) -> bool {
        self.system
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Progress of a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    /// Executing
    #[default]
    Running,
    /// Waiting for a lock
    LockWait,
    /// Committing
    Committing,
    /// Rolling back
    RollingBack,
}

impl TransactionState {
    /// Permissive lookup, unknown names map to `Running`.
    pub fn from_name(name: &str) -> Self {
        match name
            .trim()
            .to_ascii_uppercase()
            .replace([' ', '-'], "_")
            .as_str()
        {
            "LOCK_WAIT" => Self::LockWait,
            "COMMITTING" => Self::Committing,
            "ROLLING_BACK" => Self::RollingBack,
            _ => Self::Running,
        }
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// READ UNCOMMITTED
    ReadUncommitted,
    /// READ COMMITTED
    #[default]
    ReadCommitted,
    /// REPEATABLE READ
    RepeatableRead,
    /// SERIALIZABLE
    Serializable,
}

impl IsolationLevel {
    /// Permissive lookup, unknown names map to `ReadCommitted`.
    pub fn from_name(name: &str) -> Self {
        match name
            .trim()
            .to_ascii_uppercase()
            .replace([' ', '-'], "_")
            .as_str()
        {
            "READ_UNCOMMITTED" => Self::ReadUncommitted,
            "REPEATABLE_READ" => Self::RepeatableRead,
            "SERIALIZABLE" => Self::Serializable,
            _ => Self::ReadCommitted,
        }
    }
}

/// Row and table counters of a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCounters {
    /// Tables in use
    pub tables_in_use: u64,
    /// Tables locked
    pub tables_locked: u64,
    /// Rows locked
    pub rows_locked: u64,
    /// Rows modified
    pub rows_modified: u64,
}

/// A live unit of work on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    id: String,
    native_id: String,
    node_id: String,
    database_id: String,
    user_name: Option<String>,
    state: TransactionState,
    started_at: Option<DateTime<Utc>>,
    lock_started_at: Option<DateTime<Utc>>,
    weight: Option<i64>,
    statement: Option<Arc<Statement>>,
    isolation_level: IsolationLevel,
    counters: TransactionCounters,
    read_only: bool,
    description: Option<String>,
}

impl Transaction {
    /// Creates a transaction sample. The id is derived from the node id and
    /// the engine's native transaction id.
    pub fn new(database_id: &str, node_id: &str, native_id: impl Into<String>) -> Self {
        let native_id = native_id.into();
        Self {
            id: scoped_id(node_id, &native_id),
            native_id,
            node_id: node_id.to_string(),
            database_id: database_id.to_string(),
            user_name: None,
            state: TransactionState::Running,
            started_at: None,
            lock_started_at: None,
            weight: None,
            statement: None,
            isolation_level: IsolationLevel::ReadCommitted,
            counters: TransactionCounters::default(),
            read_only: false,
            description: None,
        }
    }

    /// Sets the user.
    #[must_use]
    pub fn with_user(mut self, user_name: Option<String>) -> Self {
        self.user_name = user_name;
        self
    }

    /// Sets the state.
    #[must_use]
    pub const fn with_state(mut self, state: TransactionState) -> Self {
        self.state = state;
        self
    }

    /// Sets start and lock wait timestamps.
    #[must_use]
    pub const fn with_times(
        mut self,
        started_at: Option<DateTime<Utc>>,
        lock_started_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.started_at = started_at;
        self.lock_started_at = lock_started_at;
        self
    }

    /// Sets the deadlock victim weight.
    #[must_use]
    pub const fn with_weight(mut self, weight: Option<i64>) -> Self {
        self.weight = weight;
        self
    }

    /// Attaches the running statement.
    #[must_use]
    pub fn with_statement(mut self, statement: Option<Arc<Statement>>) -> Self {
        self.statement = statement;
        self
    }

    /// Sets the isolation level.
    #[must_use]
    pub const fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Sets table and row counters.
    #[must_use]
    pub const fn with_counters(mut self, counters: TransactionCounters) -> Self {
        self.counters = counters;
        self
    }

    /// Marks a read-only transaction.
    #[must_use]
    pub const fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Sets the engine description.
    #[must_use]
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Unique id, scoped to the node
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Transaction id as reported by the engine
    pub fn native_id(&self) -> &str {
        &self.native_id
    }

    /// Node the transaction runs on
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Database the node belongs to
    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// Owning user
    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    /// Progress state
    pub const fn state(&self) -> TransactionState {
        self.state
    }

    /// Start time
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Start of the current lock wait
    pub const fn lock_started_at(&self) -> Option<DateTime<Utc>> {
        self.lock_started_at
    }

    /// Deadlock victim priority, lower is rolled back first
    pub const fn weight(&self) -> Option<i64> {
        self.weight
    }

    /// Running statement
    pub const fn statement(&self) -> Option<&Arc<Statement>> {
        self.statement.as_ref()
    }

    /// Isolation level
    pub const fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// Table and row counters
    pub const fn counters(&self) -> &TransactionCounters {
        &self.counters
    }

    /// True for read-only transactions
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Engine description
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Picks the transaction a deadlock resolution would roll back.
    ///
    /// The lowest weight loses; among equal weights the most recently started
    /// transaction loses. Transactions without a weight are never chosen.
    pub fn select_deadlock_victim(transactions: &[Self]) -> Option<&Self> {
        transactions
            .iter()
            .filter(|t| t.weight.is_some())
            .min_by(|a, b| {
                a.weight
                    .cmp(&b.weight)
                    .then_with(|| b.started_at.cmp(&a.started_at))
            })
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

fn scoped_id(node_id: &str, native_id: &str) -> String {
    to_identifier(&format!("{node_id}_{native_id}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_node_state_flags() {
        assert!(NodeState::Up.is_available() && NodeState::Up.is_queryable());
        assert!(NodeState::Recovering.is_available() && !NodeState::Recovering.is_queryable());
        assert!(NodeState::Standby.is_available() && !NodeState::Standby.is_queryable());
        assert!(!NodeState::Down.is_available() && !NodeState::Down.is_queryable());
        assert!(!NodeState::Unknown.is_available());
    }

    #[test]
    fn test_node_state_permissive_lookup() {
        assert_eq!(NodeState::from_name("up"), NodeState::Up);
        assert_eq!(NodeState::from_name(" STANDBY "), NodeState::Standby);
        assert_eq!(NodeState::from_name("SHUTDOWN"), NodeState::Unknown);
        assert_eq!(NodeState::from_name(""), NodeState::Unknown);
    }

    #[test]
    fn test_engine_from_scheme() {
        assert_eq!(EngineType::from_scheme("MariaDB"), Some(EngineType::MySql));
        assert_eq!(EngineType::from_scheme("vertica"), Some(EngineType::Vertica));
        assert_eq!(EngineType::from_scheme("postgresql"), None);
    }

    #[test]
    fn test_session_ids_are_scoped_to_node() {
        let a = Session::new("galera", "node-1", "42");
        let b = Session::new("galera", "node-2", "42");
        assert_eq!(a.id(), "node_1_42");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.native_id(), "42");
        assert_eq!(a.state(), SessionState::Inactive);
    }

    #[test]
    fn test_lookups_default() {
        assert_eq!(TransactionState::from_name("lock wait"), TransactionState::LockWait);
        assert_eq!(TransactionState::from_name("whatever"), TransactionState::Running);
        assert_eq!(IsolationLevel::from_name("REPEATABLE READ"), IsolationLevel::RepeatableRead);
        assert_eq!(IsolationLevel::from_name("SNAPSHOT"), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_deadlock_victim_lowest_weight() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 1, 10, 5, 0).unwrap();
        let transactions = vec![
            Transaction::new("db", "n1", "1").with_weight(Some(10)),
            Transaction::new("db", "n1", "2")
                .with_weight(Some(3))
                .with_times(Some(early), None),
            Transaction::new("db", "n1", "3")
                .with_weight(Some(3))
                .with_times(Some(late), None),
            Transaction::new("db", "n1", "4"),
        ];

        let victim = Transaction::select_deadlock_victim(&transactions).unwrap();
        assert_eq!(victim.native_id(), "3");
        assert!(Transaction::select_deadlock_victim(&transactions[3..]).is_none());
    }
}
