//! In-memory connection sources with scripted answers.
//!
//! Used to drive engine adapters and the orchestrator without a server, in
//! tests and in demos. Responses are matched by a case-insensitive substring
//! of the SQL text; the first matching rule wins. Queries without a rule
//! return no rows, which makes the SQL probe succeed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ConnectionFactory, ConnectionSource, PoolTarget, ResolvedConnection, Row, Value};
use crate::error::{MonitorError, Result};

/// Scripted outcome of a query.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Return these rows
    Rows(Vec<Row>),
    /// Fail as an unreachable endpoint
    Unreachable(String),
    /// Fail as a database error with a vendor code
    QueryError {
        /// Vendor error number
        code: i64,
        /// SQLSTATE, if any
        sql_state: Option<String>,
        /// Server message
        message: String,
    },
    /// Never answer
    Hang,
}

#[derive(Debug)]
struct Rule {
    needle: String,
    outcome: Scripted,
}

/// A connection source that answers from a script.
///
/// # Example
/// ```rust
/// use dbsentinel_core::connection::memory::{MemoryConnection, Scripted};
/// use dbsentinel_core::connection::{ConnectionSource, Row};
///
/// let rt = tokio::runtime::Runtime::new().unwrap();
/// rt.block_on(async {
///     let conn = MemoryConnection::new("db1")
///         .on("processlist", Scripted::Rows(vec![Row::new().with("id", 7_i64)]));
///     let rows = conn.fetch_all("select * from information_schema.processlist", &[]).await.unwrap();
///     assert_eq!(rows.len(), 1);
///     assert_eq!(conn.calls_matching("processlist"), 1);
/// });
/// ```
#[derive(Debug, Default)]
pub struct MemoryConnection {
    label: String,
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    resolved: Option<ResolvedConnection>,
}

impl MemoryConnection {
    /// Creates a source with no rules.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Adds a rule.
    #[must_use]
    pub fn on(self, needle: &str, outcome: Scripted) -> Self {
        self.script(needle, outcome);
        self
    }

    /// Reports resolved settings to `update_properties`.
    #[must_use]
    pub fn with_resolved(mut self, resolved: ResolvedConnection) -> Self {
        self.resolved = Some(resolved);
        self
    }

    /// Adds or replaces a rule on a shared source.
    pub fn script(&self, needle: &str, outcome: Scripted) {
        let needle = needle.to_ascii_lowercase();
        let mut rules = self.rules.lock();
        if let Some(rule) = rules.iter_mut().find(|rule| rule.needle == needle) {
            rule.outcome = outcome;
        } else {
            rules.push(Rule { needle, outcome });
        }
    }

    /// Number of executed queries containing `needle`
    pub fn calls_matching(&self, needle: &str) -> usize {
        let needle = needle.to_ascii_lowercase();
        self.calls
            .lock()
            .iter()
            .filter(|sql| sql.contains(&needle))
            .count()
    }

    /// Label given at construction
    pub fn label(&self) -> &str {
        &self.label
    }
}

#[async_trait]
impl ConnectionSource for MemoryConnection {
    async fn fetch_all(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        let sql = sql.to_ascii_lowercase();
        let outcome = self
            .rules
            .lock()
            .iter()
            .find(|rule| sql.contains(&rule.needle))
            .map(|rule| rule.outcome.clone());
        self.calls.lock().push(sql);

        match outcome {
            None => Ok(Vec::new()),
            Some(Scripted::Rows(rows)) => Ok(rows),
            Some(Scripted::Unreachable(reason)) => Err(MonitorError::connectivity(
                format!("{} unreachable", self.label),
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, reason),
            )),
            Some(Scripted::QueryError {
                code,
                sql_state,
                message,
            }) => Err(MonitorError::Query {
                context: format!("query on {}", self.label),
                code: Some(code),
                sql_state,
                message,
            }),
            Some(Scripted::Hang) => futures::future::pending().await,
        }
    }

    fn resolved(&self) -> Option<ResolvedConnection> {
        self.resolved.clone()
    }
}

/// Factory handing out [`MemoryConnection`]s per host.
///
/// Hosts without a registered connection get a fresh empty source, which is
/// recorded so tests can script it after the fact.
#[derive(Debug, Default)]
pub struct MemoryConnectionFactory {
    hosts: Mutex<HashMap<String, Arc<MemoryConnection>>>,
    created: Mutex<Vec<String>>,
}

impl MemoryConnectionFactory {
    /// Creates an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the source returned for a host.
    #[must_use]
    pub fn with_host(self, host: &str, connection: MemoryConnection) -> Self {
        self.hosts
            .lock()
            .insert(host.to_ascii_lowercase(), Arc::new(connection));
        self
    }

    /// The source serving a host, if one was created or registered
    pub fn host(&self, host: &str) -> Option<Arc<MemoryConnection>> {
        self.hosts.lock().get(&host.to_ascii_lowercase()).cloned()
    }

    /// Pool names passed to `create`, in call order
    pub fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }
}

impl ConnectionFactory for MemoryConnectionFactory {
    fn create(&self, target: &PoolTarget) -> Result<Arc<dyn ConnectionSource>> {
        self.created.lock().push(target.name.clone());
        let connection = self
            .hosts
            .lock()
            .entry(target.host.to_ascii_lowercase())
            .or_insert_with(|| Arc::new(MemoryConnection::new(target.host.clone())))
            .clone();
        Ok(connection)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let conn = MemoryConnection::new("db1")
            .on("wsrep_cluster_members", Scripted::Rows(vec![Row::new()]))
            .on("from", Scripted::Unreachable("down".to_string()));

        let rows = conn
            .fetch_all("SELECT * FROM mysql.wsrep_cluster_members", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        let error = conn.fetch_all("select x from y", &[]).await.unwrap_err();
        assert!(error.is_connectivity());

        assert!(conn.fetch_all("select 1", &[]).await.unwrap().is_empty());
        assert_eq!(conn.calls_matching("select"), 3);
    }

    #[tokio::test]
    async fn test_query_error_carries_code() {
        let conn = MemoryConnection::new("db1").on(
            "wsrep",
            Scripted::QueryError {
                code: 1146,
                sql_state: Some("42S02".to_string()),
                message: "missing".to_string(),
            },
        );
        let error = conn.fetch_all("select * from wsrep", &[]).await.unwrap_err();
        assert!(error.is_table_not_found());
    }

    #[test]
    fn test_factory_reuses_host_sources() {
        let factory = MemoryConnectionFactory::new();
        let target = PoolTarget {
            name: "a_db2".to_string(),
            uri: url::Url::parse("mysql://db2/app").unwrap(),
            host: "DB2".to_string(),
            port: Some(3306),
            credentials: crate::Credentials::anonymous(),
            pool: PoolConfig::default(),
        };

        factory.create(&target).unwrap();
        factory.create(&target).unwrap();

        assert_eq!(factory.created(), vec!["a_db2", "a_db2"]);
        assert!(factory.host("db2").is_some());
    }
}
