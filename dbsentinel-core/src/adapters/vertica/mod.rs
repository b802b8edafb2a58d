//! Vertica adapter.
//!
//! Vertica exposes cluster-wide system views, so every query runs against
//! the database descriptor and rows are attributed to nodes by node name.
//! The name → id map is refreshed by each node extraction.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, error};

use super::{DatabaseContext, EngineAdapter, sampled_statement};
use crate::connection::{Row, Value};
use crate::datasource::{is_local_host, split_host_port};
use crate::error::Result;
use crate::models::{
    EngineType, IsolationLevel, NodeState, Session, SessionState, Transaction, TransactionState,
};
use crate::node::Node;
use crate::statement::{Statement, StatementStatistics};

const NODES_VIEW: &str = "v_catalog.nodes";
const SESSIONS_VIEW: &str = "v_monitor.sessions";
const TRANSACTIONS_VIEW: &str = "v_monitor.transactions";
const QUERY_REQUESTS_VIEW: &str = "v_monitor.query_requests";

const NODES_SQL: &str = "SELECT node_id, node_name, node_state, export_address \
     FROM v_catalog.nodes ORDER BY node_name";

const SESSIONS_SQL: &str = "SELECT session_id, node_name, user_name, client_hostname, transaction_id, \
     statement_start, current_statement, last_statement, login_timestamp \
     FROM v_monitor.sessions WHERE session_id <> CURRENT_SESSION()";

const TRANSACTIONS_SQL: &str = "SELECT t.transaction_id, t.node_name, t.user_name, t.description, \
     t.isolation, t.is_read_only, t.start_timestamp, t.state \
     FROM v_monitor.sessions s JOIN v_monitor.transactions t ON s.transaction_id = t.transaction_id";

const STATEMENTS_SQL: &str = "SELECT request, user_name, COUNT(*) AS request_cnt, \
     SUM(request_duration_ms) AS total_request_duration_ms, \
     MIN(request_duration_ms) AS min_request_duration_ms, \
     MAX(request_duration_ms) AS max_request_duration_ms, \
     MAX(start_timestamp) AS max_start_timestamp \
     FROM v_monitor.query_requests WHERE start_timestamp BETWEEN ? AND ? \
     GROUP BY request, user_name";

/// Adapter for Vertica clusters.
#[derive(Debug, Default)]
pub struct VerticaAdapter {
    node_ids: RwLock<HashMap<String, String>>,
}

impl VerticaAdapter {
    /// Creates an adapter with an empty node cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn node_id(&self, name: &str, nodes: &[Arc<Node>]) -> Option<String> {
        if let Some(id) = self.node_ids.read().get(name) {
            return Some(id.clone());
        }
        nodes
            .iter()
            .find(|node| node.name() == name)
            .map(|node| node.id().to_string())
    }

    fn resolve_node(&self, row: &Row, view: &str, nodes: &[Arc<Node>]) -> Result<Option<String>> {
        let name: String = row.get_field("node_name", Some(view))?;
        let id = self.node_id(&name, nodes);
        if id.is_none() {
            error!("Cannot find a node with name {}", name);
        }
        Ok(id)
    }
}

#[async_trait]
impl EngineAdapter for VerticaAdapter {
    fn engine(&self) -> EngineType {
        EngineType::Vertica
    }

    async fn extract_nodes(&self, ctx: &DatabaseContext) -> Result<Vec<Node>> {
        let rows = ctx.connection()?.fetch_all(NODES_SQL, &[]).await?;
        let mut nodes = Vec::with_capacity(rows.len());
        for row in &rows {
            let view = Some(NODES_VIEW);
            let id: String = row.get_field("node_id", view)?;
            let name: String = row.get_field("node_name", view)?;
            let state = row
                .get_text("node_state", view)?
                .map_or(NodeState::Unknown, |state| NodeState::from_name(&state));
            let address = row.get_text("export_address", view)?.unwrap_or_default();
            let (host, port) = split_host_port(&address);
            let host = if is_local_host(&host) {
                ctx.data_source().hostname().to_string()
            } else {
                host
            };
            let port = port.or_else(|| ctx.data_source().port());
            nodes.push(ctx.node(&id, &name, &host, port)?.with_reported_state(state));
        }

        *self.node_ids.write() = nodes
            .iter()
            .map(|node| (node.name().to_string(), node.id().to_string()))
            .collect();
        Ok(nodes)
    }

    async fn extract_sessions(
        &self,
        ctx: &DatabaseContext,
        nodes: &[Arc<Node>],
    ) -> Result<Vec<Session>> {
        let rows = ctx.connection()?.fetch_all(SESSIONS_SQL, &[]).await?;
        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(node_id) = self.resolve_node(row, SESSIONS_VIEW, nodes)? else {
                continue;
            };
            sessions.push(session_from_row(ctx, &node_id, row)?);
        }
        Ok(sessions)
    }

    async fn extract_transactions(
        &self,
        ctx: &DatabaseContext,
        nodes: &[Arc<Node>],
    ) -> Result<Vec<Transaction>> {
        let rows = ctx.connection()?.fetch_all(TRANSACTIONS_SQL, &[]).await?;
        let mut transactions = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(node_id) = self.resolve_node(row, TRANSACTIONS_VIEW, nodes)? else {
                continue;
            };
            transactions.push(transaction_from_row(ctx, &node_id, row)?);
        }
        Ok(transactions)
    }

    async fn extract_statements(
        &self,
        ctx: &DatabaseContext,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Statement>> {
        let params = [Value::Timestamp(start), Value::Timestamp(end)];
        let rows = ctx.connection()?.fetch_all(STATEMENTS_SQL, &params).await?;
        let mut statements = Vec::with_capacity(rows.len());
        for row in &rows {
            let view = Some(QUERY_REQUESTS_VIEW);
            let request = row.get_text("request", view)?.unwrap_or_default();
            let user = row.get_text("user_name", view)?.unwrap_or_default();
            let Some(statement) = Statement::new(&request, &user) else {
                debug!("Skipping empty request of {}", user);
                continue;
            };
            let statistics = StatementStatistics {
                count: row
                    .get_opt::<i64>("request_cnt", view)?
                    .and_then(|n| u64::try_from(n).ok())
                    .unwrap_or_default(),
                total: millis(row.get_opt("total_request_duration_ms", view)?),
                min: millis(row.get_opt("min_request_duration_ms", view)?),
                max: millis(row.get_opt("max_request_duration_ms", view)?),
            };
            let statement = match row.get_opt::<DateTime<Utc>>("max_start_timestamp", view)? {
                Some(executed) => statement.with_execution_time(executed),
                None => statement,
            };
            statements.push(statement.with_statistics(statistics));
        }
        Ok(statements)
    }
}

/// A session is active while it holds a real transaction.
pub(crate) fn has_valid_transaction(transaction_id: Option<&str>) -> bool {
    transaction_id
        .map(str::trim)
        .and_then(|id| id.parse::<i64>().ok())
        .is_some_and(|id| id > 0)
}

fn millis(value: Option<f64>) -> Duration {
    value
        .filter(|ms| ms.is_finite() && *ms > 0.0)
        .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
        .unwrap_or_default()
}

fn session_from_row(ctx: &DatabaseContext, node_id: &str, row: &Row) -> Result<Session> {
    let view = Some(SESSIONS_VIEW);
    let session_id: String = row.get_field("session_id", view)?;
    let user = row.get_text("user_name", view)?;
    let transaction_id = row.get_text("transaction_id", view)?;
    let active = has_valid_transaction(transaction_id.as_deref());

    let mut sql = row.get_text("current_statement", view)?;
    if active && sql.is_none() {
        sql = row.get_text("last_statement", view)?;
    }
    let started_at = row.get_opt::<DateTime<Utc>>("statement_start", view)?;
    let elapsed = started_at
        .and_then(|started| Utc::now().signed_duration_since(started).to_std().ok())
        .filter(|_| active)
        .unwrap_or_default();

    Ok(Session::new(ctx.id(), node_id, session_id)
        .with_state(if active {
            SessionState::Active
        } else {
            SessionState::Inactive
        })
        .with_statement(sampled_statement(sql.as_deref(), user.as_deref(), node_id))
        .with_schema(user.clone())
        .with_user(user)
        .with_client_hostname(
            row.get_text("client_hostname", view)?
                .map(|host| split_host_port(&host).0),
        )
        .with_transaction_id(transaction_id.filter(|_| active))
        .with_started_at(started_at)
        .with_elapsed(elapsed)
        .with_created_at(row.get_opt("login_timestamp", view)?))
}

fn transaction_from_row(ctx: &DatabaseContext, node_id: &str, row: &Row) -> Result<Transaction> {
    let view = Some(TRANSACTIONS_VIEW);
    let transaction_id: String = row.get_field("transaction_id", view)?;
    let user = row.get_text("user_name", view)?;
    let statement = sampled_statement(
        row.get_text("description", view)?.as_deref(),
        user.as_deref(),
        node_id,
    );
    let isolation = row
        .get_text("isolation", view)?
        .map_or(IsolationLevel::ReadCommitted, |level| IsolationLevel::from_name(&level));
    let state = row
        .get_text("state", view)?
        .map_or(TransactionState::Running, |state| TransactionState::from_name(&state));

    Ok(Transaction::new(ctx.id(), node_id, transaction_id)
        .with_statement(statement)
        .with_user(user)
        .with_isolation_level(isolation)
        .with_state(state)
        .with_read_only(row.get_opt::<bool>("is_read_only", view)?.unwrap_or(false))
        .with_times(row.get_opt("start_timestamp", view)?, None))
}
