//! MySQL, MariaDB and Galera adapter.
//!
//! Cluster members come from the Galera membership view. A server without
//! that view is not clustered; the first "table not found" answer switches
//! the adapter to single-node mode for good and the view is never queried
//! again. Sessions are read from the process list of every available node.


use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use super::{DatabaseContext, EngineAdapter, sampled_statement};
use crate::connection::Row;
use crate::datasource::split_host_port;
use crate::error::Result;
use crate::models::{EngineType, Session, SessionState};
use crate::node::Node;

/// Name under which a Galera arbitrator joins the cluster.
pub const ARBITRATOR_NODE_NAME: &str = "garb";

/// User name of server-internal threads.
pub const SYSTEM_USER: &str = "system user";

const MEMBERSHIP_VIEW: &str = "mysql.wsrep_cluster_members";
const PROCESSLIST_VIEW: &str = "information_schema.processlist";

const MEMBERSHIP_SQL: &str = "SELECT node_uuid, node_name, node_incoming_address \
     FROM mysql.wsrep_cluster_members ORDER BY node_name";

const SESSIONS_SQL: &str = "SELECT id, user, host, db, command, time * 1000 AS time_ms, state, info \
     FROM information_schema.processlist WHERE id <> CONNECTION_ID()";

const ACTIVE: &[&str] = &[
    // commands
    "execute",
    "fetch",
    "long data",
    "prepare",
    "query",
    "drop db",
    "close stmt",
    "reset stmt",
    "set option",
    "delayed insert",
    // states
    "executing",
    "searching rows for update",
    "sending data",
];

const BLOCKED: &[&str] = &["init", "locked"];

const WAITING: &[&str] = &["optimizing", "preparing", "reopen tables"];

/// Adapter for the MySQL family.
#[derive(Debug)]
pub struct MySqlAdapter {
    clustered: AtomicBool,
}

impl Default for MySqlAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MySqlAdapter {
    /// Creates an adapter that still tries cluster discovery.
    pub const fn new() -> Self {
        Self {
            clustered: AtomicBool::new(true),
        }
    }

    /// False once the membership view turned out to be missing.
    pub fn is_clustered(&self) -> bool {
        self.clustered.load(Ordering::Acquire)
    }

    async fn cluster_members(&self, ctx: &DatabaseContext) -> Result<Vec<Node>> {
        let rows = ctx.connection()?.fetch_all(MEMBERSHIP_SQL, &[]).await?;
        let mut nodes = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.get_field("node_name", Some(MEMBERSHIP_VIEW))?;
            if name.eq_ignore_ascii_case(ARBITRATOR_NODE_NAME) {
                debug!("Skipping arbitrator {} of {}", name, ctx.id());
                continue;
            }
            let id: String = row.get_field("node_uuid", Some(MEMBERSHIP_VIEW))?;
            let address = row
                .get_text("node_incoming_address", Some(MEMBERSHIP_VIEW))?
                .unwrap_or_default();
            let (host, port) = split_host_port(&address);
            let host = if host.is_empty() {
                ctx.data_source().hostname().to_string()
            } else {
                host
            };
            nodes.push(ctx.node(&id, &name, &host, port)?);
        }
        Ok(nodes)
    }

    async fn node_sessions(&self, ctx: &DatabaseContext, node: &Node) -> Result<Vec<Session>> {
        let connection = node.data_source().require_connection()?;
        let rows = ctx
            .metrics()
            .time(
                &format!("Extract Sessions - {}", node.name()),
                connection.fetch_all(SESSIONS_SQL, &[]),
            )
            .await?;
        rows.iter()
            .map(|row| session_from_row(ctx, node, row))
            .collect()
    }
}

#[async_trait]
impl EngineAdapter for MySqlAdapter {
    fn engine(&self) -> EngineType {
        EngineType::MySql
    }

    async fn extract_nodes(&self, ctx: &DatabaseContext) -> Result<Vec<Node>> {
        if self.is_clustered() {
            match self.cluster_members(ctx).await {
                Ok(nodes) if !nodes.is_empty() => return Ok(nodes),
                Ok(_) => debug!("{} reports no cluster members", ctx.id()),
                Err(e) if e.is_table_not_found() => {
                    self.clustered.store(false, Ordering::Release);
                    info!(
                        "{} has no {}, treating it as a single node",
                        ctx.id(),
                        MEMBERSHIP_VIEW
                    );
                }
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => error!("Could not extract cluster members of {}: {}", ctx.id(), e),
            }
        }
        Ok(vec![ctx.self_node()])
    }

    async fn extract_sessions(
        &self,
        ctx: &DatabaseContext,
        nodes: &[Arc<Node>],
    ) -> Result<Vec<Session>> {
        let results = join_all(nodes.iter().map(|node| self.node_sessions(ctx, node))).await;

        let mut sessions = Vec::new();
        for (node, result) in nodes.iter().zip(results) {
            match result {
                Ok(node_sessions) => sessions.extend(node_sessions),
                Err(e) if e.is_connectivity() => {
                    debug!("Skipping sessions of unreachable node {}: {}", node.id(), e);
                }
                Err(e) => warn!("Failed to extract sessions of node {}: {}", node.id(), e),
            }
        }
        Ok(sessions)
    }
}

/// Maps a process list `(command, state)` pair to a session state.
///
/// An active command wins over the thread state, so a query waiting on a
/// table lock still counts as active.
pub(crate) fn session_state(command: Option<&str>, state: Option<&str>) -> SessionState {
    let command = command.unwrap_or_default().trim().to_ascii_lowercase();
    let state = state.unwrap_or_default().trim().to_ascii_lowercase();

    if command == "sleep" {
        SessionState::Inactive
    } else if ACTIVE.contains(&command.as_str()) {
        SessionState::Active
    } else if BLOCKED.contains(&state.as_str()) {
        SessionState::Blocked
    } else if WAITING.contains(&state.as_str()) {
        SessionState::Waiting
    } else if command == "killed" || state == "killed" {
        SessionState::Killed
    } else {
        SessionState::Inactive
    }
}

fn session_from_row(ctx: &DatabaseContext, node: &Node, row: &Row) -> Result<Session> {
    let view = Some(PROCESSLIST_VIEW);
    let native_id: i64 = row.get_field("id", view)?;
    let user = row.get_text("user", view)?;
    let command = row.get_text("command", view)?;
    let state = row.get_text("state", view)?;
    let elapsed = row
        .get_opt::<i64>("time_ms", view)?
        .and_then(|ms| u64::try_from(ms).ok())
        .map(Duration::from_millis)
        .unwrap_or_default();
    let started_at = chrono::Duration::from_std(elapsed)
        .ok()
        .and_then(|elapsed| Utc::now().checked_sub_signed(elapsed));
    let client_hostname = row
        .get_text("host", view)?
        .map(|host| split_host_port(&host).0);
    let statement = sampled_statement(
        row.get_text("info", view)?.as_deref(),
        user.as_deref(),
        node.id(),
    );

    Ok(Session::new(ctx.id(), node.id(), native_id.to_string())
        .with_system(user.as_deref() == Some(SYSTEM_USER))
        .with_state(session_state(command.as_deref(), state.as_deref()))
        .with_user(user)
        .with_schema(row.get_text("db", view)?)
        .with_client_hostname(client_hostname)
        .with_elapsed(elapsed)
        .with_started_at(started_at)
        .with_statement(statement)
        .with_info(state))
}
