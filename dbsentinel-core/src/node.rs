//! Cluster members and their availability state machine.
//!
//! Availability is pulled, not pushed: [`Node::is_available`] answers from
//! the last validation while it is younger than the availability interval
//! and only then probes again. A probe is a TCP reachability check followed,
//! when the port answers, by a cheap read-only SQL statement.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::MonitorConfig;
use crate::datasource::DataSource;
use crate::error::{MonitorError, Result};
use crate::metrics::Metrics;
use crate::models::NodeState;

/// Probe statement used when an engine has no cheaper equivalent.
pub const DEFAULT_PROBE_SQL: &str = "SELECT 1";

#[derive(Debug, Clone, Default)]
struct Validation {
    state: NodeState,
    available: bool,
    error: Option<String>,
    last_validated: Option<Instant>,
    validated_at: Option<DateTime<Utc>>,
}

/// One addressable database endpoint.
///
/// Two nodes are equal when their ids are equal. Validation fields are
/// written only by the node's own [`validate`](Self::validate).
#[derive(Debug)]
pub struct Node {
    id: String,
    name: String,
    database_id: String,
    data_source: DataSource,
    reported_state: NodeState,
    probe_sql: &'static str,
    reachability_timeout: Duration,
    probe_timeout: Duration,
    availability_interval: Duration,
    metrics: Metrics,
    validation: RwLock<Validation>,
    validating: tokio::sync::Mutex<()>,
}

impl Node {
    /// Creates a node that has never been validated.
    pub fn new(
        database_id: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
        data_source: DataSource,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            database_id: database_id.into(),
            data_source,
            reported_state: NodeState::Unknown,
            probe_sql: DEFAULT_PROBE_SQL,
            reachability_timeout: config.reachability_timeout,
            probe_timeout: config.probe_timeout,
            availability_interval: config.availability_interval,
            metrics: Metrics::detached("Node"),
            validation: RwLock::new(Validation::default()),
            validating: tokio::sync::Mutex::new(()),
        }
    }

    /// Sets the state the engine reports for this node.
    #[must_use]
    pub fn with_reported_state(mut self, state: NodeState) -> Self {
        self.reported_state = state;
        self.validation.get_mut().state = state;
        self
    }

    /// Sets the SQL probe.
    #[must_use]
    pub const fn with_probe_sql(mut self, sql: &'static str) -> Self {
        self.probe_sql = sql;
        self
    }

    /// Times validations through a metrics facility.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Node id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the owning database
    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// Descriptor used to reach the node
    pub const fn data_source(&self) -> &DataSource {
        &self.data_source
    }

    /// State reported by the engine at discovery
    pub const fn reported_state(&self) -> NodeState {
        self.reported_state
    }

    /// Current state
    pub fn state(&self) -> NodeState {
        self.validation.read().state
    }

    /// Reason of the last failed validation
    pub fn validation_error(&self) -> Option<String> {
        self.validation.read().error.clone()
    }

    /// Wall-clock time of the last validation
    pub fn validated_at(&self) -> Option<DateTime<Utc>> {
        self.validation.read().validated_at
    }

    /// Returns true once a validation has run.
    pub fn is_validated(&self) -> bool {
        self.validation.read().last_validated.is_some()
    }

    /// Cached availability, probing again only when the last validation is
    /// older than the availability interval.
    pub async fn is_available(&self) -> bool {
        if let Some(available) = self.fresh_availability() {
            return available;
        }
        let _guard = self.validating.lock().await;
        if let Some(available) = self.fresh_availability() {
            return available;
        }
        self.run_validation().await
    }

    /// Probes the node and records the outcome.
    ///
    /// Returns the resulting availability. Failures never escape: they turn
    /// the node `DOWN` and are kept as the validation error.
    pub async fn validate(&self) -> bool {
        let _guard = self.validating.lock().await;
        self.run_validation().await
    }

    /// Copies the validation state of the node this one replaces.
    ///
    /// Timestamps and the validation error carry over. After a successful
    /// validation a known state reported at this discovery replaces the
    /// inherited one, so a member the engine now reports `DOWN` is
    /// unavailable without waiting for the next validation.
    pub fn inherit_validation(&self, previous: &Self) {
        let mut inherited = previous.validation.read().clone();
        if inherited.error.is_none() && self.reported_state != NodeState::Unknown {
            inherited.state = self.reported_state;
            inherited.available = inherited.state.is_available();
        }
        *self.validation.write() = inherited;
    }

    /// Serializable view of the node.
    pub fn info(&self) -> NodeInfo {
        let validation = self.validation.read();
        NodeInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            database_id: self.database_id.clone(),
            hostname: self.data_source.hostname().to_string(),
            port: self.data_source.port(),
            state: validation.state,
            reported_state: self.reported_state,
            available: validation.available,
            queryable: validation.state.is_queryable(),
            validation_error: validation.error.clone(),
            validated_at: validation.validated_at,
        }
    }

    fn fresh_availability(&self) -> Option<bool> {
        let validation = self.validation.read();
        validation
            .last_validated
            .filter(|at| at.elapsed() < self.availability_interval)
            .map(|_| validation.available)
    }

    async fn run_validation(&self) -> bool {
        let outcome = self.metrics.time("Validate", self.probe()).await;

        let mut validation = self.validation.write();
        match outcome {
            Ok(()) => {
                validation.state = match self.reported_state {
                    NodeState::Unknown | NodeState::Down => NodeState::Up,
                    reported => reported,
                };
                validation.error = None;
            }
            Err(e) => {
                if e.is_connectivity() {
                    debug!("Node {} is down: {}", self.id, e);
                } else {
                    warn!("Validation of node {} failed: {}", self.id, e);
                }
                validation.state = NodeState::Down;
                validation.error = Some(e.to_string());
            }
        }
        validation.available = validation.state.is_available();
        validation.last_validated = Some(Instant::now());
        validation.validated_at = Some(Utc::now());
        validation.available
    }

    async fn probe(&self) -> Result<()> {
        let host = self.data_source.hostname();
        match self.data_source.port() {
            Some(port) => {
                tokio::time::timeout(self.reachability_timeout, TcpStream::connect((host, port)))
                    .await
                    .map_err(|_| {
                        MonitorError::timeout(
                            format!("Reachability of {host}:{port}"),
                            self.reachability_timeout,
                        )
                    })?
                    .map_err(|e| MonitorError::connectivity(format!("{host}:{port}"), e))?;
            }
            None => debug!("Node {} has no port, skipping reachability check", self.id),
        }

        let connection = self.data_source.require_connection()?;
        tokio::time::timeout(self.probe_timeout, connection.fetch_all(self.probe_sql, &[]))
            .await
            .map_err(|_| {
                MonitorError::timeout(format!("Probe of node {}", self.id), self.probe_timeout)
            })??;
        Ok(())
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

/// Point-in-time view of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node id
    pub id: String,
    /// Display name
    pub name: String,
    /// Owning database
    pub database_id: String,
    /// Host the node is reached at
    pub hostname: String,
    /// Port the node is reached at
    pub port: Option<u16>,
    /// Validated state
    pub state: NodeState,
    /// State reported by the engine
    pub reported_state: NodeState,
    /// Healthy enough to count
    pub available: bool,
    /// Safe to route reads to
    pub queryable: bool,
    /// Reason of the last failed validation
    pub validation_error: Option<String>,
    /// Time of the last validation
    pub validated_at: Option<DateTime<Utc>>,
}
