//! Monitoring configuration.
//!
//! [`MonitorConfig`] carries every interval, timeout and capacity the engine
//! uses. Defaults match a dashboard refreshing every few seconds against a
//! handful of clusters; everything can be overridden with the `with_*`
//! builders or from a JSON document (durations are written in seconds).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::MonitorError;

/// Settings for pools created lazily for discovered cluster nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections per node pool
    pub max_connections: u32,
    /// Time allowed to open a connection
    #[serde(with = "seconds")]
    pub connect_timeout: Duration,
    /// Idle connections are closed after this long
    #[serde(with = "seconds")]
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Configuration for the monitoring engine.
///
/// # Example
/// ```rust
/// use dbsentinel_core::MonitorConfig;
/// use std::time::Duration;
///
/// let config = MonitorConfig::default()
///     .with_session_refresh_interval(Duration::from_secs(2))
///     .with_max_concurrency(8);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How long a node validation result stays fresh
    #[serde(with = "seconds")]
    pub availability_interval: Duration,
    /// Minimum time between two node discoveries of the same database
    #[serde(with = "seconds")]
    pub node_refresh_interval: Duration,
    /// Discovery retry interval while a database has no known nodes
    #[serde(with = "seconds")]
    pub node_retry_interval: Duration,
    /// Age after which the published session list is refreshed
    #[serde(with = "seconds")]
    pub session_refresh_interval: Duration,
    /// Age after which the published transaction list is refreshed
    #[serde(with = "seconds")]
    pub transaction_refresh_interval: Duration,
    /// Timeout of the TCP reachability probe
    #[serde(with = "seconds")]
    pub reachability_timeout: Duration,
    /// Timeout of the SQL probe
    #[serde(with = "seconds")]
    pub probe_timeout: Duration,
    /// Upper bound on waiting for per-database extraction tasks
    #[serde(with = "seconds")]
    pub aggregate_wait: Duration,
    /// Maximum number of databases extracted in parallel
    pub max_concurrency: usize,
    /// Number of statements kept in memory
    pub statement_cache_capacity: usize,
    /// Settings for per-node pools
    pub pool: PoolConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            availability_interval: Duration::from_secs(60),
            node_refresh_interval: Duration::from_secs(60),
            node_retry_interval: Duration::from_secs(5),
            session_refresh_interval: Duration::from_secs(5),
            transaction_refresh_interval: Duration::from_secs(5),
            reachability_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            aggregate_wait: Duration::from_secs(10),
            max_concurrency: 4,
            statement_cache_capacity: 5000,
            pool: PoolConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns a configuration error for zero durations, zero concurrency or
    /// a zero-sized statement cache.
    pub fn validate(&self) -> crate::Result<()> {
        let durations = [
            ("availability_interval", self.availability_interval),
            ("node_refresh_interval", self.node_refresh_interval),
            ("node_retry_interval", self.node_retry_interval),
            ("session_refresh_interval", self.session_refresh_interval),
            (
                "transaction_refresh_interval",
                self.transaction_refresh_interval,
            ),
            ("reachability_timeout", self.reachability_timeout),
            ("probe_timeout", self.probe_timeout),
            ("aggregate_wait", self.aggregate_wait),
            ("pool.connect_timeout", self.pool.connect_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(MonitorError::configuration(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.max_concurrency == 0 {
            return Err(MonitorError::configuration(
                "max_concurrency must be greater than 0",
            ));
        }

        if self.statement_cache_capacity == 0 {
            return Err(MonitorError::configuration(
                "statement_cache_capacity must be greater than 0",
            ));
        }

        if self.pool.max_connections == 0 {
            return Err(MonitorError::configuration(
                "pool.max_connections must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Sets the node availability interval.
    pub const fn with_availability_interval(mut self, interval: Duration) -> Self {
        self.availability_interval = interval;
        self
    }

    /// Sets the node discovery interval.
    pub const fn with_node_refresh_interval(mut self, interval: Duration) -> Self {
        self.node_refresh_interval = interval;
        self
    }

    /// Sets the session refresh interval.
    pub const fn with_session_refresh_interval(mut self, interval: Duration) -> Self {
        self.session_refresh_interval = interval;
        self
    }

    /// Sets the transaction refresh interval.
    pub const fn with_transaction_refresh_interval(mut self, interval: Duration) -> Self {
        self.transaction_refresh_interval = interval;
        self
    }

    /// Sets both probe timeouts.
    pub const fn with_probe_timeouts(mut self, reachability: Duration, probe: Duration) -> Self {
        self.reachability_timeout = reachability;
        self.probe_timeout = probe;
        self
    }

    /// Sets the bound on waiting for extraction tasks.
    pub const fn with_aggregate_wait(mut self, wait: Duration) -> Self {
        self.aggregate_wait = wait;
        self
    }

    /// Sets the maximum concurrency for per-database extraction.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Sets the statement cache capacity.
    pub fn with_statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity.max(1);
        self
    }

    /// Sets the per-node pool settings.
    pub const fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

/// Serde helpers writing durations as fractional seconds.
pub mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes a duration as seconds.
    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    /// Deserializes a duration from seconds.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
