//! Connection sources and the pool factory.
//!
//! The engine never talks to a driver directly. Every query goes through a
//! [`ConnectionSource`], and pools for discovered cluster members are built
//! by an injected [`ConnectionFactory`]. Factories must be lazy: creating a
//! source for an unreachable host succeeds and only the first query fails.

pub mod memory;
#[cfg(feature = "mysql")]
pub mod mysql;
mod row;

pub use row::{FromValue, Row, Value, ValueError};

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::config::PoolConfig;
use crate::credentials::Credentials;
use crate::datasource::DataSource;
use crate::error::Result;

/// URI and user a live pool actually connects with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConnection {
    /// Connection URI without credentials
    pub uri: String,
    /// User name the pool authenticates as
    pub username: Option<String>,
}

/// A pooled, queryable connection to one endpoint.
#[async_trait]
pub trait ConnectionSource: Send + Sync + std::fmt::Debug {
    /// Runs a read-only query and returns every row.
    ///
    /// # Errors
    /// Returns [`MonitorError::Connectivity`](crate::MonitorError::Connectivity)
    /// when the endpoint cannot be reached and
    /// [`MonitorError::Query`](crate::MonitorError::Query) when the database
    /// rejects the statement.
    async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Settings the pool resolved, when the implementation knows them.
    fn resolved(&self) -> Option<ResolvedConnection> {
        None
    }

    /// Releases pooled connections.
    async fn close(&self) {}
}

/// Everything a factory needs to build a pool.
#[derive(Debug, Clone)]
pub struct PoolTarget {
    /// Pool name, the id of the owning data source
    pub name: String,
    /// Endpoint URI without credentials
    pub uri: Url,
    /// Resolved host
    pub host: String,
    /// Resolved port
    pub port: Option<u16>,
    /// Credentials to authenticate with
    pub credentials: Credentials,
    /// Pool sizing and timeouts
    pub pool: PoolConfig,
}

impl PoolTarget {
    /// Builds a target for a descriptor.
    pub fn for_data_source(data_source: &DataSource, pool: &PoolConfig) -> Self {
        Self {
            name: data_source.id().to_string(),
            uri: data_source.uri().clone(),
            host: data_source.hostname().to_string(),
            port: data_source.port(),
            credentials: data_source.credentials().clone(),
            pool: pool.clone(),
        }
    }
}

/// Turns a target into a connection source.
pub trait ConnectionFactory: Send + Sync + std::fmt::Debug {
    /// Creates a lazily connecting source.
    ///
    /// # Errors
    /// Returns a configuration error when the target cannot be expressed for
    /// the driver. Must not fail because the host is unreachable.
    fn create(&self, target: &PoolTarget) -> Result<Arc<dyn ConnectionSource>>;
}
