//! Monitoring engine for clustered relational databases.
//!
//! This crate discovers the topology of MySQL/Galera and Vertica
//! deployments, samples live sessions and transactions on every reachable
//! node, classifies the statements they run and rolls the result up into
//! serializable snapshots.
//!
//! # Architecture
//! - [`Monitor`] registers connection descriptors and owns one [`Database`]
//!   per monitored descriptor
//! - each [`Database`] delegates extraction to an engine adapter and caches
//!   the discovered [`Node`]s
//! - nodes validate themselves lazily with a TCP reachability check and a
//!   cheap SQL probe
//! - statements are content-addressed and interned through a bounded cache
//!   in front of a durable [`store::StatementStore`]
//!
//! Drivers are pluggable through [`connection::ConnectionFactory`]; the
//! `mysql` feature ships a sqlx-backed factory.
//!
//! # Failure model
//! Extraction failures never reach callers of aggregate queries. They are
//! logged and surface as node state, stale caches or incomplete snapshots.
//! Only lookups by id fail, with [`MonitorError::NotRegistered`].

pub mod adapters;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod database;
pub mod datasource;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod node;
pub mod registry;
pub mod snapshot;
pub mod statement;
pub mod store;

// Re-export commonly used types
pub use adapters::{DatabaseContext, EngineAdapter, create_adapter};
pub use config::{MonitorConfig, PoolConfig};
pub use credentials::Credentials;
pub use database::Database;
pub use datasource::DataSource;
pub use error::{MonitorError, Result};
pub use models::{
    EngineType, IsolationLevel, NodeState, Session, SessionState, Transaction, TransactionState,
};
pub use monitor::Monitor;
pub use node::{Node, NodeInfo};
pub use snapshot::{Snapshot, SnapshotSummary};
pub use statement::{Statement, StatementType};
