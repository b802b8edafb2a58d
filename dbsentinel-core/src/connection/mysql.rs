//! MySQL and MariaDB connection sources on top of sqlx.
//!
//! Pools are created with `connect_lazy_with`, so building a source for a
//! cluster member that is currently down never blocks and never fails; the
//! first query reports the connectivity error instead.
//!
//! # Security Features
//! - Every pooled session is switched to read-only transactions
//! - Session time zone is UTC so sampled timestamps are comparable
//! - Credentials are passed to the driver, never formatted into URIs

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::{MySqlConnectOptions, MySqlDatabaseError, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Executor, Row as _};

use super::{ConnectionFactory, ConnectionSource, PoolTarget, ResolvedConnection, Row, Value};
use crate::error::{MonitorError, Result};

/// A sqlx MySQL pool answering monitoring queries.
#[derive(Debug, Clone)]
pub struct MySqlConnectionSource {
    pool: MySqlPool,
    resolved: ResolvedConnection,
}

impl MySqlConnectionSource {
    /// Creates a lazily connecting pool for a target.
    ///
    /// # Errors
    /// Returns a configuration error when the target URI is not a valid MySQL
    /// connection string.
    pub fn connect_lazy(target: &PoolTarget) -> Result<Self> {
        let mut uri = target.uri.clone();
        // sqlx only understands the mysql scheme; mariadb URIs share the protocol.
        if uri.scheme() != "mysql" {
            uri = url::Url::parse(&uri.as_str().replacen(uri.scheme(), "mysql", 1)).map_err(|e| {
                MonitorError::configuration(format!("invalid MySQL URI for {}: {e}", target.name))
            })?;
        }

        let mut options = MySqlConnectOptions::from_str(uri.as_str()).map_err(|e| {
            MonitorError::configuration(format!("invalid MySQL URI for {}: {e}", target.name))
        })?;
        options = options.host(&target.host);
        if let Some(port) = target.port {
            options = options.port(port);
        }
        if target.credentials.has_username() {
            options = options.username(target.credentials.username());
        }
        if let Some(password) = target.credentials.password() {
            options = options.password(password);
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(target.pool.max_connections.min(100))
            .min_connections(0)
            .acquire_timeout(target.pool.connect_timeout)
            .idle_timeout(target.pool.idle_timeout)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute("SET SESSION TRANSACTION READ ONLY").await?;
                    conn.execute("SET time_zone = '+00:00'").await?;
                    Ok(())
                })
            })
            .connect_lazy_with(options);

        Ok(Self {
            pool,
            resolved: ResolvedConnection {
                uri: uri.to_string(),
                username: target
                    .credentials
                    .has_username()
                    .then(|| target.credentials.username().to_string()),
            },
        })
    }

    /// Underlying pool
    pub const fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl ConnectionSource for MySqlConnectionSource {
    async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut query = sqlx::query::<sqlx::MySql>(sql);
        for param in params {
            query = match param {
                Value::Null => query.bind(None::<String>),
                Value::Bool(b) => query.bind(*b),
                Value::Int(n) => query.bind(*n),
                Value::Float(n) => query.bind(*n),
                Value::Text(text) => query.bind(text.clone()),
                Value::Timestamp(ts) => query.bind(*ts),
            };
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify_error(sql, e))?;
        Ok(rows.iter().map(convert_row).collect())
    }

    fn resolved(&self) -> Option<ResolvedConnection> {
        Some(self.resolved.clone())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Builds [`MySqlConnectionSource`]s for discovered nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlConnectionFactory;

impl ConnectionFactory for MySqlConnectionFactory {
    fn create(&self, target: &PoolTarget) -> Result<Arc<dyn ConnectionSource>> {
        Ok(Arc::new(MySqlConnectionSource::connect_lazy(target)?))
    }
}

fn classify_error(sql: &str, error: sqlx::Error) -> MonitorError {
    let context = abbreviate(sql);
    match error {
        sqlx::Error::Database(db_error) => {
            let code = db_error
                .try_downcast_ref::<MySqlDatabaseError>()
                .map(|e| i64::from(e.number()));
            MonitorError::Query {
                context,
                code,
                sql_state: db_error.code().map(|c| c.into_owned()),
                message: db_error.message().to_string(),
            }
        }
        e @ (sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed) => MonitorError::connectivity(context, e),
        other => MonitorError::extraction(context, other),
    }
}

fn abbreviate(sql: &str) -> String {
    let mut text: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.len() > 80 {
        let cut = text
            .char_indices()
            .nth(80)
            .map_or(text.len(), |(index, _)| index);
        text.truncate(cut);
        text.push_str("...");
    }
    text
}

fn convert_row(row: &MySqlRow) -> Row {
    let mut converted = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        converted.push(column.name(), convert_value(row, index));
    }
    converted
}

// Decoders are tried from the most to the least specific type; sqlx refuses
// incompatible ones without consuming the value.
fn convert_value(row: &MySqlRow, index: usize) -> Value {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map_or(Value::Null, Value::Int);
    }
    if let Ok(value) = row.try_get::<Option<u64>, _>(index) {
        return value.map_or(Value::Null, |n| {
            i64::try_from(n).map_or_else(|_| Value::Text(n.to_string()), Value::Int)
        });
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map_or(Value::Null, Value::Text);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value.map_or(Value::Null, Value::Float);
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return value.map_or(Value::Null, Value::Bool);
    }
    if let Ok(value) = row.try_get::<Option<DateTime<Utc>>, _>(index) {
        return value.map_or(Value::Null, Value::Timestamp);
    }
    if let Ok(value) = row.try_get::<Option<NaiveDateTime>, _>(index) {
        return value.map_or(Value::Null, |ts| Value::Timestamp(ts.and_utc()));
    }
    if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return value.map_or(Value::Null, |bytes| {
            Value::Text(String::from_utf8_lossy(&bytes).into_owned())
        });
    }
    tracing::debug!("Unsupported column type at index {}", index);
    Value::Null
}
