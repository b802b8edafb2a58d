//! Unit tests for the monitoring orchestrator.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use super::Monitor;
use crate::config::MonitorConfig;
use crate::connection::memory::{MemoryConnection, MemoryConnectionFactory, Scripted};
use crate::connection::{ConnectionFactory, ConnectionSource, PoolTarget, ResolvedConnection, Row};
use crate::datasource::DataSource;
use crate::error::MonitorError;
use crate::metrics::TimerRegistry;
use crate::statement::Statement;
use crate::store::MemoryStatementStore;

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn table_not_found() -> Scripted {
    Scripted::QueryError {
        code: 1146,
        sql_state: Some("42S02".to_string()),
        message: "Table 'mysql.wsrep_cluster_members' doesn't exist".to_string(),
    }
}

fn process(id: i64, sql: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("user", "app")
        .with("host", "10.0.0.9:51234")
        .with("db", "app")
        .with("command", "Query")
        .with("state", "executing")
        .with("time_ms", 1000_i64)
        .with("info", sql)
}

fn standalone(label: &str, processes: Vec<Row>) -> MemoryConnection {
    MemoryConnection::new(label)
        .on("wsrep_cluster_members", table_not_found())
        .on("processlist", Scripted::Rows(processes))
}

fn mysql_source(id: &str, port: u16, connection: Arc<MemoryConnection>) -> DataSource {
    DataSource::new(id, id, &format!("mysql://monitor@127.0.0.1:{port}/app"))
        .unwrap()
        .with_connection(connection)
}

fn failing_vertica(port: u16) -> DataSource {
    let connection = MemoryConnection::new("analytics")
        .on(
            "v_catalog.nodes",
            Scripted::Rows(vec![
                Row::new()
                    .with("node_id", "45035996273704980")
                    .with("node_name", "v_analytics_node0001")
                    .with("node_state", "UP")
                    .with("export_address", format!("127.0.0.1:{port}")),
            ]),
        )
        .on(
            "v_monitor.sessions",
            Scripted::QueryError {
                code: 4566,
                sql_state: Some("42V01".to_string()),
                message: "Relation \"v_monitor.sessions\" does not exist".to_string(),
            },
        );
    DataSource::new(
        "analytics",
        "Analytics",
        &format!("vertica://dbadmin@127.0.0.1:{port}/analytics"),
    )
    .unwrap()
    .with_connection(Arc::new(connection))
}

fn monitor_with(config: MonitorConfig) -> Arc<Monitor> {
    Arc::new(
        Monitor::new(
            config,
            Arc::new(MemoryConnectionFactory::new()),
            Arc::new(MemoryStatementStore::new()),
            Arc::new(TimerRegistry::new()),
        )
        .unwrap(),
    )
}

fn monitor() -> Arc<Monitor> {
    monitor_with(MonitorConfig::default())
}

// =============================================================================
// Registration Tests
// =============================================================================

#[tokio::test]
async fn test_unsupported_scheme_stays_a_plain_connection() {
    let monitor = monitor();
    let ds = DataSource::new("reports", "Reports", "postgresql://app@pg1:5432/reports").unwrap();

    let database = monitor.register_data_source(ds).await.unwrap();

    assert!(database.is_none());
    assert!(monitor.find_data_source("reports").unwrap().connection().is_some());
    assert!(matches!(
        monitor.get_database("reports"),
        Err(MonitorError::NotRegistered { kind: "Database", .. })
    ));
}

#[derive(Debug)]
struct NoDrivers;

impl ConnectionFactory for NoDrivers {
    fn create(&self, target: &PoolTarget) -> crate::error::Result<Arc<dyn ConnectionSource>> {
        Err(MonitorError::configuration(format!(
            "no driver for scheme '{}'",
            target.uri.scheme()
        )))
    }
}

#[tokio::test]
async fn test_descriptors_without_driver_stay_registered() {
    let monitor = Monitor::new(
        MonitorConfig::default(),
        Arc::new(NoDrivers),
        Arc::new(MemoryStatementStore::new()),
        Arc::new(TimerRegistry::new()),
    )
    .unwrap();
    let reports = DataSource::new("reports", "Reports", "postgresql://app@pg1:5432/reports").unwrap();
    let analytics =
        DataSource::new("analytics", "Analytics", "vertica://dbadmin@vnode1:5433/analytics").unwrap();

    assert!(monitor.register_data_source(reports).await.unwrap().is_none());
    assert!(monitor.register_data_source(analytics).await.unwrap().is_none());

    let registered = monitor.find_data_source("reports").unwrap();
    assert!(registered.connection().is_none());
    assert!(monitor.find_data_source("analytics").is_some());
    assert!(monitor.find_database("analytics").is_none());
    assert!(monitor.databases().is_empty());
}

#[tokio::test]
async fn test_unknown_ids_are_reported() {
    let monitor = monitor();

    assert!(monitor.get_data_source("missing").is_err());
    assert!(monitor.find_database("missing").is_none());
    assert!(matches!(
        monitor.get_node("missing").await,
        Err(MonitorError::NotRegistered { kind: "Node", .. })
    ));
}

#[tokio::test]
async fn test_reregistration_replaces_the_database() {
    let monitor = monitor();
    let connection = Arc::new(standalone("orders", vec![]));
    let ds = mysql_source("orders", 3306, connection);

    let first = monitor.register_data_source(ds.clone()).await.unwrap().unwrap();
    let second = monitor.register_data_source(ds.clone()).await.unwrap().unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&monitor.get_database("orders").unwrap(), &second));

    let moved = ds.with_uri("sqlserver://monitor@127.0.0.1:1433/app").unwrap();
    monitor.register_data_source(moved).await.unwrap();
    assert!(monitor.find_database("orders").is_none());
}

#[tokio::test]
async fn test_update_properties_adopts_resolved_settings() {
    let monitor = monitor();
    let connection = standalone("orders", vec![]).with_resolved(ResolvedConnection {
        uri: "mysql://db1-primary:3307/app".to_string(),
        username: Some("monitor_ro".to_string()),
    });
    let ds = DataSource::new("orders", "Orders", "mysql://monitor@db1:3306/app")
        .unwrap()
        .with_connection(Arc::new(connection));
    monitor.register_data_source(ds.clone()).await.unwrap();

    let updated = monitor.update_properties(&ds).await.unwrap();

    assert_eq!(updated.hostname(), "db1-primary");
    assert_eq!(updated.port(), Some(3307));
    assert_eq!(updated.username(), "monitor_ro");
    let registered = monitor.get_data_source("orders").unwrap();
    assert_eq!(registered.hostname(), "db1-primary");
    let database = monitor.get_database("orders").unwrap();
    assert_eq!(database.data_source().username(), "monitor_ro");
}

// =============================================================================
// Node Tests
// =============================================================================

#[tokio::test]
async fn test_nodes_and_validation_span_databases() {
    let (_a, port_a) = listener().await;
    let (_b, port_b) = listener().await;
    let monitor = monitor();
    for (id, port) in [("orders", port_a), ("billing", port_b)] {
        let connection = Arc::new(standalone(id, vec![]));
        monitor
            .register_data_source(mysql_source(id, port, connection))
            .await
            .unwrap();
    }

    let nodes = monitor.nodes().await;

    assert_eq!(nodes.len(), 2);
    assert_eq!(monitor.validate_databases().await, 2);
    assert_eq!(monitor.get_node("ORDERS").await.unwrap().database_id(), "orders");
}

// =============================================================================
// Session Aggregation Tests
// =============================================================================

#[tokio::test]
async fn test_failing_database_does_not_hide_the_others() {
    let (_a, port_a) = listener().await;
    let (_b, port_b) = listener().await;
    let (_v, port_v) = listener().await;
    let monitor = monitor();
    let orders = Arc::new(standalone("orders", vec![process(1, "select * from orders")]));
    let billing = Arc::new(standalone("billing", vec![process(2, "select * from invoices")]));
    monitor
        .register_data_source(mysql_source("orders", port_a, orders))
        .await
        .unwrap();
    monitor
        .register_data_source(mysql_source("billing", port_b, billing))
        .await
        .unwrap();
    monitor.register_data_source(failing_vertica(port_v)).await.unwrap();

    let sessions = monitor.refresh_sessions().await;

    assert_eq!(sessions.len(), 2);
    let databases: HashSet<&str> = sessions.iter().map(|s| s.database_id()).collect();
    assert_eq!(databases, HashSet::from(["orders", "billing"]));
    assert_eq!(
        monitor.find_session(sessions[0].id()).unwrap().id(),
        sessions[0].id()
    );
}

#[tokio::test]
async fn test_sessions_refresh_once_in_background() {
    let (_l, port) = listener().await;
    let connection = Arc::new(standalone("orders", vec![process(1, "select 1 from dual")]));
    let monitor = monitor();
    monitor
        .register_data_source(mysql_source("orders", port, connection.clone()))
        .await
        .unwrap();

    let first = monitor.sessions().await;
    let second = monitor.sessions().await;
    assert!(first.is_empty() && second.is_empty());

    let mut published = monitor.sessions().await;
    for _ in 0..200 {
        if !published.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        published = monitor.sessions().await;
    }

    assert_eq!(published.len(), 1);
    assert_eq!(connection.calls_matching("processlist"), 1);
}

#[tokio::test]
async fn test_hanging_database_is_left_pending() {
    let (_a, port_a) = listener().await;
    let (_b, port_b) = listener().await;
    let monitor = monitor_with(MonitorConfig::default().with_aggregate_wait(Duration::from_millis(200)));
    let orders = Arc::new(standalone("orders", vec![process(1, "select * from orders")]));
    let stuck = Arc::new(
        MemoryConnection::new("stuck")
            .on("wsrep_cluster_members", table_not_found())
            .on("processlist", Scripted::Hang),
    );
    monitor
        .register_data_source(mysql_source("orders", port_a, orders))
        .await
        .unwrap();
    monitor
        .register_data_source(mysql_source("stuck", port_b, stuck))
        .await
        .unwrap();

    let sessions = monitor.refresh_sessions().await;

    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].database_id(), "orders");
}

#[tokio::test]
async fn test_hanging_database_does_not_starve_the_pool() {
    let (_a, port_a) = listener().await;
    let (_b, port_b) = listener().await;
    let monitor = monitor_with(
        MonitorConfig::default()
            .with_max_concurrency(2)
            .with_aggregate_wait(Duration::from_millis(100)),
    );
    let orders = Arc::new(standalone("orders", vec![process(1, "select * from orders")]));
    let stuck = Arc::new(
        MemoryConnection::new("stuck")
            .on("wsrep_cluster_members", table_not_found())
            .on("processlist", Scripted::Hang),
    );
    monitor
        .register_data_source(mysql_source("orders", port_a, orders))
        .await
        .unwrap();
    monitor
        .register_data_source(mysql_source("stuck", port_b, stuck))
        .await
        .unwrap();

    let mut counts = Vec::new();
    for _ in 0..6 {
        counts.push(monitor.refresh_sessions().await.len());
    }

    assert_eq!(counts, vec![1; 6]);
}

#[tokio::test]
async fn test_session_statements_are_interned() {
    let (_a, port_a) = listener().await;
    let (_b, port_b) = listener().await;
    let monitor = monitor();
    let orders = Arc::new(standalone("orders", vec![process(1, "select * from orders")]));
    let replica = Arc::new(standalone(
        "replica",
        vec![process(2, "/* retry */ select * from orders  ")],
    ));
    monitor
        .register_data_source(mysql_source("orders", port_a, orders))
        .await
        .unwrap();
    monitor
        .register_data_source(mysql_source("replica", port_b, replica))
        .await
        .unwrap();

    let sessions = monitor.refresh_sessions().await;

    assert_eq!(sessions.len(), 2);
    let a = sessions[0].statement().unwrap();
    let b = sessions[1].statement().unwrap();
    assert!(Arc::ptr_eq(a, b));
    let stored = monitor.get_statement(a.id()).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&stored, a));
}

#[tokio::test]
async fn test_transactions_use_their_own_cache() {
    let (_a, port_a) = listener().await;
    let monitor = monitor();
    let orders = Arc::new(standalone("orders", vec![process(1, "select * from orders")]));
    monitor
        .register_data_source(mysql_source("orders", port_a, orders))
        .await
        .unwrap();

    let transactions = monitor.refresh_transactions().await;

    assert!(transactions.is_empty());
    assert!(monitor.find_transaction("orders_1").is_none());
    assert!(monitor.find_session("orders_1").is_none());
}

// =============================================================================
// Snapshot Tests
// =============================================================================

#[tokio::test]
async fn test_snapshots_flag_failed_captures() {
    let (_a, port_a) = listener().await;
    let (_v, port_v) = listener().await;
    let monitor = monitor();
    let orders = Arc::new(standalone("orders", vec![process(1, "select * from orders")]));
    monitor
        .register_data_source(mysql_source("orders", port_a, orders))
        .await
        .unwrap();
    monitor.register_data_source(failing_vertica(port_v)).await.unwrap();

    let orders = monitor.snapshot("orders").await.unwrap();
    assert!(!orders.is_incomplete());
    assert_eq!(orders.nodes().len(), 1);
    assert_eq!(orders.nodes()[0].id, "orders");
    assert_eq!(orders.session_counts().total(), 1);
    assert!(orders.database().is_some());

    let analytics = monitor.snapshot("analytics").await.unwrap();
    assert!(analytics.is_incomplete());
    assert_eq!(analytics.nodes().len(), 1);
    assert!(analytics.sessions().is_empty());

    let all = monitor.snapshots().await;
    assert_eq!(all.len(), 2);
    assert_eq!(all.iter().filter(|s| s.is_incomplete()).count(), 1);
    assert!(monitor.snapshot("missing").await.is_err());
}

#[tokio::test]
async fn test_snapshot_transactions_are_interned() {
    let (_v, port_v) = listener().await;
    let monitor = monitor();
    let connection = MemoryConnection::new("analytics")
        .on(
            "v_catalog.nodes",
            Scripted::Rows(vec![
                Row::new()
                    .with("node_id", "45035996273704980")
                    .with("node_name", "v_analytics_node0001")
                    .with("node_state", "UP")
                    .with("export_address", format!("127.0.0.1:{port_v}")),
            ]),
        )
        .on(
            "v_monitor.transactions",
            Scripted::Rows(vec![
                Row::new()
                    .with("transaction_id", "45035996273705001")
                    .with("node_name", "v_analytics_node0001")
                    .with("user_name", "etl")
                    .with("description", "COPY events FROM STDIN"),
            ]),
        )
        .on("v_monitor.sessions", Scripted::Rows(vec![]));
    let ds = DataSource::new(
        "analytics",
        "Analytics",
        &format!("vertica://dbadmin@127.0.0.1:{port_v}/analytics"),
    )
    .unwrap()
    .with_connection(Arc::new(connection));
    monitor.register_data_source(ds).await.unwrap();
    let canonical = monitor
        .register_statement(Arc::new(Statement::new("COPY events FROM STDIN", "etl").unwrap()))
        .await
        .unwrap();

    let snapshot = monitor.snapshot("analytics").await.unwrap();

    assert!(!snapshot.is_incomplete());
    assert_eq!(snapshot.transactions().len(), 1);
    let statement = snapshot.transactions()[0].statement().unwrap();
    assert!(Arc::ptr_eq(statement, &canonical));
}
