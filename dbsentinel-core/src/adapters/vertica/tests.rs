//! Unit tests for the Vertica adapter.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};

use crate::adapters::{DatabaseContext, EngineAdapter};
use crate::config::MonitorConfig;
use crate::connection::memory::{MemoryConnection, MemoryConnectionFactory, Scripted};
use crate::connection::{Row, Value};
use crate::datasource::DataSource;
use crate::metrics::Metrics;
use crate::models::{IsolationLevel, NodeState, SessionState};
use crate::registry::DataSourceRegistry;
use crate::statement::StatementType;

use super::{VerticaAdapter, has_valid_transaction};

fn context(primary: Arc<MemoryConnection>) -> DatabaseContext {
    let ds = DataSource::new("analytics", "Analytics", "vertica://dbadmin:pw@vnode1.prod:5433/analytics")
        .unwrap()
        .with_connection(primary);
    DatabaseContext::new(
        ds,
        Arc::new(MonitorConfig::default()),
        Arc::new(MemoryConnectionFactory::new()),
        Arc::new(DataSourceRegistry::new()),
        Metrics::detached("Vertica"),
    )
}

fn catalog() -> Scripted {
    Scripted::Rows(vec![
        Row::new()
            .with("node_id", "45035996273704980")
            .with("node_name", "v_analytics_node0001")
            .with("node_state", "UP")
            .with("export_address", "localhost"),
        Row::new()
            .with("node_id", "45035996273719008")
            .with("node_name", "v_analytics_node0002")
            .with("node_state", "SHUTDOWN")
            .with("export_address", "10.1.0.2"),
        Row::new()
            .with("node_id", "45035996273719012")
            .with("node_name", "v_analytics_node0003")
            .with("node_state", "STANDBY")
            .with("export_address", "10.1.0.3:5434"),
    ])
}

// =============================================================================
// Node Discovery Tests
// =============================================================================

#[tokio::test]
async fn test_nodes_from_catalog() {
    let primary = Arc::new(MemoryConnection::new("vnode1").on("v_catalog.nodes", catalog()));
    let ctx = context(primary);

    let nodes = VerticaAdapter::new().extract_nodes(&ctx).await.unwrap();

    assert_eq!(nodes.len(), 3);
    assert_eq!(nodes[0].data_source().hostname(), "vnode1.prod");
    assert_eq!(nodes[0].reported_state(), NodeState::Up);
    assert_eq!(nodes[1].reported_state(), NodeState::Unknown);
    assert_eq!(nodes[1].data_source().port(), Some(5433));
    assert_eq!(nodes[2].reported_state(), NodeState::Standby);
    assert_eq!(nodes[2].data_source().port(), Some(5434));
    assert_eq!(nodes[2].data_source().id(), "analytics_10_1_0_3");
}

// =============================================================================
// Session Tests
// =============================================================================

#[test]
fn test_valid_transaction_ids() {
    assert!(has_valid_transaction(Some("45035996273705001")));
    assert!(!has_valid_transaction(Some("0")));
    assert!(!has_valid_transaction(Some("-1")));
    assert!(!has_valid_transaction(Some("")));
    assert!(!has_valid_transaction(None));
}

#[tokio::test]
async fn test_sessions_attributed_by_node_name() {
    let started = Utc::now().checked_sub_signed(ChronoDuration::seconds(30)).unwrap();
    let primary = Arc::new(
        MemoryConnection::new("vnode1")
            .on("v_catalog.nodes", catalog())
            .on(
                "v_monitor.sessions",
                Scripted::Rows(vec![
                    Row::new()
                        .with("session_id", "vnode1-1:0x2a")
                        .with("node_name", "v_analytics_node0001")
                        .with("user_name", "etl")
                        .with("client_hostname", "10.9.0.4:50122")
                        .with("transaction_id", "45035996273705001")
                        .with("statement_start", started)
                        .with("current_statement", Value::Null)
                        .with("last_statement", "COPY events FROM STDIN"),
                    Row::new()
                        .with("session_id", "vnode1-1:0x2b")
                        .with("node_name", "v_analytics_node0003")
                        .with("user_name", "bi")
                        .with("transaction_id", "-1")
                        .with("last_statement", "SELECT 1"),
                    Row::new()
                        .with("session_id", "vnode9-1:0x1")
                        .with("node_name", "v_analytics_node0009")
                        .with("user_name", "bi"),
                ]),
            ),
    );
    let ctx = context(primary);
    let adapter = VerticaAdapter::new();
    adapter.extract_nodes(&ctx).await.unwrap();

    let sessions = adapter.extract_sessions(&ctx, &[]).await.unwrap();

    assert_eq!(sessions.len(), 2);
    let active = &sessions[0];
    assert_eq!(active.node_id(), "45035996273704980");
    assert_eq!(active.state(), SessionState::Active);
    assert_eq!(active.schema(), Some("etl"));
    assert_eq!(active.client_hostname(), Some("10.9.0.4"));
    assert!(active.elapsed().as_secs() >= 29);
    let statement = active.statement().unwrap();
    assert_eq!(statement.statement_type(), StatementType::Load);

    let idle = &sessions[1];
    assert_eq!(idle.state(), SessionState::Inactive);
    assert!(idle.statement().is_none());
    assert!(idle.transaction_id().is_none());
}

#[tokio::test]
async fn test_transactions_join_sessions() {
    let started = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let primary = Arc::new(
        MemoryConnection::new("vnode1")
            .on("v_catalog.nodes", catalog())
            .on(
                "v_monitor.transactions",
                Scripted::Rows(vec![
                    Row::new()
                        .with("transaction_id", "45035996273705001")
                        .with("node_name", "v_analytics_node0002")
                        .with("user_name", "etl")
                        .with("description", "COPY events FROM STDIN")
                        .with("isolation", "SERIALIZABLE")
                        .with("is_read_only", false)
                        .with("start_timestamp", started),
                ]),
            ),
    );
    let ctx = context(primary);
    let adapter = VerticaAdapter::new();
    adapter.extract_nodes(&ctx).await.unwrap();

    let transactions = adapter.extract_transactions(&ctx, &[]).await.unwrap();

    assert_eq!(transactions.len(), 1);
    let transaction = &transactions[0];
    assert_eq!(transaction.node_id(), "45035996273719008");
    assert_eq!(transaction.isolation_level(), IsolationLevel::Serializable);
    assert_eq!(transaction.started_at(), Some(started));
    assert!(!transaction.is_read_only());
    assert!(transaction.statement().is_some());
}

// =============================================================================
// Statement History Tests
// =============================================================================

#[tokio::test]
async fn test_statements_carry_statistics() {
    let executed = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
    let primary = Arc::new(MemoryConnection::new("vnode1").on(
        "v_monitor.query_requests",
        Scripted::Rows(vec![
            Row::new()
                .with("request", "select count(*) from events")
                .with("user_name", "bi")
                .with("request_cnt", 4_i64)
                .with("total_request_duration_ms", 1000_i64)
                .with("min_request_duration_ms", 100.0)
                .with("max_request_duration_ms", 400.0)
                .with("max_start_timestamp", executed),
            Row::new().with("request", "   ").with("user_name", "bi"),
        ]),
    ));
    let ctx = context(primary.clone());
    let start = executed.checked_sub_signed(ChronoDuration::hours(1)).unwrap();

    let statements = VerticaAdapter::new()
        .extract_statements(&ctx, start, executed)
        .await
        .unwrap();

    assert_eq!(statements.len(), 1);
    let statistics = statements[0].statistics().unwrap();
    assert_eq!(statistics.count, 4);
    assert_eq!(statistics.total.as_millis(), 1000);
    assert_eq!(statistics.average().as_millis(), 250);
    assert_eq!(statistics.max.as_millis(), 400);
    assert_eq!(statements[0].execution_time(), Some(executed));
    assert_eq!(primary.calls_matching("query_requests"), 1);
}
