//! Connection Manager Tests
//!
//! Exercises the registry with hand-written fake drivers so connect/replace/teardown
//! ordering can be observed without a database server.

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use quarry::connection::{ConnectionManager, DriverFactory};
use quarry::engine::{ConnectionConfig, DatabaseType, Driver, QueryResult, ResultRow, TableInfo};
use quarry::error::{QuarryError, Result};

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeDriver {
    connected: AtomicBool,
    fail_disconnect: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

#[async_trait]
impl Driver for FakeDriver {
    fn engine(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        // Yield so concurrent connects on one id would interleave without the id lock
        tokio::task::yield_now().await;
        match config.database.as_deref() {
            Some("fail-connect") => Err(QuarryError::authentication("password authentication failed")),
            Some("fail-disconnect") => {
                self.fail_disconnect.store(true, Ordering::SeqCst);
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            _ => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(QuarryError::network("connection reset by peer"));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(vec!["postgres".to_string()])
    }

    async fn list_schemas(&self) -> Result<Vec<String>> {
        Ok(vec!["public".to_string()])
    }

    async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<String>> {
        Ok(vec![])
    }

    async fn get_table_info(&self, table: &str, _schema: Option<&str>) -> Result<TableInfo> {
        Err(QuarryError::not_found(format!("Table '{table}' not found")))
    }

    async fn execute_query(&self, sql: &str, limit: Option<usize>, _offset: Option<usize>) -> Result<QueryResult> {
        if sql.contains("boom") {
            return Err(QuarryError::query_failed("syntax error at or near \"boom\""));
        }
        let rows: Vec<ResultRow> = (0..limit.unwrap_or(3))
            .map(|i| {
                let mut row = ResultRow::new();
                row.insert("n".to_string(), serde_json::json!(i));
                row
            })
            .collect();
        Ok(QueryResult::with_rows(vec!["n".to_string()], rows, 1))
    }

    async fn cancel_query(&self) -> Result<()> {
        Ok(())
    }

    fn parse_connection_string(&self, _input: &str) -> Result<ConnectionConfig> {
        Ok(ConnectionConfig::new(DatabaseType::Postgres))
    }
}

#[derive(Default)]
struct FakeFactory {
    created: Mutex<Vec<Arc<FakeDriver>>>,
}

impl FakeFactory {
    fn driver(&self, index: usize) -> Arc<FakeDriver> {
        Arc::clone(&self.created.lock()[index])
    }

    fn count(&self) -> usize {
        self.created.lock().len()
    }
}

impl DriverFactory for FakeFactory {
    fn create(&self, engine: DatabaseType) -> Result<Arc<dyn Driver>> {
        if engine == DatabaseType::Mssql {
            return Err(QuarryError::unsupported_engine("MSSQL support is not compiled into this build"));
        }
        let driver = Arc::new(FakeDriver::default());
        self.created.lock().push(Arc::clone(&driver));
        Ok(driver)
    }
}

fn config(database: &str) -> ConnectionConfig {
    ConnectionConfig::network(DatabaseType::Postgres, "localhost", 5432, "app", "pw", database)
}

fn manager() -> (Arc<FakeFactory>, ConnectionManager) {
    let factory = Arc::new(FakeFactory::default());
    let manager = ConnectionManager::new(Arc::clone(&factory) as Arc<dyn DriverFactory>);
    (factory, manager)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_reconnect_replaces_and_disconnects_live_driver() {
    let (factory, manager) = manager();
    manager.connect("main", &config("shop")).await.unwrap();
    manager.connect("main", &config("shop")).await.unwrap();

    assert_eq!(factory.count(), 2);
    assert_eq!(manager.connection_ids(), vec!["main"]);
    assert_eq!(factory.driver(0).disconnects.load(Ordering::SeqCst), 1);
    assert!(!factory.driver(0).is_connected());
    assert!(factory.driver(1).is_connected());
    assert!(manager.is_connected("main"));
}

#[tokio::test]
async fn test_reconnect_skips_disconnect_of_dead_driver() {
    let (factory, manager) = manager();
    manager.connect("main", &config("shop")).await.unwrap();
    factory.driver(0).connected.store(false, Ordering::SeqCst);

    manager.connect("main", &config("shop")).await.unwrap();
    assert_eq!(factory.driver(0).disconnects.load(Ordering::SeqCst), 0);
    assert_eq!(manager.connection_ids(), vec!["main"]);
}

#[tokio::test]
async fn test_failed_connect_cleans_up_and_leaves_id_unmapped() {
    let (factory, manager) = manager();
    let err = manager.connect("main", &config("fail-connect")).await.unwrap_err();

    assert_eq!(err.error_code(), "AUTHENTICATION_FAILED");
    assert!(manager.get_driver("main").is_none());
    assert_eq!(factory.driver(0).disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_reconnect_drops_previous_mapping() {
    let (factory, manager) = manager();
    manager.connect("main", &config("shop")).await.unwrap();
    assert!(manager.connect("main", &config("fail-connect")).await.is_err());

    assert!(manager.connection_ids().is_empty());
    assert_eq!(factory.driver(0).disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_connects_on_one_id_leave_one_driver() {
    let (factory, manager) = manager();
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connect("shared", &config("shop")).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(factory.count(), 10);
    assert_eq!(manager.connection_ids(), vec!["shared"]);
    let live = (0..10).filter(|&i| factory.driver(i).is_connected()).count();
    assert_eq!(live, 1);
    let disconnects: usize = (0..10).map(|i| factory.driver(i).disconnects.load(Ordering::SeqCst)).sum();
    assert_eq!(disconnects, 9);
}

#[tokio::test]
async fn test_disconnect_all_settles_despite_failures() {
    let (factory, manager) = manager();
    manager.connect("a", &config("shop")).await.unwrap();
    manager.connect("b", &config("fail-disconnect")).await.unwrap();
    manager.connect("c", &config("shop")).await.unwrap();

    manager.disconnect_all().await;

    assert!(manager.connection_ids().is_empty());
    for i in 0..3 {
        assert_eq!(factory.driver(i).disconnects.load(Ordering::SeqCst), 1);
    }
    // Idempotent on an empty registry
    manager.disconnect_all().await;
}

#[tokio::test]
async fn test_disconnect_reports_driver_error_but_unmaps() {
    let (_factory, manager) = manager();
    manager.connect("b", &config("fail-disconnect")).await.unwrap();

    let err = manager.disconnect("b").await.unwrap_err();
    assert_eq!(err.error_code(), "NETWORK_ERROR");
    assert!(manager.get_driver("b").is_none());
    manager.disconnect("b").await.unwrap();
}

#[tokio::test]
async fn test_execute_query_folds_errors_into_result() {
    let (_factory, manager) = manager();
    manager.connect("main", &config("shop")).await.unwrap();

    let result = manager.execute_query("main", "SELECT n", Some(5), None).await;
    assert!(result.is_ok());
    assert_eq!(result.row_count, 5);
    assert_eq!(result.rows.len(), 5);

    let failed = manager.execute_query("main", "SELECT boom", None, None).await;
    assert!(failed.error.unwrap().contains("syntax error"));
    assert!(failed.rows.is_empty());

    let missing = manager.execute_query("other", "SELECT 1", None, None).await;
    assert!(missing.error.unwrap().contains("Connection 'other' not found"));
}

#[tokio::test]
async fn test_factory_errors_surface() {
    let (factory, manager) = manager();
    let err = manager
        .connect("sql", &ConnectionConfig::network(DatabaseType::Mssql, "h", 1433, "sa", "pw", "master"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "UNSUPPORTED_ENGINE");
    assert_eq!(factory.count(), 0);

    let err = manager.cancel_query("sql").await.unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
}

#[tokio::test]
async fn test_connection_probe_does_not_register() {
    let (factory, manager) = manager();
    manager.test_connection(&config("shop")).await.unwrap();

    assert!(manager.connection_ids().is_empty());
    assert_eq!(factory.driver(0).disconnects.load(Ordering::SeqCst), 1);
}
