//! `SQLite` Driver Implementation
//!
//! This module implements the [`Driver`] trait for `SQLite` databases.
//!
//! # Features
//! - File-based connections (`/path/to/db.sqlite`, `sqlite:///path`)
//! - In-memory connections (`:memory:`)
//! - Schema introspection via `sqlite_master` and PRAGMAs
//! - Cancellation through the connection's interrupt handle
//!
//! # Implementation Notes
//! - Uses `rusqlite` (synchronous driver); every call runs on `spawn_blocking`
//! - BLOB data is Base64-encoded for JSON safety
//! - No schema support: `list_schemas` is empty and the schema argument is ignored

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, Row};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::engine::{
    page_window, paginate_sql, ColumnInfo, ConnectionConfig, DatabaseType, Driver, IndexInfo,
    PageStyle, QueryResult, ResultRow, TableInfo,
};
use crate::error::{QuarryError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// `SQLite` driver holding one file handle
#[derive(Default)]
pub struct SqliteDriver {
    conn: Arc<Mutex<Option<Connection>>>,
    interrupt: Mutex<Option<rusqlite::InterruptHandle>>,
    connected: AtomicBool,
    running: Arc<AtomicBool>,
}

impl SqliteDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the open connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let conn = guard
                .as_ref()
                .ok_or_else(|| QuarryError::connection_failed("SQLite database is not connected"))?;
            f(conn)
        })
        .await
        .map_err(|e| QuarryError::engine_error("sqlite", format!("Worker task failed: {e}")))?
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn engine(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<()> {
        if config.engine != DatabaseType::SQLite {
            return Err(QuarryError::invalid_input(format!(
                "Expected SQLite engine, got {}",
                config.engine
            )));
        }

        let path = match (&config.file_path, &config.connection_string) {
            (Some(path), _) => path.clone(),
            (None, Some(s)) => parse_sqlite_path(s)?,
            (None, None) => {
                return Err(QuarryError::invalid_input("SQLite requires 'file_path' parameter"))
            }
        };

        let conn = tokio::task::spawn_blocking(move || open_connection(&path))
            .await
            .map_err(|e| QuarryError::engine_error("sqlite", format!("Worker task failed: {e}")))??;

        *self.interrupt.lock() = Some(conn.get_interrupt_handle());
        *self.conn.lock() = Some(conn);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.interrupt.lock().take() {
            handle.interrupt();
        }

        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || match conn.lock().take() {
            Some(c) => c.close().map_err(|(_, e)| {
                QuarryError::engine_error("sqlite", format!("Failed to close database: {e}"))
            }),
            None => Ok(()),
        })
        .await
        .map_err(|e| QuarryError::engine_error("sqlite", format!("Worker task failed: {e}")))?
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("PRAGMA database_list").map_err(map_sqlite_error)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))
                .map_err(map_sqlite_error)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_sqlite_error)?;
            Ok(names)
        })
        .await
    }

    async fn list_schemas(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master
                     WHERE type = 'table'
                     AND name NOT LIKE 'sqlite_%'
                     ORDER BY name",
                )
                .map_err(map_sqlite_error)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(map_sqlite_error)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_sqlite_error)?;
            Ok(names)
        })
        .await
    }

    async fn get_table_info(&self, table: &str, _schema: Option<&str>) -> Result<TableInfo> {
        let table = table.to_string();
        self.with_conn(move |conn| introspect_table(conn, &table)).await
    }

    async fn execute_query(
        &self,
        sql: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<QueryResult> {
        let (limit, offset) = page_window(limit, offset);
        let sql = sql.to_string();
        let running = Arc::clone(&self.running);

        running.store(true, Ordering::SeqCst);
        let result = self.with_conn(move |conn| run_statement(conn, &sql, limit, offset)).await;
        running.store(false, Ordering::SeqCst);
        result
    }

    async fn cancel_query(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.interrupt.lock().as_ref() {
            debug!("interrupting running SQLite statement");
            handle.interrupt();
        }
        Ok(())
    }

    fn parse_connection_string(&self, input: &str) -> Result<ConnectionConfig> {
        let path = parse_sqlite_path(input)?;
        Ok(ConnectionConfig::sqlite(path))
    }
}

/// Accept `sqlite:///abs/path`, `sqlite:relative`, `file:path` or a bare path
fn parse_sqlite_path(input: &str) -> Result<PathBuf> {
    let trimmed = input.trim();
    let path = ["sqlite://", "sqlite:", "file://", "file:"]
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))
        .unwrap_or(trimmed);

    if path.is_empty() {
        return Err(QuarryError::invalid_input("SQLite connection string has no file path"));
    }
    Ok(PathBuf::from(path))
}

/// Open `SQLite` connection read-write, creating the file if needed
fn open_connection(path: &std::path::Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    let conn = Connection::open_with_flags(path, flags).map_err(|e| {
        QuarryError::connection_failed(format!("Failed to open SQLite database: {e}"))
    })?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| QuarryError::engine_error("sqlite", format!("Failed to set timeout: {e}")))?;
    conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0)).map_err(|e| {
        QuarryError::connection_failed(format!("Failed to query SQLite version: {e}"))
    })?;
    Ok(conn)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Introspect a single table and return `TableInfo`
fn introspect_table(conn: &Connection, table_name: &str) -> Result<TableInfo> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
            [table_name],
            |row| row.get(0),
        )
        .map_err(map_sqlite_error)?;
    if !exists {
        return Err(QuarryError::not_found(format!("no such table: {table_name}")));
    }

    let quoted = quote_ident(table_name);

    // PRAGMA table_info: cid, name, type, notnull, dflt_value, pk
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({quoted})")).map_err(|e| {
        QuarryError::engine_error("sqlite", format!("Failed to prepare table_info for {table_name}: {e}"))
    })?;
    let columns: Vec<ColumnInfo> = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get::<_, String>(1)?,
                data_type: row.get::<_, String>(2)?,
                nullable: row.get::<_, i32>(3)? == 0,
                default: row.get::<_, Option<String>>(4)?,
                primary_key: row.get::<_, i32>(5)? > 0,
            })
        })
        .and_then(Iterator::collect)
        .map_err(|e| {
            QuarryError::engine_error("sqlite", format!("Failed to query columns for {table_name}: {e}"))
        })?;

    let mut idx_stmt = conn.prepare(&format!("PRAGMA index_list({quoted})")).map_err(|e| {
        QuarryError::engine_error("sqlite", format!("Failed to prepare index_list for {table_name}: {e}"))
    })?;
    let index_list: Vec<(String, bool)> = idx_stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i32>(2)? != 0)))
        .and_then(Iterator::collect)
        .map_err(|e| {
            QuarryError::engine_error("sqlite", format!("Failed to query indexes for {table_name}: {e}"))
        })?;

    let mut indexes = Vec::new();
    for (index_name, unique) in index_list {
        // Skip auto-created indexes for primary keys and UNIQUE constraints
        if index_name.starts_with("sqlite_autoindex_") {
            continue;
        }

        let mut info_stmt = conn
            .prepare(&format!("PRAGMA index_info({})", quote_ident(&index_name)))
            .map_err(map_sqlite_error)?;
        let index_columns: Vec<String> = info_stmt
            .query_map([], |row| row.get::<_, Option<String>>(2))
            .map_err(map_sqlite_error)?
            .filter_map(std::result::Result::ok)
            .flatten()
            .collect();

        indexes.push(IndexInfo { name: index_name, columns: index_columns, unique });
    }

    let row_count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {quoted}"), [], |row| row.get(0))
        .map_err(map_sqlite_error)?;

    Ok(TableInfo {
        name: table_name.to_string(),
        schema: None,
        columns,
        indexes,
        row_count: u64::try_from(row_count).ok(),
    })
}

/// Execute one statement with the page window applied
fn run_statement(conn: &Connection, sql: &str, limit: usize, offset: usize) -> Result<QueryResult> {
    let start = Instant::now();

    // Wrapped statements page in the engine; others are capped while stepping
    let paged = paginate_sql(sql, limit, offset, PageStyle::Subquery);
    let (text, skip) = match &paged {
        Some(wrapped) => (wrapped.as_str(), 0),
        None => (sql, offset),
    };

    let mut stmt = conn.prepare(text).map_err(map_sqlite_error)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();

    if column_names.is_empty() {
        let affected = stmt.execute([]).map_err(map_sqlite_error)?;
        return Ok(QueryResult::affected(affected as u64, elapsed_ms(start)));
    }

    let mut rows = stmt.query([]).map_err(map_sqlite_error)?;
    let mut rows_data = Vec::new();
    let mut skipped = 0;
    while let Some(row) = rows.next().map_err(map_sqlite_error)? {
        if skipped < skip {
            skipped += 1;
            continue;
        }
        if rows_data.len() >= limit {
            break;
        }
        rows_data.push(row_to_json(&column_names, row).map_err(map_sqlite_error)?);
    }

    Ok(QueryResult::with_rows(column_names, rows_data, elapsed_ms(start)))
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Map rusqlite errors onto the driver error taxonomy
fn map_sqlite_error(e: rusqlite::Error) -> QuarryError {
    if let rusqlite::Error::SqliteFailure(ref failure, _) = e {
        if failure.code == rusqlite::ErrorCode::OperationInterrupted {
            return QuarryError::cancelled("SQLite statement was interrupted");
        }
    }
    let text = e.to_string();
    if text.contains("no such table") {
        QuarryError::not_found(text)
    } else {
        QuarryError::query_failed(text)
    }
}

/// Convert a `SQLite` row to a column-keyed map
fn row_to_json(
    column_names: &[String],
    row: &Row,
) -> std::result::Result<ResultRow, rusqlite::Error> {
    let mut values = ResultRow::with_capacity(column_names.len());
    for (idx, name) in column_names.iter().enumerate() {
        values.insert(name.clone(), sqlite_value_to_json(row, idx)?);
    }
    Ok(values)
}

/// Convert `SQLite` value to JSON value
fn sqlite_value_to_json(
    row: &Row,
    idx: usize,
) -> std::result::Result<serde_json::Value, rusqlite::Error> {
    use rusqlite::types::ValueRef;

    Ok(match row.get_ref(idx)? {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number), // NaN/Infinity as null
        ValueRef::Text(s) => {
            let text = std::str::from_utf8(s).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
            })?;
            serde_json::Value::String(text.to_string())
        }
        ValueRef::Blob(b) => {
            use base64::Engine;
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU64;

    fn temp_db_path(tag: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir()
            .join(format!("quarry_sqlite_{tag}_{}_{id}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn connected(path: &std::path::Path) -> SqliteDriver {
        let driver = SqliteDriver::new();
        driver.connect(&ConnectionConfig::sqlite(path)).await.expect("connect");
        driver
    }

    #[tokio::test]
    async fn test_connect_memory_and_disconnect() {
        let driver = SqliteDriver::new();
        assert!(!driver.is_connected());
        driver.connect(&ConnectionConfig::sqlite(":memory:")).await.unwrap();
        assert!(driver.is_connected());
        assert_eq!(driver.list_databases().await.unwrap(), vec!["main".to_string()]);
        assert!(driver.list_schemas().await.unwrap().is_empty());

        driver.disconnect().await.unwrap();
        assert!(!driver.is_connected());
        // Second disconnect is harmless
        driver.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_wrong_engine() {
        let mut config = ConnectionConfig::sqlite(":memory:");
        config.engine = DatabaseType::Postgres;
        let err = SqliteDriver::new().connect(&config).await.unwrap_err();
        assert!(err.message().contains("Expected SQLite engine"));
    }

    #[tokio::test]
    async fn test_connect_missing_file_path() {
        let config = ConnectionConfig::new(DatabaseType::SQLite);
        let err = SqliteDriver::new().connect(&config).await.unwrap_err();
        assert!(err.message().contains("SQLite requires 'file_path' parameter"));
    }

    #[tokio::test]
    async fn test_queries_fail_when_not_connected() {
        let err = SqliteDriver::new().execute_query("SELECT 1", None, None).await.unwrap_err();
        assert_eq!(err.error_code(), "CONNECTION_FAILED");
    }

    #[tokio::test]
    async fn test_table_info_with_keys_and_indexes() {
        let path = temp_db_path("info");
        let driver = connected(&path).await;
        driver
            .execute_query(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL, name TEXT DEFAULT 'anon')",
                None,
                None,
            )
            .await
            .unwrap();
        driver.execute_query("CREATE UNIQUE INDEX idx_users_email ON users (email)", None, None).await.unwrap();
        driver.execute_query("INSERT INTO users (email) VALUES ('a@x.io')", None, None).await.unwrap();

        assert_eq!(driver.list_tables(None).await.unwrap(), vec!["users".to_string()]);

        let info = driver.get_table_info("users", None).await.unwrap();
        assert_eq!(info.name, "users");
        assert_eq!(info.primary_key(), vec!["id"]);
        assert_eq!(info.row_count, Some(1));
        let email = info.columns.iter().find(|c| c.name == "email").unwrap();
        assert!(!email.nullable);
        let name = info.columns.iter().find(|c| c.name == "name").unwrap();
        assert_eq!(name.default.as_deref(), Some("'anon'"));
        assert_eq!(
            info.indexes,
            vec![IndexInfo {
                name: "idx_users_email".to_string(),
                columns: vec!["email".to_string()],
                unique: true
            }]
        );

        driver.disconnect().await.unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_unknown_table_is_not_found() {
        let driver = connected(std::path::Path::new(":memory:")).await;
        let err = driver.get_table_info("missing", None).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");

        let err = driver.execute_query("SELECT * FROM missing", None, None).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_syntax_error_passes_engine_text_through() {
        let driver = connected(std::path::Path::new(":memory:")).await;
        let err = driver.execute_query("SELEC 1", None, None).await.unwrap_err();
        assert_eq!(err.error_code(), "QUERY_FAILED");
        assert!(err.message().contains("syntax error"));
    }

    #[tokio::test]
    async fn test_pagination_limit_and_offset() {
        let driver = connected(std::path::Path::new(":memory:")).await;
        driver.execute_query("CREATE TABLE n (v INTEGER)", None, None).await.unwrap();
        for v in 1..=100 {
            driver.execute_query(&format!("INSERT INTO n (v) VALUES ({v})"), None, None).await.unwrap();
        }

        let page = driver.execute_query("SELECT v FROM n ORDER BY v", Some(5), None).await.unwrap();
        assert_eq!(page.rows.len(), 5);
        assert_eq!(page.row_count, 5);

        let page = driver.execute_query("SELECT v FROM n ORDER BY v;", Some(3), Some(10)).await.unwrap();
        let values: Vec<_> = page.rows.iter().map(|r| r["v"].clone()).collect();
        assert_eq!(values, vec![serde_json::json!(11), serde_json::json!(12), serde_json::json!(13)]);

        let all = driver.execute_query("SELECT v FROM n", None, None).await.unwrap();
        assert_eq!(all.row_count, 100);
    }

    #[tokio::test]
    async fn test_pragma_is_capped_while_streaming() {
        let driver = connected(std::path::Path::new(":memory:")).await;
        driver.execute_query("CREATE TABLE wide (a INT, b INT, c INT, d INT)", None, None).await.unwrap();
        let result = driver.execute_query("PRAGMA table_info(wide)", Some(2), Some(1)).await.unwrap();
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[0]["name"], serde_json::json!("b"));
    }

    #[tokio::test]
    async fn test_write_reports_rows_affected() {
        let driver = connected(std::path::Path::new(":memory:")).await;
        driver.execute_query("CREATE TABLE t (v INTEGER)", None, None).await.unwrap();
        let result = driver.execute_query("INSERT INTO t VALUES (1), (2), (3)", None, None).await.unwrap();
        assert_eq!(result.rows_affected, Some(3));
        assert!(result.columns.is_empty());
    }

    #[tokio::test]
    async fn test_value_conversion() {
        let driver = connected(std::path::Path::new(":memory:")).await;
        let result = driver
            .execute_query("SELECT 1 AS i, 2.5 AS r, 'hé' AS t, NULL AS n, x'DEADBEEF' AS b", None, None)
            .await
            .unwrap();
        let row = &result.rows[0];
        assert_eq!(result.columns, vec!["i", "r", "t", "n", "b"]);
        assert_eq!(row["i"], serde_json::json!(1));
        assert_eq!(row["r"], serde_json::json!(2.5));
        assert_eq!(row["t"], serde_json::json!("hé"));
        assert_eq!(row["n"], serde_json::Value::Null);
        assert_eq!(row["b"], serde_json::json!("3q2+7w=="));
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_noop() {
        let driver = connected(std::path::Path::new(":memory:")).await;
        driver.cancel_query().await.unwrap();
        let result = driver.execute_query("SELECT 1 AS one", None, None).await.unwrap();
        assert_eq!(result.row_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_interrupts_running_query() {
        let driver = Arc::new(connected(std::path::Path::new(":memory:")).await);
        let runner = Arc::clone(&driver);
        let task = tokio::spawn(async move {
            runner
                .execute_query(
                    "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT COUNT(*) FROM c",
                    None,
                    None,
                )
                .await
        });

        let outcome = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                driver.cancel_query().await.unwrap();
                if task.is_finished() {
                    break task.await.unwrap();
                }
            }
        })
        .await
        .expect("query was not interrupted");

        assert_eq!(outcome.unwrap_err().error_code(), "CANCELLED");

        // The driver stays usable
        let result = driver.execute_query("SELECT 42 AS answer", None, None).await.unwrap();
        assert_eq!(result.rows[0]["answer"], serde_json::json!(42));
    }

    #[test]
    fn test_parse_connection_string() {
        let driver = SqliteDriver::new();
        let config = driver.parse_connection_string("sqlite:///var/data/app.db").unwrap();
        assert_eq!(config.file_path, Some(PathBuf::from("/var/data/app.db")));
        let config = driver.parse_connection_string("./local.db").unwrap();
        assert_eq!(config.file_path, Some(PathBuf::from("./local.db")));
        assert!(driver.parse_connection_string("sqlite://").is_err());
        assert_eq!(driver.default_port(), None);
    }
}
