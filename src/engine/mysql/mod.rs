//! `MySQL` Driver Implementation
//!
//! This module implements the [`Driver`] trait for `MySQL` databases (including `MariaDB`).
//!
//! # Features
//! - Client-server connections via a small `mysql_async` pool
//! - Schema introspection via `information_schema`
//! - Cancellation with `KILL QUERY` issued from a second pooled connection
//!
//! # Implementation Notes
//! - Statements run over the text protocol; values are typed from column metadata
//! - Paging appends `LIMIT .. OFFSET`; statements that already bound themselves are capped while streaming
//! - ENUM and SET types converted to strings
//! - JSON type support (`MySQL` 5.7+)
//! - BLOB data is Base64-encoded for JSON safety

use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::{prelude::*, Conn, Opts, OptsBuilder, Pool, Row, Value};
use parking_lot::Mutex;
use std::time::Instant;
use tracing::debug;

use crate::engine::{
    page_window, paginate_sql, parse_url_connection, ColumnInfo, ConnectionConfig, DatabaseType,
    Driver, IndexInfo, PageStyle, QueryResult, ResultRow, TableInfo, CONNECT_TIMEOUT,
};
use crate::error::{QuarryError, Result};

/// Binary collation id reported for BLOB/BINARY columns
const BINARY_CHARSET: u16 = 63;

/// `MySQL` driver backed by a connection pool
#[derive(Default)]
pub struct MySqlDriver {
    pool: Mutex<Option<Pool>>,
    /// Server thread id of the connection running the current statement
    running_conn: Mutex<Option<u32>>,
}

impl MySqlDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self) -> Result<Pool> {
        self.pool
            .lock()
            .clone()
            .ok_or_else(|| QuarryError::connection_failed("MySQL is not connected"))
    }

    async fn conn(&self) -> Result<Conn> {
        let pool = self.pool()?;
        match tokio::time::timeout(CONNECT_TIMEOUT, pool.get_conn()).await {
            Ok(conn) => conn.map_err(map_connect_error),
            Err(_) => Err(QuarryError::network(format!(
                "Timed out connecting to MySQL after {}s",
                CONNECT_TIMEOUT.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl Driver for MySqlDriver {
    fn engine(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<()> {
        if config.engine != DatabaseType::MySQL {
            return Err(QuarryError::invalid_input(format!(
                "Expected MySQL engine, got {}",
                config.engine
            )));
        }

        let pool = Pool::new(build_mysql_opts(config)?);
        *self.pool.lock() = Some(pool);

        // Check out one connection so bad credentials surface now
        let verified = async {
            let mut conn = self.conn().await?;
            let version: Option<String> =
                conn.query_first("SELECT VERSION()").await.map_err(map_connect_error)?;
            debug!(server = %parse_mysql_version(version.as_deref().unwrap_or("unknown")), "mysql connected");
            Ok::<_, QuarryError>(())
        }
        .await;

        if let Err(e) = verified {
            if let Some(pool) = self.pool.lock().take() {
                tokio::spawn(async move {
                    let _ = pool.disconnect().await;
                });
            }
            return Err(e);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.running_conn.lock().take();
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.disconnect()
                .await
                .map_err(|e| QuarryError::engine_error("mysql", format!("Failed to close pool: {e}")))?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.pool.lock().is_some()
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.query::<String, _>("SHOW DATABASES").await.map_err(map_query_error)
    }

    /// `MySQL` schemas and databases are the same namespace
    async fn list_schemas(&self) -> Result<Vec<String>> {
        self.list_databases().await
    }

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let schema = determine_target_schema(&mut conn, schema).await?;
        let query = "SELECT table_name
                     FROM information_schema.tables
                     WHERE table_schema = ?
                     AND table_type = 'BASE TABLE'
                     ORDER BY table_name";
        conn.exec::<String, _, _>(query, (schema,)).await.map_err(map_query_error)
    }

    async fn get_table_info(&self, table: &str, schema: Option<&str>) -> Result<TableInfo> {
        let mut conn = self.conn().await?;
        let schema = determine_target_schema(&mut conn, schema).await?;

        let row_count: Option<Option<u64>> = conn
            .exec_first(
                "SELECT table_rows FROM information_schema.tables WHERE table_schema = ? AND table_name = ?",
                (&schema, table),
            )
            .await
            .map_err(map_query_error)?;
        let Some(row_count) = row_count else {
            return Err(QuarryError::not_found(format!("Table '{schema}.{table}' doesn't exist")));
        };

        let primary_key = introspect_primary_key(&mut conn, &schema, table).await?;
        let mut columns = introspect_columns(&mut conn, &schema, table).await?;
        for column in &mut columns {
            column.primary_key = primary_key.contains(&column.name);
        }
        let indexes = introspect_indexes(&mut conn, &schema, table).await?;

        Ok(TableInfo { name: table.to_string(), schema: Some(schema), columns, indexes, row_count })
    }

    async fn execute_query(
        &self,
        sql: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<QueryResult> {
        let mut conn = self.conn().await?;
        let (limit, offset) = page_window(limit, offset);

        *self.running_conn.lock() = Some(conn.id());
        let result = execute_query(&mut conn, sql, limit, offset).await;
        self.running_conn.lock().take();
        result
    }

    async fn cancel_query(&self) -> Result<()> {
        let Some(thread_id) = *self.running_conn.lock() else {
            return Ok(());
        };
        // The running connection is checked out, so the pool hands us another one
        let mut killer = self.conn().await?;
        killer
            .query_drop(format!("KILL QUERY {thread_id}"))
            .await
            .map_err(|e| QuarryError::engine_error("mysql", format!("Failed to cancel query: {e}")))
    }

    fn parse_connection_string(&self, input: &str) -> Result<ConnectionConfig> {
        let mut config = parse_url_connection(DatabaseType::MySQL, input, &["mysql", "mariadb"])?;
        // mysql_async only understands the mysql:// scheme
        if let Some(s) = config.connection_string.as_mut() {
            if let Some(rest) = s.strip_prefix("mariadb://") {
                *s = format!("mysql://{rest}");
            }
        }
        Ok(config)
    }
}

fn build_mysql_opts(config: &ConnectionConfig) -> Result<Opts> {
    if let Some(url) = &config.connection_string {
        return Opts::from_url(url)
            .map_err(|e| QuarryError::invalid_input(format!("Invalid MySQL connection string: {e}")));
    }

    let host = config
        .host
        .as_ref()
        .ok_or_else(|| QuarryError::invalid_input("MySQL requires 'host' parameter"))?;

    let user = config
        .username
        .as_ref()
        .ok_or_else(|| QuarryError::invalid_input("MySQL requires 'username' parameter"))?;

    let opts = OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(config.port.unwrap_or(3306))
        .user(Some(user))
        .pass(config.password.clone())
        .db_name(config.database.clone().filter(|d| !d.is_empty()));

    Ok(opts.into())
}

/// Parse `MySQL` version string to detect `MySQL` vs `MariaDB`
fn parse_mysql_version(version_string: &str) -> String {
    // Example MySQL: "8.0.35"
    // Example MariaDB: "10.11.2-MariaDB"
    if version_string.to_uppercase().contains("MARIADB") {
        let version = version_string.split('-').next().unwrap_or("unknown");
        format!("MariaDB {version}")
    } else {
        let version = version_string.split_whitespace().next().unwrap_or(version_string);
        format!("MySQL {version}")
    }
}

fn map_connect_error(e: mysql_async::Error) -> QuarryError {
    match e {
        mysql_async::Error::Server(ref server) => match server.code {
            1044 | 1045 | 1698 => QuarryError::authentication(server.message.clone()),
            1049 => QuarryError::not_found(server.message.clone()),
            _ => QuarryError::connection_failed(server.message.clone()),
        },
        mysql_async::Error::Io(io) => QuarryError::network(format!("Failed to connect to MySQL: {io}")),
        other => QuarryError::connection_failed(format!("Failed to connect to MySQL: {other}")),
    }
}

/// Map a statement failure, keeping the server text verbatim
fn map_query_error(e: mysql_async::Error) -> QuarryError {
    match e {
        mysql_async::Error::Server(ref server) => match server.code {
            // ER_QUERY_INTERRUPTED
            1317 => QuarryError::cancelled(server.message.clone()),
            1049 | 1146 => QuarryError::not_found(server.message.clone()),
            _ => QuarryError::query_failed(server.message.clone()),
        },
        mysql_async::Error::Io(io) => QuarryError::network(format!("MySQL connection lost: {io}")),
        other => QuarryError::query_failed(other.to_string()),
    }
}

/// Determine target schema from filter or the session's current database
async fn determine_target_schema(conn: &mut Conn, schema_filter: Option<&str>) -> Result<String> {
    if let Some(schema) = schema_filter.filter(|s| !s.is_empty()) {
        return Ok(schema.to_string());
    }

    let current: Option<Option<String>> =
        conn.query_first("SELECT DATABASE()").await.map_err(map_query_error)?;
    current
        .flatten()
        .ok_or_else(|| QuarryError::invalid_input("No database selected; pass a schema or connect with a database"))
}

/// Introspect table columns
async fn introspect_columns(conn: &mut Conn, schema: &str, table_name: &str) -> Result<Vec<ColumnInfo>> {
    let query = "SELECT column_name, column_type, is_nullable, column_default
                 FROM information_schema.columns
                 WHERE table_schema = ? AND table_name = ?
                 ORDER BY ordinal_position";

    let rows: Vec<(String, String, String, Option<String>)> =
        conn.exec(query, (schema, table_name)).await.map_err(map_query_error)?;

    Ok(rows
        .into_iter()
        .map(|(name, data_type, is_nullable, default)| ColumnInfo {
            name,
            data_type,
            nullable: is_nullable == "YES",
            primary_key: false,
            default,
        })
        .collect())
}

/// Introspect primary key columns in key order
async fn introspect_primary_key(conn: &mut Conn, schema: &str, table_name: &str) -> Result<Vec<String>> {
    let query = "SELECT column_name
                 FROM information_schema.key_column_usage
                 WHERE table_schema = ?
                 AND table_name = ?
                 AND constraint_name = 'PRIMARY'
                 ORDER BY ordinal_position";

    conn.exec::<String, _, _>(query, (schema, table_name)).await.map_err(map_query_error)
}

/// Introspect indexes, grouping `information_schema.statistics` rows by index
async fn introspect_indexes(conn: &mut Conn, schema: &str, table_name: &str) -> Result<Vec<IndexInfo>> {
    let query = "SELECT index_name, non_unique, column_name
                 FROM information_schema.statistics
                 WHERE table_schema = ? AND table_name = ?
                 AND index_name != 'PRIMARY'
                 ORDER BY index_name, seq_in_index";

    let rows: Vec<(String, i64, String)> =
        conn.exec(query, (schema, table_name)).await.map_err(map_query_error)?;

    let mut indexes: Vec<IndexInfo> = Vec::new();
    for (name, non_unique, column) in rows {
        match indexes.last_mut() {
            Some(last) if last.name == name => last.columns.push(column),
            _ => indexes.push(IndexInfo { name, columns: vec![column], unique: non_unique == 0 }),
        }
    }
    Ok(indexes)
}

/// Execute query and return `QueryResult`
async fn execute_query(conn: &mut Conn, sql: &str, limit: usize, offset: usize) -> Result<QueryResult> {
    let start = Instant::now();

    let paged = paginate_sql(sql, limit, offset, PageStyle::TrailingLimit);
    let (text, skip) = match &paged {
        Some(wrapped) => (wrapped.as_str(), 0),
        None => (sql, offset),
    };

    let mut result = conn.query_iter(text).await.map_err(map_query_error)?;

    let columns: Vec<(String, ColumnType, bool)> = result
        .columns_ref()
        .iter()
        .map(|c| (c.name_str().to_string(), c.column_type(), c.character_set() == BINARY_CHARSET))
        .collect();

    if columns.is_empty() {
        let rows_affected = result.affected_rows();
        result.drop_result().await.map_err(map_query_error)?;
        return Ok(QueryResult::affected(rows_affected, elapsed_ms(start)));
    }

    // Stream to the end of the page; the rest is discarded by drop_result
    let mut rows_data = Vec::new();
    let mut skipped = 0;
    while rows_data.len() < limit {
        let Some(row) = result.next().await.map_err(map_query_error)? else {
            break;
        };
        if skipped < skip {
            skipped += 1;
            continue;
        }
        rows_data.push(row_to_json(&columns, &row)?);
    }
    result.drop_result().await.map_err(map_query_error)?;

    let column_names = columns.into_iter().map(|(name, _, _)| name).collect();
    Ok(QueryResult::with_rows(column_names, rows_data, elapsed_ms(start)))
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Convert `MySQL` row to a column-keyed map
fn row_to_json(columns: &[(String, ColumnType, bool)], row: &Row) -> Result<ResultRow> {
    let mut map = ResultRow::with_capacity(columns.len());
    for (idx, (name, column_type, binary)) in columns.iter().enumerate() {
        let value = row
            .as_ref(idx)
            .ok_or_else(|| QuarryError::query_failed(format!("Failed to get value at index {idx}")))?;
        map.insert(name.clone(), mysql_value_to_json(*column_type, *binary, value));
    }
    Ok(map)
}

/// Convert `MySQL` value to JSON value
fn mysql_value_to_json(column_type: ColumnType, binary: bool, value: &Value) -> serde_json::Value {
    match value {
        Value::NULL => serde_json::Value::Null,

        Value::Bytes(bytes) => text_value_to_json(column_type, binary, bytes),

        Value::Int(i) => serde_json::Value::Number((*i).into()),

        Value::UInt(u) => serde_json::Value::Number((*u).into()),

        Value::Float(f) => float_json(f64::from(*f)),

        Value::Double(d) => float_json(*d),

        Value::Date(year, month, day, hour, minute, second, micro) => serde_json::Value::String(format!(
            "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micro:06}"
        )),

        Value::Time(is_negative, days, hours, minutes, seconds, microseconds) => {
            let sign = if *is_negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            serde_json::Value::String(format!(
                "{sign}{total_hours}:{minutes:02}:{seconds:02}.{microseconds:06}"
            ))
        }
    }
}

fn float_json(v: f64) -> serde_json::Value {
    // NaN/Infinity have no JSON representation
    serde_json::Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

/// Text-protocol values arrive as bytes; type them from the column metadata
fn text_value_to_json(column_type: ColumnType, binary: bool, bytes: &[u8]) -> serde_json::Value {
    use base64::Engine;

    let Ok(text) = std::str::from_utf8(bytes) else {
        return serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes));
    };

    match column_type {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => text
            .parse::<i64>()
            .map(serde_json::Value::from)
            .or_else(|_| text.parse::<u64>().map(serde_json::Value::from))
            .unwrap_or_else(|_| serde_json::Value::String(text.to_string())),
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => {
            text.parse::<f64>().map_or_else(|_| serde_json::Value::String(text.to_string()), float_json)
        }
        ColumnType::MYSQL_TYPE_JSON => serde_json::from_str(text)
            .unwrap_or_else(|_| serde_json::Value::String(text.to_string())),
        ColumnType::MYSQL_TYPE_TINY_BLOB
        | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
        | ColumnType::MYSQL_TYPE_LONG_BLOB
        | ColumnType::MYSQL_TYPE_BLOB
        | ColumnType::MYSQL_TYPE_STRING
        | ColumnType::MYSQL_TYPE_VAR_STRING
            if binary =>
        {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        // DECIMAL stays a string to keep its exact precision
        _ => serde_json::Value::String(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_mysql_version() {
        assert_eq!(parse_mysql_version("8.0.35"), "MySQL 8.0.35");
        assert_eq!(parse_mysql_version("10.11.2-MariaDB"), "MariaDB 10.11.2");
        assert_eq!(parse_mysql_version("5.7.44-log"), "MySQL 5.7.44-log");
    }

    #[test]
    fn test_text_values_follow_column_type() {
        assert_eq!(text_value_to_json(ColumnType::MYSQL_TYPE_LONG, false, b"42"), json!(42));
        assert_eq!(
            text_value_to_json(ColumnType::MYSQL_TYPE_LONGLONG, false, b"18446744073709551615"),
            json!(18_446_744_073_709_551_615_u64)
        );
        assert_eq!(text_value_to_json(ColumnType::MYSQL_TYPE_DOUBLE, false, b"1.5"), json!(1.5));
        assert_eq!(text_value_to_json(ColumnType::MYSQL_TYPE_NEWDECIMAL, false, b"10.10"), json!("10.10"));
        assert_eq!(
            text_value_to_json(ColumnType::MYSQL_TYPE_JSON, false, br#"{"a":1}"#),
            json!({"a": 1})
        );
        assert_eq!(text_value_to_json(ColumnType::MYSQL_TYPE_VAR_STRING, false, b"hi"), json!("hi"));
        assert_eq!(text_value_to_json(ColumnType::MYSQL_TYPE_BLOB, true, b"hi"), json!("aGk="));
        assert_eq!(text_value_to_json(ColumnType::MYSQL_TYPE_BLOB, false, &[0xff, 0xfe]), json!("//4="));
    }

    #[test]
    fn test_binary_protocol_values() {
        let t = ColumnType::MYSQL_TYPE_NULL;
        assert_eq!(mysql_value_to_json(t, false, &Value::NULL), json!(null));
        assert_eq!(mysql_value_to_json(t, false, &Value::Int(-3)), json!(-3));
        assert_eq!(mysql_value_to_json(t, false, &Value::Double(f64::NAN)), json!(null));
        assert_eq!(
            mysql_value_to_json(t, false, &Value::Date(2024, 1, 2, 3, 4, 5, 0)),
            json!("2024-01-02T03:04:05.000000")
        );
        assert_eq!(
            mysql_value_to_json(t, false, &Value::Time(true, 1, 2, 3, 4, 0)),
            json!("-26:03:04.000000")
        );
    }

    #[test]
    fn test_error_mapping() {
        let server = |code: u16| {
            mysql_async::Error::Server(mysql_async::ServerError {
                code,
                message: format!("server said {code}"),
                state: "HY000".to_string(),
            })
        };
        assert_eq!(map_connect_error(server(1045)).error_code(), "AUTHENTICATION_FAILED");
        assert_eq!(map_connect_error(server(1049)).error_code(), "NOT_FOUND");
        assert_eq!(map_query_error(server(1146)).error_code(), "NOT_FOUND");
        assert_eq!(map_query_error(server(1317)).error_code(), "CANCELLED");

        let err = map_query_error(server(1064));
        assert_eq!(err.error_code(), "QUERY_FAILED");
        assert_eq!(err.message(), "server said 1064");
    }

    #[test]
    fn test_build_opts_requires_host() {
        let mut config = ConnectionConfig::new(DatabaseType::MySQL);
        config.username = Some("root".to_string());
        let err = build_mysql_opts(&config).unwrap_err();
        assert!(err.message().contains("MySQL requires 'host' parameter"));
    }

    #[test]
    fn test_build_opts_defaults_port() {
        let mut config = ConnectionConfig::new(DatabaseType::MySQL);
        config.host = Some("db".to_string());
        config.username = Some("root".to_string());
        let opts = build_mysql_opts(&config).unwrap();
        assert_eq!(opts.tcp_port(), 3306);
        assert_eq!(opts.user(), Some("root"));
        assert_eq!(opts.db_name(), None);
    }

    #[test]
    fn test_parse_connection_string() {
        let driver = MySqlDriver::new();
        let config = driver.parse_connection_string("mariadb://root:pw@db:3307/shop").unwrap();
        assert_eq!(config.engine, DatabaseType::MySQL);
        assert_eq!(config.port, Some(3307));
        assert_eq!(config.database.as_deref(), Some("shop"));
        assert_eq!(config.connection_string.as_deref(), Some("mysql://root:pw@db:3307/shop"));
        assert!(driver.parse_connection_string("not a url").is_err());
    }

    #[tokio::test]
    async fn test_not_connected_driver() {
        let driver = MySqlDriver::new();
        assert!(!driver.is_connected());
        driver.cancel_query().await.unwrap();
        driver.disconnect().await.unwrap();
        let err = driver.list_databases().await.unwrap_err();
        assert_eq!(err.error_code(), "CONNECTION_FAILED");
    }

    #[tokio::test]
    #[ignore = "Requires running MySQL instance"]
    async fn test_live_connection() {
        let config = ConnectionConfig::network(DatabaseType::MySQL, "localhost", 3306, "root", "test", "test");
        let driver = MySqlDriver::new();
        driver.connect(&config).await.unwrap();
        let result = driver.execute_query("SELECT 1 AS one", None, None).await.unwrap();
        assert_eq!(result.rows[0]["one"], json!(1));
        driver.disconnect().await.unwrap();
    }
}
