//! SQL Server Driver Implementation
//!
//! This module implements the [`Driver`] trait for Microsoft SQL Server using `tiberius`.
//!
//! # Implementation Notes
//! - One TDS connection per driver, guarded by an async mutex
//! - Cancelling drops the in-flight request and reconnects with the saved config
//! - Paging appends `OFFSET .. FETCH NEXT` after an outer ORDER BY; other queries are capped while streaming
//! - DML and DDL go through `execute` to report affected rows

use async_trait::async_trait;
use futures::TryStreamExt;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::time::Instant;
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::{
    page_window, paginate_sql, parse_url_connection, ColumnInfo, ConnectionConfig, DatabaseType,
    Driver, IndexInfo, PageStyle, QueryResult, ResultRow, TableInfo, CONNECT_TIMEOUT,
};
use crate::error::{QuarryError, Result};

type MssqlClient = Client<Compat<TcpStream>>;

/// SQL Server driver holding one TDS client
#[derive(Default)]
pub struct MssqlDriver {
    client: tokio::sync::Mutex<Option<MssqlClient>>,
    config: Mutex<Option<ConnectionConfig>>,
    running: Mutex<Option<CancellationToken>>,
}

impl MssqlDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Driver for MssqlDriver {
    fn engine(&self) -> DatabaseType {
        DatabaseType::Mssql
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<()> {
        if config.engine != DatabaseType::Mssql {
            return Err(QuarryError::invalid_input(format!(
                "Expected MSSQL engine, got {}",
                config.engine
            )));
        }

        let client = connect_client(config).await?;
        *self.client.lock().await = Some(client);
        *self.config.lock() = Some(config.clone());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
        }
        self.config.lock().take();
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            client
                .close()
                .await
                .map_err(|e| QuarryError::engine_error("mssql", format!("Failed to close connection: {e}")))?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.config.lock().is_some()
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let mut guard = self.client.lock().await;
        let client = connected(&mut guard)?;
        query_strings(client, "SELECT name FROM sys.databases ORDER BY name", &[]).await
    }

    async fn list_schemas(&self) -> Result<Vec<String>> {
        let mut guard = self.client.lock().await;
        let client = connected(&mut guard)?;
        let query = "SELECT name FROM sys.schemas
                     WHERE name NOT IN ('sys', 'INFORMATION_SCHEMA', 'guest')
                     AND name NOT LIKE 'db[_]%'
                     ORDER BY name";
        query_strings(client, query, &[]).await
    }

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let mut guard = self.client.lock().await;
        let client = connected(&mut guard)?;
        let schema = target_schema(schema);
        let query = "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES
                     WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_SCHEMA = @P1
                     ORDER BY TABLE_NAME";
        query_strings(client, query, &[&schema]).await
    }

    async fn get_table_info(&self, table: &str, schema: Option<&str>) -> Result<TableInfo> {
        let mut guard = self.client.lock().await;
        let client = connected(&mut guard)?;
        let schema = target_schema(schema);
        let object_name = format!("{}.{}", quote_identifier(&schema), quote_identifier(table));

        let exists = query_strings(
            client,
            "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2",
            &[&schema, &table],
        )
        .await?;
        if exists.is_empty() {
            return Err(QuarryError::not_found(format!("Invalid object name '{schema}.{table}'.")));
        }

        let primary_key = query_strings(
            client,
            "SELECT kcu.COLUMN_NAME
             FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
             JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu
               ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME AND tc.TABLE_SCHEMA = kcu.TABLE_SCHEMA
             WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY' AND tc.TABLE_SCHEMA = @P1 AND tc.TABLE_NAME = @P2
             ORDER BY kcu.ORDINAL_POSITION",
            &[&schema, &table],
        )
        .await?;

        let columns = introspect_columns(client, &schema, table, &primary_key).await?;
        let indexes = introspect_indexes(client, &object_name).await?;
        let row_count = estimate_row_count(client, &object_name).await?;

        Ok(TableInfo { name: table.to_string(), schema: Some(schema), columns, indexes, row_count })
    }

    async fn execute_query(
        &self,
        sql: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<QueryResult> {
        let (limit, offset) = page_window(limit, offset);
        let mut guard = self.client.lock().await;

        let client = connected(&mut guard)?;
        let token = CancellationToken::new();
        *self.running.lock() = Some(token.clone());

        let outcome = {
            tokio::select! {
                result = execute_query(client, sql, limit, offset) => Some(result),
                () = token.cancelled() => None,
            }
        };
        self.running.lock().take();

        match outcome {
            Some(result) => result,
            None => {
                // The TDS stream is mid-response; replace the connection
                guard.take();
                let config = self.config.lock().clone();
                if let Some(config) = config {
                    match connect_client(&config).await {
                        Ok(client) => *guard = Some(client),
                        Err(e) => warn!(error = %e, "mssql reconnect after cancel failed"),
                    }
                }
                Err(QuarryError::cancelled("Query cancelled"))
            }
        }
    }

    async fn cancel_query(&self) -> Result<()> {
        if let Some(token) = self.running.lock().as_ref() {
            token.cancel();
        }
        Ok(())
    }

    fn parse_connection_string(&self, input: &str) -> Result<ConnectionConfig> {
        let trimmed = input.trim();
        if trimmed.starts_with("mssql://") || trimmed.starts_with("sqlserver://") {
            let mut config = parse_url_connection(DatabaseType::Mssql, trimmed, &["mssql", "sqlserver"])?;
            // tiberius only reads ADO.NET strings; connect from the parsed fields
            config.connection_string = None;
            return Ok(config);
        }
        parse_ado_string(trimmed)
    }
}

fn connected<'a>(guard: &'a mut Option<MssqlClient>) -> Result<&'a mut MssqlClient> {
    guard
        .as_mut()
        .ok_or_else(|| QuarryError::connection_failed("MSSQL is not connected"))
}

fn target_schema(schema: Option<&str>) -> String {
    schema.filter(|s| !s.is_empty()).unwrap_or("dbo").to_string()
}

fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

fn build_tiberius_config(config: &ConnectionConfig) -> Result<Config> {
    let mut tconfig = if let Some(ado) = &config.connection_string {
        Config::from_ado_string(ado)
            .map_err(|e| QuarryError::invalid_input(format!("Invalid MSSQL connection string: {e}")))?
    } else {
        let host = config
            .host
            .as_ref()
            .ok_or_else(|| QuarryError::invalid_input("MSSQL requires 'host' parameter"))?;
        let user = config
            .username
            .as_ref()
            .ok_or_else(|| QuarryError::invalid_input("MSSQL requires 'username' parameter"))?;

        let mut tconfig = Config::new();
        tconfig.host(host);
        tconfig.port(config.port.unwrap_or(1433));
        tconfig.authentication(AuthMethod::sql_server(user, config.password.as_deref().unwrap_or("")));
        if let Some(db) = config.database.as_deref().filter(|d| !d.is_empty()) {
            tconfig.database(db);
        }
        tconfig
    };
    tconfig.application_name("quarry");
    tconfig.trust_cert();
    Ok(tconfig)
}

async fn connect_client(config: &ConnectionConfig) -> Result<MssqlClient> {
    let tconfig = build_tiberius_config(config)?;

    let tcp = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(tconfig.get_addr())).await {
        Ok(tcp) => tcp.map_err(|e| QuarryError::network(format!("Failed to connect to MSSQL: {e}")))?,
        Err(_) => {
            return Err(QuarryError::network(format!(
                "Timed out connecting to MSSQL after {}s",
                CONNECT_TIMEOUT.as_secs()
            )))
        }
    };
    tcp.set_nodelay(true)
        .map_err(|e| QuarryError::network(format!("Failed to configure socket: {e}")))?;

    let client = Client::connect(tconfig, tcp.compat_write()).await.map_err(map_connect_error)?;
    debug!(host = ?config.host, "mssql connected");
    Ok(client)
}

fn map_connect_error(e: tiberius::error::Error) -> QuarryError {
    match e {
        tiberius::error::Error::Server(ref token) => match token.code() {
            18456 => QuarryError::authentication(token.message().to_string()),
            4060 => QuarryError::not_found(token.message().to_string()),
            _ => QuarryError::connection_failed(token.message().to_string()),
        },
        tiberius::error::Error::Io { message, .. } => {
            QuarryError::network(format!("Failed to connect to MSSQL: {message}"))
        }
        other => QuarryError::connection_failed(format!("Failed to connect to MSSQL: {other}")),
    }
}

/// Map a statement failure, keeping the server text verbatim
fn map_query_error(e: tiberius::error::Error) -> QuarryError {
    match e {
        tiberius::error::Error::Server(ref token) => match token.code() {
            // Invalid object name / cannot open database
            208 | 4060 => QuarryError::not_found(token.message().to_string()),
            _ => QuarryError::query_failed(token.message().to_string()),
        },
        tiberius::error::Error::Io { message, .. } => QuarryError::network(format!("MSSQL connection lost: {message}")),
        other => QuarryError::query_failed(other.to_string()),
    }
}

async fn query_strings(client: &mut MssqlClient, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<String>> {
    let rows = client
        .query(sql, params)
        .await
        .map_err(map_query_error)?
        .into_first_result()
        .await
        .map_err(map_query_error)?;
    Ok(rows
        .iter()
        .filter_map(|row| row.get::<&str, _>(0).map(str::to_string))
        .collect())
}

async fn introspect_columns(
    client: &mut MssqlClient,
    schema: &str,
    table: &str,
    primary_key: &[String],
) -> Result<Vec<ColumnInfo>> {
    let query = "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, COLUMN_DEFAULT
                 FROM INFORMATION_SCHEMA.COLUMNS
                 WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2
                 ORDER BY ORDINAL_POSITION";
    let rows = client
        .query(query, &[&schema, &table])
        .await
        .map_err(map_query_error)?
        .into_first_result()
        .await
        .map_err(map_query_error)?;

    Ok(rows
        .iter()
        .map(|row| {
            let name = row.get::<&str, _>(0).unwrap_or_default().to_string();
            ColumnInfo {
                primary_key: primary_key.contains(&name),
                name,
                data_type: row.get::<&str, _>(1).unwrap_or_default().to_string(),
                nullable: row.get::<&str, _>(2) == Some("YES"),
                default: row.get::<&str, _>(3).map(str::to_string),
            }
        })
        .collect())
}

async fn introspect_indexes(client: &mut MssqlClient, object_name: &str) -> Result<Vec<IndexInfo>> {
    let query = "SELECT i.name, i.is_unique, c.name
                 FROM sys.indexes i
                 JOIN sys.index_columns ic ON ic.object_id = i.object_id AND ic.index_id = i.index_id
                 JOIN sys.columns c ON c.object_id = ic.object_id AND c.column_id = ic.column_id
                 WHERE i.object_id = OBJECT_ID(@P1) AND i.is_primary_key = 0 AND i.name IS NOT NULL
                 ORDER BY i.name, ic.key_ordinal";
    let rows = client
        .query(query, &[&object_name])
        .await
        .map_err(map_query_error)?
        .into_first_result()
        .await
        .map_err(map_query_error)?;

    let mut indexes: Vec<IndexInfo> = Vec::new();
    for row in &rows {
        let name = row.get::<&str, _>(0).unwrap_or_default().to_string();
        let unique = row.get::<bool, _>(1).unwrap_or(false);
        let column = row.get::<&str, _>(2).unwrap_or_default().to_string();
        match indexes.last_mut() {
            Some(last) if last.name == name => last.columns.push(column),
            _ => indexes.push(IndexInfo { name, columns: vec![column], unique }),
        }
    }
    Ok(indexes)
}

async fn estimate_row_count(client: &mut MssqlClient, object_name: &str) -> Result<Option<u64>> {
    let query = "SELECT SUM(p.rows) FROM sys.partitions p
                 WHERE p.object_id = OBJECT_ID(@P1) AND p.index_id IN (0, 1)";
    let row = client
        .query(query, &[&object_name])
        .await
        .map_err(map_query_error)?
        .into_row()
        .await
        .map_err(map_query_error)?;
    Ok(row.and_then(|r| r.get::<i64, _>(0)).and_then(|n| u64::try_from(n).ok()))
}

/// Leading keywords of statements that produce a row count rather than rows
fn is_row_count_statement(sql: &str) -> bool {
    let normalized = crate::capability::normalize(sql);
    let first = normalized.split_whitespace().next().unwrap_or("");
    matches!(
        first,
        "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "GRANT" | "REVOKE"
            | "DENY"
    )
}

async fn execute_query(client: &mut MssqlClient, sql: &str, limit: usize, offset: usize) -> Result<QueryResult> {
    let start = Instant::now();

    if is_row_count_statement(sql) {
        let result = client.execute(sql, &[]).await.map_err(map_query_error)?;
        return Ok(QueryResult::affected(result.total(), elapsed_ms(start)));
    }

    let paged = paginate_sql(sql, limit, offset, PageStyle::OffsetFetch);
    let (text, skip) = match &paged {
        Some(wrapped) => (wrapped.as_str(), 0),
        None => (sql, offset),
    };

    let mut stream = client.simple_query(text).await.map_err(map_query_error)?;
    let columns: Vec<String> = stream
        .columns()
        .await
        .map_err(map_query_error)?
        .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let mut rows = stream.into_row_stream();
    let mut rows_data = Vec::new();
    let mut skipped = 0;
    while let Some(row) = rows.try_next().await.map_err(map_query_error)? {
        if skipped < skip {
            skipped += 1;
            continue;
        }
        if rows_data.len() >= limit {
            break;
        }
        let mut map = ResultRow::with_capacity(columns.len());
        for (name, data) in columns.iter().zip(row.into_iter()) {
            map.insert(name.clone(), mssql_value_to_json(&data));
        }
        rows_data.push(map);
    }

    Ok(QueryResult::with_rows(columns, rows_data, elapsed_ms(start)))
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn float_json(v: f64) -> serde_json::Value {
    serde_json::Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

/// Convert a TDS value to JSON
fn mssql_value_to_json(data: &ColumnData<'static>) -> serde_json::Value {
    use base64::Engine;
    use serde_json::Value;

    let value = match data {
        ColumnData::U8(v) => v.map(Value::from),
        ColumnData::I16(v) => v.map(Value::from),
        ColumnData::I32(v) => v.map(Value::from),
        ColumnData::I64(v) => v.map(Value::from),
        ColumnData::F32(v) => v.map(|f| float_json(f64::from(f))),
        ColumnData::F64(v) => v.map(float_json),
        ColumnData::Bit(v) => v.map(Value::Bool),
        ColumnData::String(v) => v.as_ref().map(|s: &Cow<'_, str>| Value::String(s.to_string())),
        ColumnData::Guid(v) => v.as_ref().map(|g| Value::String(g.to_string())),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| Value::String(base64::engine::general_purpose::STANDARD.encode(b))),
        ColumnData::Numeric(v) => v.as_ref().map(|n| Value::String(n.to_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            temporal(chrono::NaiveDateTime::from_sql(data), |v| v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }
        ColumnData::Date(_) => temporal(chrono::NaiveDate::from_sql(data), |v| v.format("%Y-%m-%d").to_string()),
        ColumnData::Time(_) => temporal(chrono::NaiveTime::from_sql(data), |v| v.format("%H:%M:%S%.f").to_string()),
        ColumnData::DateTimeOffset(_) => {
            temporal(chrono::DateTime::<chrono::FixedOffset>::from_sql(data), |v| v.to_rfc3339())
        }
        other => Some(Value::String(format!("{other:?}"))),
    };
    value.unwrap_or(Value::Null)
}

fn temporal<T>(
    decoded: tiberius::Result<Option<T>>,
    render: impl Fn(T) -> String,
) -> Option<serde_json::Value> {
    match decoded {
        Ok(v) => v.map(|v| serde_json::Value::String(render(v))),
        Err(e) => Some(serde_json::Value::String(format!("<{e}>"))),
    }
}

/// Parse an ADO.NET style `Key=Value;` connection string
fn parse_ado_string(input: &str) -> Result<ConnectionConfig> {
    let mut config = ConnectionConfig::new(DatabaseType::Mssql);
    let mut seen_any = false;

    for part in input.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| QuarryError::invalid_input(format!("Invalid MSSQL connection string segment: '{part}'")))?;
        let value = value.trim().to_string();
        seen_any = true;
        match key.trim().to_ascii_lowercase().as_str() {
            "server" | "data source" | "address" | "addr" => {
                let server = value.strip_prefix("tcp:").unwrap_or(&value);
                let (host, port) = match server.split_once(',') {
                    Some((host, port)) => (host, port.trim().parse::<u16>().ok()),
                    None => (server, None),
                };
                config.host = Some(host.trim().to_string());
                config.port = port;
            }
            "database" | "initial catalog" => config.database = Some(value),
            "user id" | "uid" | "user" => config.username = Some(value),
            "password" | "pwd" => config.password = Some(value),
            _ => {}
        }
    }

    if !seen_any || config.host.is_none() {
        return Err(QuarryError::invalid_input("MSSQL connection string must name a server"));
    }
    config.port = config.port.or(Some(1433));
    config.connection_string = Some(input.to_string());
    Ok(config)
}
