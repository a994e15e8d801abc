//! `PostgreSQL` Driver Implementation
//!
//! This module implements the [`Driver`] trait for `PostgreSQL` databases.
//!
//! # Features
//! - Client-server connections via TCP (`tokio-postgres`, `NoTls`)
//! - Schema introspection via `information_schema` and `pg_catalog`
//! - Rich type conversion (JSON/JSONB, NUMERIC, timestamps, UUID, arrays)
//! - Server-side cancellation through the protocol cancel request
//!
//! # Implementation Notes
//! - The connection future is spawned onto the runtime and lives until the client drops
//! - Row-returning statements are streamed and capped at the page window
//! - NUMERIC values are rendered as exact decimal strings
//! - BYTEA data is Base64-encoded for JSON safety

use async_trait::async_trait;
use futures::TryStreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{CancelToken, Client, Config, NoTls, Row};
use tracing::{debug, warn};

use crate::engine::{
    page_window, paginate_sql, parse_url_connection, ColumnInfo, ConnectionConfig, DatabaseType,
    Driver, IndexInfo, PageStyle, QueryResult, ResultRow, TableInfo, CONNECT_TIMEOUT,
};
use crate::error::{QuarryError, Result};

/// `PostgreSQL` driver holding one client connection
#[derive(Default)]
pub struct PostgresDriver {
    client: Mutex<Option<Arc<Client>>>,
    cancel_token: Mutex<Option<CancelToken>>,
    running: AtomicBool,
}

impl PostgresDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<Arc<Client>> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| QuarryError::connection_failed("PostgreSQL is not connected"))
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn engine(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<()> {
        if config.engine != DatabaseType::Postgres {
            return Err(QuarryError::invalid_input(format!(
                "Expected PostgreSQL engine, got {}",
                config.engine
            )));
        }

        let pg_config = build_pg_config(config)?;
        let (client, connection) = pg_config.connect(NoTls).await.map_err(map_connect_error)?;

        // Connection errors are logged without the config to avoid leaking credentials
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "postgres connection closed with error");
            }
        });

        client.simple_query("SELECT 1").await.map_err(map_connect_error)?;

        *self.cancel_token.lock() = Some(client.cancel_token());
        *self.client.lock() = Some(Arc::new(client));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.cancel_token.lock().take();
        // Dropping the last client handle terminates the spawned connection task
        self.client.lock().take();
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.lock().as_ref().is_some_and(|c| !c.is_closed())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let client = self.client()?;
        let query = "
            SELECT datname
            FROM pg_catalog.pg_database
            WHERE datistemplate = false
            ORDER BY datname";
        let rows = client.query(query, &[]).await.map_err(map_query_error)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn list_schemas(&self) -> Result<Vec<String>> {
        let client = self.client()?;
        let query = "
            SELECT schema_name
            FROM information_schema.schemata
            WHERE schema_name NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
              AND schema_name NOT LIKE 'pg_temp_%'
              AND schema_name NOT LIKE 'pg_toast_temp_%'
            ORDER BY schema_name";
        let rows = client.query(query, &[]).await.map_err(map_query_error)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let client = self.client()?;
        let schema = determine_target_schema(&client, schema).await?;
        let query = "
            SELECT table_name
            FROM information_schema.tables
            WHERE table_schema = $1
            AND table_type = 'BASE TABLE'
            ORDER BY table_name";
        let rows = client.query(query, &[&schema]).await.map_err(map_query_error)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn get_table_info(&self, table: &str, schema: Option<&str>) -> Result<TableInfo> {
        let client = self.client()?;
        let schema = determine_target_schema(&client, schema).await?;

        let exists = client
            .query_opt(
                "SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2",
                &[&schema, &table],
            )
            .await
            .map_err(map_query_error)?;
        if exists.is_none() {
            return Err(QuarryError::not_found(format!(
                "relation \"{schema}.{table}\" does not exist"
            )));
        }

        let primary_key = introspect_primary_key(&client, &schema, table).await?;
        let mut columns = introspect_columns(&client, &schema, table).await?;
        for column in &mut columns {
            column.primary_key = primary_key.contains(&column.name);
        }
        let indexes = introspect_indexes(&client, &schema, table).await?;
        let row_count = estimate_row_count(&client, &schema, table).await?;

        Ok(TableInfo { name: table.to_string(), schema: Some(schema), columns, indexes, row_count })
    }

    async fn execute_query(
        &self,
        sql: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<QueryResult> {
        let client = self.client()?;
        let (limit, offset) = page_window(limit, offset);

        self.running.store(true, Ordering::SeqCst);
        let result = execute_query(&client, sql, limit, offset).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn cancel_query(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(token) = self.cancel_token.lock().clone() else {
            return Ok(());
        };
        token.cancel_query(NoTls).await.map_err(|e| {
            QuarryError::engine_error("postgres", format!("Failed to send cancel request: {e}"))
        })
    }

    fn parse_connection_string(&self, input: &str) -> Result<ConnectionConfig> {
        let trimmed = input.trim();
        if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
            return parse_url_connection(DatabaseType::Postgres, trimmed, &["postgres", "postgresql"]);
        }

        // key=value form, e.g. "host=localhost port=5432 user=app dbname=shop"
        let parsed = Config::from_str(trimmed).map_err(|e| {
            QuarryError::invalid_input(format!("Invalid PostgreSQL connection string: {e}"))
        })?;
        let host = parsed.get_hosts().iter().find_map(|h| match h {
            tokio_postgres::config::Host::Tcp(name) => Some(name.clone()),
            #[cfg(unix)]
            tokio_postgres::config::Host::Unix(path) => Some(path.display().to_string()),
        });
        Ok(ConnectionConfig {
            host,
            port: parsed.get_ports().first().copied().or(Some(5432)),
            username: parsed.get_user().map(str::to_string),
            password: parsed
                .get_password()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
            database: parsed.get_dbname().map(str::to_string),
            connection_string: Some(trimmed.to_string()),
            ..ConnectionConfig::new(DatabaseType::Postgres)
        })
    }
}

fn build_pg_config(config: &ConnectionConfig) -> Result<Config> {
    let mut pg_config = if let Some(conn_str) = &config.connection_string {
        Config::from_str(conn_str).map_err(|e| {
            QuarryError::invalid_input(format!("Invalid PostgreSQL connection string: {e}"))
        })?
    } else {
        let host = config
            .host
            .as_ref()
            .ok_or_else(|| QuarryError::invalid_input("PostgreSQL requires 'host' parameter"))?;

        let user = config
            .username
            .as_ref()
            .ok_or_else(|| QuarryError::invalid_input("PostgreSQL requires 'username' parameter"))?;

        let mut pg_config = Config::new();
        pg_config
            .host(host)
            .port(config.port.unwrap_or(5432))
            .user(user)
            .dbname(config.database.as_deref().unwrap_or("postgres"));
        if let Some(password) = &config.password {
            pg_config.password(password);
        }
        pg_config
    };

    pg_config.connect_timeout(CONNECT_TIMEOUT).application_name("quarry");
    Ok(pg_config)
}

/// Map a connect-time failure onto auth / network / generic connection errors
fn map_connect_error(e: tokio_postgres::Error) -> QuarryError {
    if let Some(db) = e.as_db_error() {
        let code = db.code();
        if code == &SqlState::INVALID_PASSWORD || code == &SqlState::INVALID_AUTHORIZATION_SPECIFICATION {
            return QuarryError::authentication(db.message().to_string());
        }
        if code == &SqlState::INVALID_CATALOG_NAME {
            return QuarryError::not_found(db.message().to_string());
        }
        return QuarryError::connection_failed(db.message().to_string());
    }
    QuarryError::network(format!("Failed to connect to PostgreSQL: {e}"))
}

/// Map a statement failure, keeping the server text verbatim
fn map_query_error(e: tokio_postgres::Error) -> QuarryError {
    if let Some(db) = e.as_db_error() {
        let code = db.code();
        let text = db.message().to_string();
        if code == &SqlState::QUERY_CANCELED {
            return QuarryError::cancelled(text);
        }
        if code == &SqlState::UNDEFINED_TABLE
            || code == &SqlState::INVALID_SCHEMA_NAME
            || code == &SqlState::INVALID_CATALOG_NAME
        {
            return QuarryError::not_found(text);
        }
        return QuarryError::query_failed(text);
    }
    if e.is_closed() {
        return QuarryError::network(format!("PostgreSQL connection closed: {e}"));
    }
    QuarryError::query_failed(e.to_string())
}

/// Determine target schema from filter or current schema
async fn determine_target_schema(client: &Client, schema_filter: Option<&str>) -> Result<String> {
    if let Some(schema) = schema_filter.filter(|s| !s.is_empty()) {
        return Ok(schema.to_string());
    }

    let row = client.query_one("SELECT current_schema()", &[]).await.map_err(map_query_error)?;
    let current: Option<String> = row.get(0);
    Ok(current.unwrap_or_else(|| "public".to_string()))
}

async fn introspect_columns(client: &Client, schema: &str, table_name: &str) -> Result<Vec<ColumnInfo>> {
    let query = "
        SELECT column_name, data_type, is_nullable, column_default
        FROM information_schema.columns
        WHERE table_schema = $1 AND table_name = $2
        ORDER BY ordinal_position";

    let rows = client.query(query, &[&schema, &table_name]).await.map_err(map_query_error)?;
    Ok(rows
        .iter()
        .map(|row| {
            let is_nullable: String = row.get(2);
            ColumnInfo {
                name: row.get(0),
                data_type: row.get(1),
                nullable: is_nullable == "YES",
                primary_key: false,
                default: row.get(3),
            }
        })
        .collect())
}

async fn introspect_primary_key(client: &Client, schema: &str, table_name: &str) -> Result<HashSet<String>> {
    let query = "
        SELECT kcu.column_name
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
          ON tc.constraint_name = kcu.constraint_name
          AND tc.table_schema = kcu.table_schema
        WHERE tc.constraint_type = 'PRIMARY KEY'
          AND tc.table_schema = $1
          AND tc.table_name = $2";

    let rows = client.query(query, &[&schema, &table_name]).await.map_err(map_query_error)?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

async fn introspect_indexes(client: &Client, schema: &str, table_name: &str) -> Result<Vec<IndexInfo>> {
    let query = "
        SELECT indexname, indexdef
        FROM pg_indexes
        WHERE schemaname = $1 AND tablename = $2
        ORDER BY indexname";

    let rows = client.query(query, &[&schema, &table_name]).await.map_err(map_query_error)?;
    Ok(rows
        .iter()
        .map(|row| {
            let index_def: String = row.get(1);
            IndexInfo {
                name: row.get(0),
                columns: extract_index_columns(&index_def),
                unique: index_def.contains("UNIQUE INDEX"),
            }
        })
        .collect())
}

/// Planner estimate from `pg_class.reltuples`; `None` when never analyzed
async fn estimate_row_count(client: &Client, schema: &str, table_name: &str) -> Result<Option<u64>> {
    let query = "
        SELECT c.reltuples::bigint
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1 AND c.relname = $2";

    let row = client.query_opt(query, &[&schema, &table_name]).await.map_err(map_query_error)?;
    Ok(row.and_then(|r| r.get::<_, Option<i64>>(0)).and_then(|n| u64::try_from(n).ok()))
}

/// Extract column names from `PostgreSQL` index definition
///
/// Example: `CREATE INDEX idx_users_email ON public.users USING btree (email)`
fn extract_index_columns(index_def: &str) -> Vec<String> {
    match (index_def.find('('), index_def.rfind(')')) {
        (Some(start), Some(end)) if start < end => index_def[start + 1..end]
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// Execute query and return `QueryResult`
async fn execute_query(client: &Client, sql: &str, limit: usize, offset: usize) -> Result<QueryResult> {
    let start = Instant::now();

    let paged = paginate_sql(sql, limit, offset, PageStyle::Subquery);
    let (text, skip) = match &paged {
        Some(wrapped) => (wrapped.as_str(), 0),
        None => (sql, offset),
    };

    let stmt = client.prepare(text).await.map_err(map_query_error)?;

    if stmt.columns().is_empty() {
        let rows_affected = client.execute(&stmt, &[]).await.map_err(map_query_error)?;
        return Ok(QueryResult::affected(rows_affected, elapsed_ms(start)));
    }

    let column_names: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
    let stream = client
        .query_raw(&stmt, std::iter::empty::<&dyn ToSql>())
        .await
        .map_err(map_query_error)?;
    futures::pin_mut!(stream);

    let mut rows_data = Vec::new();
    let mut skipped = 0;
    while let Some(row) = stream.try_next().await.map_err(map_query_error)? {
        if skipped < skip {
            skipped += 1;
            continue;
        }
        if rows_data.len() >= limit {
            break;
        }
        rows_data.push(row_to_json(&column_names, &row)?);
    }

    Ok(QueryResult::with_rows(column_names, rows_data, elapsed_ms(start)))
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Convert a `PostgreSQL` row to a column-keyed map
fn row_to_json(column_names: &[String], row: &Row) -> Result<ResultRow> {
    let mut values = ResultRow::with_capacity(column_names.len());
    for (idx, name) in column_names.iter().enumerate() {
        values.insert(name.clone(), postgres_value_to_json(row, idx)?);
    }
    Ok(values)
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        QuarryError::query_failed(format!("Failed to read column {}: {e}", row.columns()[idx].name()))
    })
}

fn float_json(v: f64) -> serde_json::Value {
    serde_json::Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

/// Convert `PostgreSQL` value to JSON value
fn postgres_value_to_json(row: &Row, idx: usize) -> Result<serde_json::Value> {
    use serde_json::Value;

    let col_type = row.columns()[idx].type_().clone();

    let value = match col_type {
        Type::BOOL => get::<bool>(row, idx)?.map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx)?.map(Value::from),
        Type::INT4 => get::<i32>(row, idx)?.map(Value::from),
        Type::INT8 => get::<i64>(row, idx)?.map(Value::from),
        Type::OID => get::<u32>(row, idx)?.map(Value::from),
        Type::FLOAT4 => get::<f32>(row, idx)?.map(|v| float_json(f64::from(v))),
        Type::FLOAT8 => get::<f64>(row, idx)?.map(float_json),
        Type::NUMERIC => get::<PgNumeric>(row, idx)?.map(|n| Value::String(n.0)),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            get::<String>(row, idx)?.map(Value::String)
        }
        Type::JSON | Type::JSONB => get::<Value>(row, idx)?,
        Type::BYTEA => get::<Vec<u8>>(row, idx)?.map(|v| {
            use base64::Engine;
            Value::String(base64::engine::general_purpose::STANDARD.encode(v))
        }),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx)?
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => {
            get::<chrono::DateTime<chrono::Utc>>(row, idx)?.map(|v| Value::String(v.to_rfc3339()))
        }
        Type::DATE => {
            get::<chrono::NaiveDate>(row, idx)?.map(|v| Value::String(v.format("%Y-%m-%d").to_string()))
        }
        Type::TIME => {
            get::<chrono::NaiveTime>(row, idx)?.map(|v| Value::String(v.format("%H:%M:%S%.f").to_string()))
        }
        Type::UUID => get::<uuid::Uuid>(row, idx)?.map(|v| Value::String(v.to_string())),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get::<Vec<Option<String>>>(row, idx)?
            .map(|items| Value::Array(items.into_iter().map(|s| s.map_or(Value::Null, Value::String)).collect())),
        Type::INT4_ARRAY => get::<Vec<Option<i32>>>(row, idx)?
            .map(|items| Value::Array(items.into_iter().map(|n| n.map_or(Value::Null, Value::from)).collect())),
        Type::INT8_ARRAY => get::<Vec<Option<i64>>>(row, idx)?
            .map(|items| Value::Array(items.into_iter().map(|n| n.map_or(Value::Null, Value::from)).collect())),
        ref other => match row.try_get::<_, Option<String>>(idx) {
            Ok(v) => v.map(Value::String),
            Err(_) => {
                warn!(pg_type = %other.name(), "unsupported PostgreSQL type rendered as placeholder");
                Some(Value::String(format!("<{}>", other.name())))
            }
        },
    };

    Ok(value.unwrap_or(Value::Null))
}

/// Exact decimal rendering of a binary NUMERIC value
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let read = |pos: usize| -> std::result::Result<i16, Box<dyn std::error::Error + Sync + Send>> {
            raw.get(pos..pos + 2)
                .map(|b| i16::from_be_bytes([b[0], b[1]]))
                .ok_or_else(|| "truncated NUMERIC value".into())
        };

        let ndigits = usize::try_from(read(0)?).unwrap_or(0);
        let weight = i32::from(read(2)?);
        let sign = read(4)? as u16;
        let dscale = usize::try_from(read(6)?).unwrap_or(0);

        match sign {
            0xC000 => return Ok(Self("NaN".to_string())),
            0xD000 => return Ok(Self("Infinity".to_string())),
            0xF000 => return Ok(Self("-Infinity".to_string())),
            _ => {}
        }

        let digits = (0..ndigits).map(|i| read(8 + i * 2)).collect::<std::result::Result<Vec<_>, _>>()?;
        let digit_at = |i: i32| usize::try_from(i).ok().and_then(|i| digits.get(i)).copied().unwrap_or(0);

        let mut out = String::new();
        if sign == 0x4000 {
            out.push('-');
        }
        if weight < 0 {
            out.push('0');
        } else {
            for i in 0..=weight {
                if i == 0 {
                    out.push_str(&digit_at(i).to_string());
                } else {
                    out.push_str(&format!("{:04}", digit_at(i)));
                }
            }
        }

        if dscale > 0 {
            let mut frac = String::new();
            let mut i = weight + 1;
            while frac.len() < dscale {
                frac.push_str(&format!("{:04}", digit_at(i)));
                i += 1;
            }
            frac.truncate(dscale);
            out.push('.');
            out.push_str(&frac);
        }

        Ok(Self(out))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}
