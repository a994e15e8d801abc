//! Data Transfer
//!
//! Copies table rows between two registered connections by reading pages of
//! `SELECT *` from the source and replaying each row as a literal `INSERT` on the
//! target. No DDL is issued: target tables must already exist with compatible columns.
//!
//! Pages are ordered by the table's primary key (every column when it has none) so
//! consecutive LIMIT/OFFSET reads neither repeat nor skip rows.
//!
//! Failures are collected, not raised. A table whose read succeeded counts as
//! transferred even when some (or all) of its inserts failed. Rows inserted before a
//! later page fails to read still count toward `rows_transferred`.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::engine::{DatabaseType, Driver, QueryResult};
use crate::error::{QuarryError, Result};

/// Rows read from the source per page
pub const TRANSFER_BATCH: usize = 1000;

/// Outcome of a transfer; `success` is true iff `errors` is empty
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferResult {
    pub success: bool,
    pub tables_transferred: usize,
    pub rows_transferred: u64,
    pub errors: Vec<String>,
}

pub struct TransferEngine {
    connections: Arc<ConnectionManager>,
}

impl TransferEngine {
    #[must_use]
    pub const fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Copy `tables` from `source_id` to `target_id`
    pub async fn transfer(&self, source_id: &str, target_id: &str, tables: &[String]) -> Result<TransferResult> {
        let source = self.driver(source_id)?;
        let target = self.driver(target_id)?;
        for driver in [&source, &target] {
            if !driver.engine().is_sql() {
                return Err(QuarryError::unsupported_engine(format!(
                    "Transfer needs SQL engines on both sides, got {}",
                    driver.engine().display_name()
                )));
            }
        }

        let mut result = TransferResult::default();
        for table in tables {
            let (rows, read_error) = copy_table(source.as_ref(), target.as_ref(), table, &mut result.errors).await;
            result.rows_transferred += rows;
            match read_error {
                None => {
                    result.tables_transferred += 1;
                    debug!(table = %table, rows, "table transferred");
                }
                Some(e) => {
                    warn!(table = %table, rows, code = e.error_code(), "transfer read failed");
                    result.errors.push(format!("{table}: {}", e.message()));
                }
            }
        }

        result.success = result.errors.is_empty();
        info!(
            source = %source_id,
            target = %target_id,
            tables = result.tables_transferred,
            rows = result.rows_transferred,
            errors = result.errors.len(),
            "transfer finished"
        );
        Ok(result)
    }

    fn driver(&self, id: &str) -> Result<Arc<dyn Driver>> {
        self.connections
            .get_driver(id)
            .ok_or_else(|| QuarryError::not_found(format!("Connection '{id}' not found")))
    }
}

/// Page through one table
///
/// Returns the rows inserted so far, plus the source read error that stopped the
/// table early, if any.
async fn copy_table(
    source: &dyn Driver,
    target: &dyn Driver,
    table: &str,
    errors: &mut Vec<String>,
) -> (u64, Option<QuarryError>) {
    let order = match page_order(source, table).await {
        Ok(order) => order,
        Err(e) => return (0, Some(e)),
    };
    let mut select = format!("SELECT * FROM {}", quote_qualified(source.engine(), table));
    if !order.is_empty() {
        select.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }
    let target_table = quote_qualified(target.engine(), table);

    let mut offset = 0;
    let mut inserted = 0u64;
    loop {
        let page = match source.execute_query(&select, Some(TRANSFER_BATCH), Some(offset)).await {
            Ok(QueryResult { error: Some(error), .. }) => {
                return (inserted, Some(QuarryError::query_failed(error)));
            }
            Ok(page) => page,
            Err(e) => return (inserted, Some(e)),
        };

        for (index, row) in page.rows.iter().enumerate() {
            let sql = insert_statement(target.engine(), &target_table, &page.columns, row);
            match target.execute_query(&sql, None, None).await {
                Ok(QueryResult { error: None, .. }) => inserted += 1,
                Ok(QueryResult { error: Some(e), .. }) => {
                    errors.push(format!("{table}: row {}: {e}", offset + index + 1));
                }
                Err(e) => errors.push(format!("{table}: row {}: {}", offset + index + 1, e.message())),
            }
        }

        if page.rows.len() < TRANSFER_BATCH {
            return (inserted, None);
        }
        offset += page.rows.len();
    }
}

/// Quoted ORDER BY columns: the primary key, or every column when there is none
async fn page_order(source: &dyn Driver, table: &str) -> Result<Vec<String>> {
    let (schema, name) = match table.rsplit_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    };
    let info = source.get_table_info(name, schema).await?;

    let key = info.primary_key();
    let columns = if key.is_empty() { info.columns.iter().map(|c| c.name.as_str()).collect() } else { key };
    Ok(columns.into_iter().map(|c| quote_identifier(source.engine(), c)).collect())
}

fn insert_statement(
    engine: DatabaseType,
    table: &str,
    columns: &[String],
    row: &crate::engine::ResultRow,
) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_identifier(engine, c)).collect();
    let values: Vec<String> =
        columns.iter().map(|c| sql_literal(row.get(c).unwrap_or(&Value::Null))).collect();
    format!("INSERT INTO {table} ({}) VALUES ({})", names.join(", "), values.join(", "))
}

/// Render a JSON value as a SQL literal
fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_string(s),
        Value::Array(_) | Value::Object(_) => quote_string(&value.to_string()),
    }
}

fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn quote_identifier(engine: DatabaseType, name: &str) -> String {
    match engine {
        DatabaseType::MySQL => format!("`{}`", name.replace('`', "``")),
        DatabaseType::Mssql => format!("[{}]", name.replace(']', "]]")),
        _ => format!("\"{}\"", name.replace('"', "\"\"")),
    }
}

/// Quote each part of a possibly schema-qualified name
fn quote_qualified(engine: DatabaseType, name: &str) -> String {
    name.split('.').map(|part| quote_identifier(engine, part)).collect::<Vec<_>>().join(".")
}
