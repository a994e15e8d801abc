//! Natural-Language Query Pipeline
//!
//! Turns a question into one statement through a [`ReasoningService`], checks it
//! against the caller's [`NlPermissions`], optionally runs it, and can ask the model
//! to interpret the rows that came back.
//!
//! # State
//! Each connection id moves through `Idle → Generating → Executing → Idle`
//! (`Interpreting` for [`NlPipeline::interpret_results`]). Every operation registers a
//! [`CancellationToken`] under its connection id; starting a new operation on the
//! same id cancels the one already in flight.

pub mod prompt;
pub mod reasoning;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::{validate_query, NlPermissions, QueryCategory};
use crate::connection::ConnectionManager;
use crate::engine::{Driver, QueryResult, ResultRow};
use crate::error::{QuarryError, Result};

pub use reasoning::{AnthropicReasoning, ChatMessage, ReasoningRequest, ReasoningService, Role};

/// Tables described in the schema context
pub const SCHEMA_CONTEXT_TABLES: usize = 50;

/// How long a cancelled query may take to unwind before the pipeline gives up on it
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// One earlier turn, supplied by the caller; never persisted here
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NlHistoryEntry {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NlState {
    #[default]
    Idle,
    Generating,
    Executing,
    Interpreting,
}

/// A generated statement that passed the permission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedSql {
    pub sql: String,
    pub category: QueryCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NlQueryOutcome {
    pub sql: String,
    pub category: QueryCategory,
    pub result: QueryResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NlInterpretation {
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_sql: Option<String>,
}

struct InFlight {
    generation: u64,
    token: CancellationToken,
    state: NlState,
}

/// Registration of one running operation; unregisters on drop
struct Operation<'a> {
    pipeline: &'a NlPipeline,
    connection_id: String,
    generation: u64,
    token: CancellationToken,
}

impl Operation<'_> {
    fn set_state(&self, state: NlState) {
        if let Some(entry) = self.pipeline.in_flight.lock().get_mut(&self.connection_id) {
            if entry.generation == self.generation {
                entry.state = state;
            }
        }
    }

    /// Await `fut` unless the operation is cancelled first
    async fn run<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(QuarryError::cancelled("Request cancelled")),
            result = fut => result,
        }
    }
}

impl Drop for Operation<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.pipeline.in_flight.lock();
        if in_flight.get(&self.connection_id).is_some_and(|e| e.generation == self.generation) {
            in_flight.remove(&self.connection_id);
        }
    }
}

pub struct NlPipeline {
    connections: Arc<ConnectionManager>,
    reasoning: Arc<dyn ReasoningService>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_generation: AtomicU64,
}

impl NlPipeline {
    #[must_use]
    pub fn new(connections: Arc<ConnectionManager>, reasoning: Arc<dyn ReasoningService>) -> Self {
        Self { connections, reasoning, in_flight: Mutex::new(HashMap::new()), next_generation: AtomicU64::new(1) }
    }

    fn begin(&self, connection_id: &str, state: NlState) -> Operation<'_> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = self.in_flight.lock().insert(
            connection_id.to_string(),
            InFlight { generation, token: token.clone(), state },
        );
        if let Some(previous) = previous {
            debug!(connection_id = %connection_id, "superseding in-flight NL operation");
            previous.token.cancel();
        }
        Operation { pipeline: self, connection_id: connection_id.to_string(), generation, token }
    }

    fn driver(&self, connection_id: &str) -> Result<Arc<dyn Driver>> {
        self.connections
            .get_driver(connection_id)
            .ok_or_else(|| QuarryError::not_found(format!("Connection '{connection_id}' not found")))
    }

    /// Current state for a connection
    #[must_use]
    pub fn state(&self, connection_id: &str) -> NlState {
        self.in_flight.lock().get(connection_id).map_or(NlState::Idle, |e| e.state)
    }

    /// Cancel whatever is in flight on `connection_id`; true iff something was
    pub fn cancel(&self, connection_id: &str) -> bool {
        match self.in_flight.lock().remove(connection_id) {
            Some(entry) => {
                entry.token.cancel();
                info!(connection_id = %connection_id, "NL operation cancelled");
                true
            }
            None => false,
        }
    }

    /// One line per table, at most [`SCHEMA_CONTEXT_TABLES`]
    pub async fn get_schema_context(&self, connection_id: &str) -> Result<String> {
        let driver = self.driver(connection_id)?;
        schema_context(driver.as_ref()).await
    }

    /// Ask the model for a statement answering `prompt`
    pub async fn generate_sql(
        &self,
        connection_id: &str,
        prompt: &str,
        permissions: &NlPermissions,
        history: &[NlHistoryEntry],
    ) -> Result<GeneratedSql> {
        let operation = self.begin(connection_id, NlState::Generating);
        let driver = self.driver(connection_id)?;
        self.generate(&operation, driver.as_ref(), prompt, permissions, history).await
    }

    async fn generate(
        &self,
        operation: &Operation<'_>,
        driver: &dyn Driver,
        prompt: &str,
        permissions: &NlPermissions,
        history: &[NlHistoryEntry],
    ) -> Result<GeneratedSql> {
        let engine = driver.engine();
        let schema = operation.run(schema_context(driver)).await?;

        let mut messages = prompt::history_messages(history);
        messages.push(ChatMessage::user(prompt));
        let request =
            ReasoningRequest::new(prompt::generation_system_prompt(engine, &schema, permissions), messages);

        let reply = operation.run(self.reasoning.complete(&request)).await?;
        let sql = prompt::extract_statement(&reply)
            .ok_or_else(|| QuarryError::reasoning("The reasoning service returned an empty answer"))?;

        let category = validate_query(&sql, permissions, engine).inspect_err(|e| {
            warn!(connection_id = %operation.connection_id, code = e.error_code(), "generated statement rejected");
        })?;
        debug!(connection_id = %operation.connection_id, category = category.as_str(), "statement generated");
        Ok(GeneratedSql { sql, category })
    }

    /// Generate a statement and run it with `limit = permissions.max_rows`
    pub async fn execute_nl_query(
        &self,
        connection_id: &str,
        prompt: &str,
        permissions: &NlPermissions,
        history: &[NlHistoryEntry],
    ) -> Result<NlQueryOutcome> {
        let operation = self.begin(connection_id, NlState::Generating);
        let driver = self.driver(connection_id)?;
        let generated = self.generate(&operation, driver.as_ref(), prompt, permissions, history).await?;

        operation.set_state(NlState::Executing);
        let execution = driver.execute_query(&generated.sql, permissions.max_rows, None);
        tokio::pin!(execution);

        let result = tokio::select! {
            biased;
            () = operation.token.cancelled() => {
                if let Err(e) = driver.cancel_query().await {
                    debug!(connection_id = %connection_id, error = %e, "cancel_query failed");
                }
                // Let the driver unwind so the connection stays usable
                if tokio::time::timeout(CANCEL_GRACE, &mut execution).await.is_err() {
                    warn!(connection_id = %connection_id, "cancelled query did not stop in time");
                }
                return Err(QuarryError::cancelled("Query cancelled"));
            }
            result = &mut execution => result?,
        };

        info!(connection_id = %connection_id, rows = result.row_count, "NL query executed");
        Ok(NlQueryOutcome { sql: generated.sql, category: generated.category, result })
    }

    /// Ask the model to explain a result set
    #[allow(clippy::too_many_arguments)]
    pub async fn interpret_results(
        &self,
        connection_id: &str,
        question: &str,
        sql: &str,
        columns: &[String],
        rows: &[ResultRow],
        row_count: usize,
        history: &[NlHistoryEntry],
    ) -> Result<NlInterpretation> {
        let operation = self.begin(connection_id, NlState::Interpreting);
        let engine = self.connections.get_driver(connection_id).map(|d| d.engine());

        let mut messages = prompt::history_messages(history);
        messages.push(ChatMessage::user(prompt::interpretation_message(question, sql, columns, rows, row_count)));
        let request = ReasoningRequest::new(prompt::interpretation_system_prompt(engine), messages);

        let reply = operation.run(self.reasoning.complete(&request)).await?;
        Ok(NlInterpretation { suggested_sql: prompt::extract_fenced(&reply), answer: reply.trim().to_string() })
    }
}

async fn schema_context(driver: &dyn Driver) -> Result<String> {
    let tables = driver.list_tables(None).await?;
    let mut lines = Vec::with_capacity(tables.len().min(SCHEMA_CONTEXT_TABLES) + 1);
    for table in tables.iter().take(SCHEMA_CONTEXT_TABLES) {
        match driver.get_table_info(table, None).await {
            Ok(info) => lines.push(prompt::table_line(&info)),
            Err(e) => {
                debug!(table = %table, error = %e, "table skipped in schema context");
                lines.push(table.clone());
            }
        }
    }
    if tables.len() > SCHEMA_CONTEXT_TABLES {
        lines.push(format!("... and {} more tables", tables.len() - SCHEMA_CONTEXT_TABLES));
    }
    Ok(lines.join("\n"))
}
