//! Prompt construction and reply parsing for the NL pipeline

use serde_json::Value;

use crate::capability::NlPermissions;
use crate::engine::{DatabaseType, ResultRow, TableInfo};
use crate::nl::reasoning::ChatMessage;
use crate::nl::NlHistoryEntry;

/// Rows included when asking for an interpretation
pub const INTERPRET_SAMPLE_ROWS: usize = 20;

/// Longest rendering of a single cell in the interpretation prompt
const MAX_CELL_CHARS: usize = 200;

fn dialect(engine: DatabaseType) -> &'static str {
    match engine {
        DatabaseType::Postgres => "PostgreSQL",
        DatabaseType::MySQL => "MySQL (MariaDB compatible)",
        DatabaseType::Mssql => "Microsoft SQL Server T-SQL",
        DatabaseType::SQLite => "SQLite",
        DatabaseType::MongoDB => "MongoDB command documents (JSON)",
    }
}

/// `table(col type [PK], ...)`
#[must_use]
pub fn table_line(info: &TableInfo) -> String {
    let name = match &info.schema {
        Some(schema) if !schema.is_empty() => format!("{schema}.{}", info.name),
        _ => info.name.clone(),
    };
    let columns: Vec<String> = info
        .columns
        .iter()
        .map(|c| {
            if c.primary_key {
                format!("{} {} PK", c.name, c.data_type)
            } else {
                format!("{} {}", c.name, c.data_type)
            }
        })
        .collect();
    format!("{name}({})", columns.join(", "))
}

/// System prompt for statement generation
#[must_use]
pub fn generation_system_prompt(engine: DatabaseType, schema: &str, permissions: &NlPermissions) -> String {
    let format_rule = if engine == DatabaseType::MongoDB {
        "Answer with exactly one command document, e.g. {\"find\": \"users\", \"filter\": {}}, \
         inside a ```json fenced block."
    } else {
        "Answer with exactly one SQL statement inside a ```sql fenced block. \
         Do not add LIMIT or OFFSET unless the question asks for it; paging is applied for you."
    };
    let schema = if schema.trim().is_empty() { "(no tables)" } else { schema };

    format!(
        "You translate questions into queries for a {dialect} database.\n\n\
         Schema:\n{schema}\n\n\
         Permissions: {permissions}.\n\
         {format_rule}\n\
         If the question cannot be answered from this schema, say so in one sentence without a code block.",
        dialect = dialect(engine),
        permissions = permissions.describe(),
    )
}

/// Replay earlier turns as user/assistant pairs
#[must_use]
pub fn history_messages(history: &[NlHistoryEntry]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() * 2);
    for entry in history {
        messages.push(ChatMessage::user(entry.prompt.clone()));
        let mut reply = match &entry.sql {
            Some(sql) => format!("```sql\n{sql}\n```"),
            None => String::new(),
        };
        if let Some(summary) = &entry.result_summary {
            if !reply.is_empty() {
                reply.push('\n');
            }
            reply.push_str(summary);
        }
        if !reply.is_empty() {
            messages.push(ChatMessage::assistant(reply));
        }
    }
    messages
}

/// Contents of the first fenced code block, if any
#[must_use]
pub fn extract_fenced(reply: &str) -> Option<String> {
    let start = reply.find("```")?;
    let after = &reply[start + 3..];
    // Skip the info string (```sql, ```json)
    let body_start = after.find('\n').map_or(0, |i| i + 1);
    let body = &after[body_start..];
    let end = body.find("```").unwrap_or(body.len());
    let code = body[..end].trim();
    (!code.is_empty()).then(|| code.to_string())
}

/// The statement in a generation reply: the first fenced block, else the whole reply
#[must_use]
pub fn extract_statement(reply: &str) -> Option<String> {
    if let Some(code) = extract_fenced(reply) {
        return Some(code);
    }
    let trimmed = reply.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// System prompt for result interpretation
#[must_use]
pub fn interpretation_system_prompt(engine: Option<DatabaseType>) -> String {
    let dialect = engine.map_or("SQL", dialect);
    format!(
        "You explain query results from a {dialect} database to the person who asked the question. \
         Answer in plain language and keep it short. If a follow-up query would help, \
         include it in a single fenced code block."
    )
}

/// User message carrying the question, statement and a sample of the rows
#[must_use]
pub fn interpretation_message(
    question: &str,
    sql: &str,
    columns: &[String],
    rows: &[ResultRow],
    row_count: usize,
) -> String {
    let mut out = format!("Question: {question}\n\nQuery:\n{sql}\n\nColumns: {}\n", columns.join(", "));
    let shown = rows.len().min(INTERPRET_SAMPLE_ROWS);
    out.push_str(&format!("Rows (first {shown} of {row_count}):\n"));
    for row in rows.iter().take(INTERPRET_SAMPLE_ROWS) {
        let cells: Vec<String> =
            columns.iter().map(|c| render_cell(row.get(c).unwrap_or(&Value::Null))).collect();
        out.push_str(&cells.join(" | "));
        out.push('\n');
    }
    out
}

fn render_cell(value: &Value) -> String {
    let text = match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > MAX_CELL_CHARS {
        let cut: String = text.chars().take(MAX_CELL_CHARS).collect();
        format!("{cut}...")
    } else {
        text
    }
}
