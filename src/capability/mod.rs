//! Statement Classification and Permission Checks
//!
//! Generated statements are classified as read, write or DDL before the NL
//! pipeline may propose or run them. Callers declare what they allow through
//! [`NlPermissions`]; anything beyond that is rejected without execution.
//!
//! # Classification Strategy
//! - Engine-specific keyword matching on the leading verb (no SQL parsing)
//! - Conservative: unknown verbs classify as DDL, the most privileged category
//! - Single statement only; multi-statement input is rejected
//! - `MongoDB` command documents are classified by their command name

use serde::{Deserialize, Serialize};

use crate::engine::DatabaseType;
use crate::error::{QuarryError, Result};

/// Statement category, ordered from least to most privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryCategory {
    /// SELECT, SHOW, DESCRIBE, EXPLAIN, read-only commands
    ReadOnly,
    /// INSERT, UPDATE, DELETE and other data modification
    Write,
    /// CREATE, DROP, ALTER and other schema modification
    Ddl,
}

impl QueryCategory {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::Write => "write",
            Self::Ddl => "ddl",
        }
    }
}

/// Caller-declared bounds for statements proposed by the NL pipeline
///
/// Defaults to the most restrictive settings (read-only).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NlPermissions {
    /// Allow write operations (INSERT, UPDATE, DELETE)
    #[serde(default)]
    pub allow_write: bool,

    /// Allow DDL operations (CREATE, DROP, ALTER, etc.)
    /// DDL implicitly grants write permission
    #[serde(default)]
    pub allow_ddl: bool,

    /// Maximum number of rows to return when executing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,
}

impl NlPermissions {
    #[must_use]
    pub fn read_only() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_write() -> Self {
        Self { allow_write: true, ..Default::default() }
    }

    /// DDL-enabled permissions (DDL implies write)
    #[must_use]
    pub fn with_ddl() -> Self {
        Self { allow_write: true, allow_ddl: true, ..Default::default() }
    }

    /// True if either `allow_write` or `allow_ddl` is set
    #[must_use]
    pub const fn can_write(&self) -> bool {
        self.allow_write || self.allow_ddl
    }

    #[must_use]
    pub const fn can_ddl(&self) -> bool {
        self.allow_ddl
    }

    /// Whether a statement of `category` may run
    #[must_use]
    pub const fn permits(&self, category: QueryCategory) -> bool {
        match category {
            QueryCategory::ReadOnly => true,
            QueryCategory::Write => self.can_write(),
            QueryCategory::Ddl => self.can_ddl(),
        }
    }

    /// One-line description for prompts and logs
    #[must_use]
    pub fn describe(&self) -> &'static str {
        if self.can_ddl() {
            "read, write and schema-changing statements are allowed"
        } else if self.can_write() {
            "read and data-modifying statements are allowed; schema changes are not"
        } else {
            "only read-only statements are allowed"
        }
    }
}

/// Classify a statement and check it against `permissions`
///
/// Returns the category on success; violations fail before any execution.
pub fn validate_query(
    sql: &str,
    permissions: &NlPermissions,
    engine: DatabaseType,
) -> Result<QueryCategory> {
    let category = classify(sql, engine)?;
    if permissions.permits(category) {
        return Ok(category);
    }

    let reason = if category == QueryCategory::Ddl {
        "Schema-modifying statements are not permitted"
    } else {
        "Write statements are not permitted"
    };
    Err(QuarryError::capability_violation(format!("{reason}: {}", sql.trim())))
}

/// Classify a single statement (or `MongoDB` command document)
pub fn classify(sql: &str, engine: DatabaseType) -> Result<QueryCategory> {
    if engine == DatabaseType::MongoDB {
        return classify_mongo_command(sql);
    }

    let processed = preprocess_sql(sql)?;
    let statement = strip_explain_prefix(&processed);
    Ok(classify_sql(statement, engine))
}

/// Pre-process SQL before categorization
///
/// Trims, strips comments, rejects empty and multi-statement input and
/// uppercases for keyword matching.
fn preprocess_sql(sql: &str) -> Result<String> {
    let processed = normalize(sql);
    if processed.is_empty() {
        return Err(QuarryError::invalid_input("Query cannot be empty"));
    }

    if has_multiple_statements(&processed) {
        return Err(QuarryError::invalid_input("Multi-statement queries are not supported"));
    }

    Ok(processed)
}

/// Comment-free, trimmed, uppercased form of a statement
#[must_use]
pub fn normalize(sql: &str) -> String {
    strip_comments(sql.trim()).trim().to_uppercase()
}

/// Strip SQL comments from query
///
/// Handles line comments (`--`) and block comments (`/* */`); quoted text is
/// left untouched.
pub(crate) fn strip_comments(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(ch) = chars.next() {
        if let Some(q) = quote {
            result.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => {
                quote = Some(ch);
                result.push(ch);
            }
            '-' if chars.peek() == Some(&'-') => {
                chars.next();
                for ch in chars.by_ref() {
                    if ch == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for ch in chars.by_ref() {
                    if prev == '*' && ch == '/' {
                        break;
                    }
                    prev = ch;
                }
                result.push(' ');
            }
            _ => result.push(ch),
        }
    }

    result
}

/// Semicolon outside quotes that is followed by more text
fn has_multiple_statements(sql: &str) -> bool {
    let body = sql.trim_end().trim_end_matches(';');
    let mut quote: Option<char> = None;
    for ch in body.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(ch),
            (None, ';') => return true,
            _ => {}
        }
    }
    false
}

/// Strip EXPLAIN / EXPLAIN ANALYZE / EXPLAIN QUERY PLAN prefixes
fn strip_explain_prefix(sql: &str) -> &str {
    let sql = sql.trim();
    for prefix in ["EXPLAIN QUERY PLAN", "EXPLAIN ANALYZE", "EXPLAIN"] {
        if let Some(stripped) = sql.strip_prefix(prefix) {
            return stripped.trim_start();
        }
    }
    sql
}

fn leading_keyword(sql: &str) -> &str {
    sql.split(|c: char| c.is_whitespace() || c == '(').find(|w| !w.is_empty()).unwrap_or("")
}

pub(crate) fn contains_word(sql: &str, word: &str) -> bool {
    sql.split(|c: char| !c.is_ascii_alphanumeric() && c != '_').any(|w| w == word)
}

/// Pragmas that take an argument yet only report state
const READ_ONLY_PRAGMAS: &[&str] = &[
    "TABLE_INFO",
    "TABLE_XINFO",
    "TABLE_LIST",
    "INDEX_LIST",
    "INDEX_INFO",
    "INDEX_XINFO",
    "FOREIGN_KEY_LIST",
    "FOREIGN_KEY_CHECK",
    "INTEGRITY_CHECK",
    "QUICK_CHECK",
];

/// Category of a `SELECT ... INTO` form, if it has side effects on `engine`
///
/// PostgreSQL and SQL Server create a table; MySQL writes a server-side file
/// with `INTO OUTFILE` / `INTO DUMPFILE` (`INTO @var` only sets a session variable).
fn select_into_category(sql: &str, engine: DatabaseType) -> Option<QueryCategory> {
    if !contains_word(sql, "INTO") {
        return None;
    }
    match engine {
        DatabaseType::Postgres | DatabaseType::Mssql => Some(QueryCategory::Ddl),
        DatabaseType::MySQL if contains_word(sql, "OUTFILE") || contains_word(sql, "DUMPFILE") => {
            Some(QueryCategory::Write)
        }
        _ => None,
    }
}

/// `PRAGMA name = value` and `PRAGMA name(value)` set state unless `name` is a reporting pragma
fn pragma_category(sql: &str) -> QueryCategory {
    if sql.contains('=') {
        return QueryCategory::Write;
    }
    let body = sql.trim_start_matches("PRAGMA").trim_start();
    let Some((name, _)) = body.split_once('(') else {
        return QueryCategory::ReadOnly;
    };
    // Strip a schema qualifier such as `main.`
    let name = name.trim();
    let name = name.rsplit_once('.').map_or(name, |(_, n)| n).trim();
    if READ_ONLY_PRAGMAS.contains(&name) {
        QueryCategory::ReadOnly
    } else {
        QueryCategory::Write
    }
}

fn classify_sql(sql: &str, engine: DatabaseType) -> QueryCategory {
    let keyword = leading_keyword(sql);
    match keyword {
        "SELECT" => select_into_category(sql, engine).unwrap_or(QueryCategory::ReadOnly),
        "WITH" => {
            if ["INSERT", "UPDATE", "DELETE", "MERGE"].iter().any(|w| contains_word(sql, w)) {
                QueryCategory::Write
            } else {
                select_into_category(sql, engine).unwrap_or(QueryCategory::ReadOnly)
            }
        }
        "VALUES" | "TABLE" | "BEGIN" | "COMMIT" | "ROLLBACK" | "START" | "SAVEPOINT"
        | "RELEASE" => QueryCategory::ReadOnly,
        "SHOW" | "DESCRIBE" | "DESC" if engine == DatabaseType::MySQL => QueryCategory::ReadOnly,
        "SHOW" if engine == DatabaseType::Postgres => QueryCategory::ReadOnly,
        "PRAGMA" if engine == DatabaseType::SQLite => pragma_category(sql),
        "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "REPLACE" | "UPSERT" | "COPY" | "CALL"
        | "EXEC" | "EXECUTE" | "LOCK" | "SET" | "LOAD" | "HANDLER" => QueryCategory::Write,
        _ => QueryCategory::Ddl,
    }
}

/// Classify a `MongoDB` command document by its command name
fn classify_mongo_command(input: &str) -> Result<QueryCategory> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(QuarryError::invalid_input("Query cannot be empty"));
    }
    if !trimmed.starts_with('{') {
        // Bare collection name means "find all"
        return Ok(QueryCategory::ReadOnly);
    }

    let doc: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| QuarryError::invalid_input(format!("Invalid MongoDB command document: {e}")))?;
    let object = doc
        .as_object()
        .ok_or_else(|| QuarryError::invalid_input("MongoDB command must be a JSON object"))?;
    let command = object
        .keys()
        .next()
        .ok_or_else(|| QuarryError::invalid_input("MongoDB command document is empty"))?;

    Ok(match command.as_str() {
        "aggregate" => {
            let writes = object
                .get("pipeline")
                .and_then(serde_json::Value::as_array)
                .is_some_and(|stages| {
                    stages.iter().any(|s| s.get("$out").is_some() || s.get("$merge").is_some())
                });
            if writes {
                QueryCategory::Write
            } else {
                QueryCategory::ReadOnly
            }
        }
        "find" | "count" | "countDocuments" | "distinct" | "listCollections" | "listIndexes"
        | "listDatabases" | "dbStats" | "collStats" | "ping" | "buildInfo" | "serverStatus"
        | "explain" | "hello" | "isMaster" => QueryCategory::ReadOnly,
        "insert" | "update" | "delete" | "findAndModify" | "findOneAndUpdate"
        | "findOneAndDelete" | "bulkWrite" => QueryCategory::Write,
        _ => QueryCategory::Ddl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Preprocessing tests

    #[test]
    fn test_preprocess_empty_query() {
        let result = preprocess_sql("   ");
        assert!(result.unwrap_err().message().contains("Query cannot be empty"));
    }

    #[test]
    fn test_preprocess_line_and_block_comments() {
        let result =
            preprocess_sql("SELECT * /* block */ FROM users -- trailing\nWHERE id = 1").unwrap();
        assert!(result.contains("FROM USERS"));
        assert!(!result.contains("BLOCK"));
        assert!(!result.contains("TRAILING"));
    }

    #[test]
    fn test_preprocess_multi_statement_detection() {
        let result = preprocess_sql("SELECT * FROM users; DROP TABLE users;");
        assert!(result.unwrap_err().message().contains("Multi-statement queries are not supported"));
    }

    #[test]
    fn test_preprocess_semicolon_inside_string_allowed() {
        assert!(preprocess_sql("SELECT * FROM notes WHERE body = 'a;b';").is_ok());
    }

    #[test]
    fn test_comment_markers_inside_strings_kept() {
        let result = normalize("SELECT '--not a comment' AS x");
        assert!(result.contains("'--NOT A COMMENT'"));
    }

    // Classification tests

    #[test]
    fn test_classify_reads() {
        for sql in ["SELECT 1", "select * from users", "WITH r AS (SELECT 1) SELECT * FROM r", "BEGIN"] {
            assert_eq!(classify(sql, DatabaseType::Postgres).unwrap(), QueryCategory::ReadOnly, "{sql}");
        }
        assert_eq!(classify("SHOW TABLES", DatabaseType::MySQL).unwrap(), QueryCategory::ReadOnly);
        assert_eq!(classify("DESCRIBE users", DatabaseType::MySQL).unwrap(), QueryCategory::ReadOnly);
        assert_eq!(
            classify("PRAGMA table_info(users)", DatabaseType::SQLite).unwrap(),
            QueryCategory::ReadOnly
        );
    }

    #[test]
    fn test_classify_explain_uses_inner_statement() {
        assert_eq!(
            classify("EXPLAIN ANALYZE SELECT * FROM users", DatabaseType::Postgres).unwrap(),
            QueryCategory::ReadOnly
        );
        assert_eq!(
            classify("EXPLAIN ANALYZE DELETE FROM users", DatabaseType::Postgres).unwrap(),
            QueryCategory::Write
        );
    }

    #[test]
    fn test_classify_writes() {
        for sql in [
            "INSERT INTO users (name) VALUES ('x')",
            "UPDATE users SET name = 'x'",
            "DELETE FROM users",
            "WITH gone AS (DELETE FROM users RETURNING *) SELECT * FROM gone",
        ] {
            assert_eq!(classify(sql, DatabaseType::Postgres).unwrap(), QueryCategory::Write, "{sql}");
        }
        assert_eq!(classify("REPLACE INTO t VALUES (1)", DatabaseType::MySQL).unwrap(), QueryCategory::Write);
        assert_eq!(classify("PRAGMA user_version = 3", DatabaseType::SQLite).unwrap(), QueryCategory::Write);
    }

    #[test]
    fn test_classify_ddl_and_unknown() {
        for sql in ["CREATE TABLE t (id INT)", "DROP TABLE t", "ALTER TABLE t ADD c INT", "TRUNCATE t", "VACUUM"] {
            assert_eq!(classify(sql, DatabaseType::SQLite).unwrap(), QueryCategory::Ddl, "{sql}");
        }
        assert_eq!(
            classify("SELECT * INTO backup_users FROM users", DatabaseType::Postgres).unwrap(),
            QueryCategory::Ddl
        );
    }

    #[test]
    fn test_classify_mongo_commands() {
        let read = r#"{"find": "users", "filter": {"age": {"$gt": 30}}}"#;
        assert_eq!(classify(read, DatabaseType::MongoDB).unwrap(), QueryCategory::ReadOnly);
        assert_eq!(classify("users", DatabaseType::MongoDB).unwrap(), QueryCategory::ReadOnly);

        let out = r#"{"aggregate": "users", "pipeline": [{"$match": {}}, {"$out": "copy"}]}"#;
        assert_eq!(classify(out, DatabaseType::MongoDB).unwrap(), QueryCategory::Write);

        let drop = r#"{"drop": "users"}"#;
        assert_eq!(classify(drop, DatabaseType::MongoDB).unwrap(), QueryCategory::Ddl);

        assert!(classify("{not json", DatabaseType::MongoDB).is_err());
    }

    // Permission tests

    #[test]
    fn test_permissions_hierarchy() {
        let perms = NlPermissions { allow_write: false, allow_ddl: true, max_rows: None };
        assert!(perms.can_write());
        assert!(perms.can_ddl());
        assert!(!NlPermissions::read_only().can_write());
        assert!(NlPermissions::with_write().permits(QueryCategory::Write));
        assert!(!NlPermissions::with_write().permits(QueryCategory::Ddl));
    }

    #[test]
    fn test_validate_query_rejects_write_when_read_only() {
        let err = validate_query(
            "INSERT INTO users (name) VALUES ('test')",
            &NlPermissions::read_only(),
            DatabaseType::Postgres,
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "CAPABILITY_VIOLATION");
        assert!(err.message().contains("Write statements are not permitted"));
    }

    #[test]
    fn test_validate_query_rejects_ddl_with_write_only() {
        let err = validate_query("DROP TABLE users", &NlPermissions::with_write(), DatabaseType::MySQL)
            .unwrap_err();
        assert!(err.message().contains("Schema-modifying statements are not permitted"));
    }

    #[test]
    fn test_select_forms_with_side_effects_are_not_reads() {
        let cases = [
            ("SELECT * FROM users INTO OUTFILE '/tmp/users.csv'", DatabaseType::MySQL, QueryCategory::Write),
            ("SELECT data INTO DUMPFILE '/tmp/blob' FROM files", DatabaseType::MySQL, QueryCategory::Write),
            ("WITH x AS (SELECT 1 AS a) SELECT * INTO stolen FROM x", DatabaseType::Postgres, QueryCategory::Ddl),
            ("WITH x AS (SELECT 1 AS a) SELECT * INTO stolen FROM x", DatabaseType::Mssql, QueryCategory::Ddl),
            ("PRAGMA journal_mode(DELETE)", DatabaseType::SQLite, QueryCategory::Write),
            ("PRAGMA main.user_version(7)", DatabaseType::SQLite, QueryCategory::Write),
        ];
        for (sql, engine, expected) in cases {
            assert_eq!(classify(sql, engine).unwrap(), expected, "{sql}");
            let err = validate_query(sql, &NlPermissions::read_only(), engine).unwrap_err();
            assert_eq!(err.error_code(), "CAPABILITY_VIOLATION", "{sql}");
        }
    }

    #[test]
    fn test_harmless_select_into_and_reporting_pragmas_stay_reads() {
        assert_eq!(
            classify("SELECT COUNT(*) INTO @n FROM users", DatabaseType::MySQL).unwrap(),
            QueryCategory::ReadOnly
        );
        assert_eq!(classify("PRAGMA journal_mode", DatabaseType::SQLite).unwrap(), QueryCategory::ReadOnly);
        assert_eq!(
            classify("PRAGMA main.index_list(users)", DatabaseType::SQLite).unwrap(),
            QueryCategory::ReadOnly
        );
    }

    #[test]
    fn test_validate_query_accepts_permitted() {
        let category =
            validate_query("UPDATE users SET a = 1", &NlPermissions::with_write(), DatabaseType::SQLite)
                .unwrap();
        assert_eq!(category, QueryCategory::Write);
        assert!(validate_query("CREATE INDEX i ON t (c)", &NlPermissions::with_ddl(), DatabaseType::SQLite).is_ok());
    }
}
