//! Output Validation Tests
//!
//! The CLI prints exactly one JSON envelope per command. These tests pin the
//! envelope shapes and check that real driver output serializes into them cleanly.

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use quarry::{DatabaseType, ErrorEnvelope, ErrorInfo, Metadata, QuarryError, SuccessEnvelope};

fn keys(value: &Value) -> Vec<&str> {
    value.as_object().unwrap().keys().map(String::as_str).collect()
}

// ============================================================================
// Envelope Structure Tests
// ============================================================================

#[test]
fn test_success_envelope_structure() {
    let envelope = SuccessEnvelope::new(
        Some(DatabaseType::Postgres),
        "query",
        json!({"rows": []}),
        Metadata::with_rows(42, 0),
    );

    let value = serde_json::to_value(&envelope).unwrap();
    assert_eq!(keys(&value), vec!["ok", "engine", "command", "data", "meta"]);
    assert_eq!(value["ok"], true);
    assert_eq!(value["engine"], "postgresql");
    assert_eq!(value["meta"], json!({"execution_ms": 42, "rows_returned": 0}));
}

#[test]
fn test_error_envelope_structure() {
    let envelope = ErrorEnvelope::new(Some(DatabaseType::SQLite), "tables", ErrorInfo::new("NOT_FOUND", "gone"));

    let value = serde_json::to_value(&envelope).unwrap();
    assert_eq!(keys(&value), vec!["ok", "engine", "command", "error"]);
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"], json!({"code": "NOT_FOUND", "message": "gone"}));
}

#[test]
fn test_envelope_without_engine_omits_field() {
    let err = QuarryError::config_error("Profile 'prod' not found");
    let value = serde_json::to_value(ErrorEnvelope::from_error(None, "connect", &err)).unwrap();

    assert_eq!(keys(&value), vec!["ok", "command", "error"]);
    assert_eq!(value["error"]["code"], "CONFIG_ERROR");
    assert_eq!(value["error"]["message"], "Configuration error: Profile 'prod' not found");
}

#[test]
fn test_error_codes_are_stable_and_distinct() {
    let errors = [
        QuarryError::connection_failed("x"),
        QuarryError::authentication("x"),
        QuarryError::network("x"),
        QuarryError::not_found("x"),
        QuarryError::unsupported_engine("x"),
        QuarryError::external_tool("pg_dump", "x"),
        QuarryError::query_failed("x"),
        QuarryError::cancelled("x"),
        QuarryError::capability_violation("x"),
        QuarryError::invalid_input("x"),
        QuarryError::engine_error("sqlite", "x"),
        QuarryError::config_error("x"),
        QuarryError::vault("x"),
        QuarryError::reasoning("x"),
    ];

    let mut codes: Vec<&str> = errors.iter().map(QuarryError::error_code).collect();
    assert!(codes.iter().all(|c| c.chars().all(|ch| ch.is_ascii_uppercase() || ch == '_')));
    codes.sort_unstable();
    codes.dedup();
    assert_eq!(codes.len(), errors.len());
}

// ============================================================================
// Real Driver Output
// ============================================================================

#[cfg(feature = "sqlite")]
mod sqlite_output {
    use super::*;
    use quarry::engine::sqlite::SqliteDriver;
    use quarry::{ConnectionConfig, Driver};

    async fn driver() -> SqliteDriver {
        let driver = SqliteDriver::new();
        driver.connect(&ConnectionConfig::sqlite(":memory:")).await.unwrap();
        driver
            .execute_query(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, note TEXT)",
                None,
                None,
            )
            .await
            .unwrap();
        driver.execute_query("INSERT INTO users (name, note) VALUES ('Ann', NULL)", None, None).await.unwrap();
        driver
    }

    #[tokio::test]
    async fn test_query_result_in_envelope() {
        let driver = driver().await;
        let result = driver.execute_query("SELECT id, name, note FROM users", None, None).await.unwrap();
        let rows = result.row_count;

        let envelope =
            SuccessEnvelope::new(Some(DatabaseType::SQLite), "query", result, Metadata::with_rows(3, rows));
        let text = serde_json::to_string(&envelope).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["engine"], "sqlite");
        assert_eq!(value["data"]["columns"], json!(["id", "name", "note"]));
        assert_eq!(value["data"]["rows"], json!([{"id": 1, "name": "Ann", "note": null}]));
        assert!(value["data"].get("error").is_none());
        assert!(value["data"].get("rows_affected").is_none());
        assert!(!text.contains('\n'));
    }

    #[tokio::test]
    async fn test_table_info_in_envelope() {
        let driver = driver().await;
        let info = driver.get_table_info("users", None).await.unwrap();

        let value = serde_json::to_value(SuccessEnvelope::new(
            Some(DatabaseType::SQLite),
            "describe",
            info,
            Metadata::new(1),
        ))
        .unwrap();

        let data = &value["data"];
        assert_eq!(data["name"], "users");
        assert!(data.get("schema").is_none());
        assert!(data.get("indexes").is_none());
        assert_eq!(data["columns"][0]["name"], "id");
        assert_eq!(data["columns"][0]["primary_key"], true);
        assert_eq!(data["columns"][1]["nullable"], false);
        assert_eq!(data["row_count"], 1);
    }
}
