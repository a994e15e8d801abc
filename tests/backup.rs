//! Backup Service Tests
//!
//! Dump tools are replaced by a recording runner that writes plausible output, so
//! command construction, manifest bookkeeping and cleanup can be checked without
//! `pg_dump` and friends installed.

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use quarry::backup::{BackupManifest, BackupOptions, BackupService, ToolCommand, ToolRunner, MANIFEST_FILE};
use quarry::engine::{ConnectionConfig, DatabaseType};
use quarry::error::{QuarryError, Result};

// ============================================================================
// Test Helpers
// ============================================================================

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_root() -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let root = std::env::temp_dir().join(format!("quarry_backup_test_{}_{id}", std::process::id()));
    let _ = std::fs::remove_dir_all(&root);
    root
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Succeed,
    FailAfterPartialWrite,
    WaitForCancel,
}

struct RecordingRunner {
    mode: Mode,
    calls: Mutex<Vec<ToolCommand>>,
    /// Contents of `--config=` files as seen while the tool ran
    configs: Mutex<Vec<String>>,
}

impl RecordingRunner {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self { mode, calls: Mutex::new(Vec::new()), configs: Mutex::new(Vec::new()) })
    }

    fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ToolRunner for RecordingRunner {
    async fn run(&self, command: &ToolCommand, cancel: &CancellationToken) -> Result<()> {
        self.calls.lock().push(command.clone());

        for arg in &command.args {
            if let Some(path) = arg.strip_prefix("--config=") {
                self.configs.lock().push(std::fs::read_to_string(path).unwrap());
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let mode = std::fs::metadata(path).unwrap().permissions().mode();
                    assert_eq!(mode & 0o777, 0o600);
                }
            }
        }

        let output = command
            .stdout
            .clone()
            .or_else(|| command.args.iter().find_map(|a| a.strip_prefix("--archive=").map(PathBuf::from)));

        match self.mode {
            Mode::Succeed => {
                if let Some(path) = output {
                    std::fs::write(path, "-- dump output\nCREATE TABLE t (id int);\n").unwrap();
                }
                Ok(())
            }
            Mode::FailAfterPartialWrite => {
                if let Some(path) = output {
                    std::fs::write(path, "-- partial").unwrap();
                }
                Err(QuarryError::external_tool(
                    command.program.clone(),
                    "connection to server failed: Connection refused",
                ))
            }
            Mode::WaitForCancel => {
                cancel.cancelled().await;
                Err(QuarryError::cancelled(format!("{} was cancelled", command.program)))
            }
        }
    }
}

fn pg_config() -> ConnectionConfig {
    ConnectionConfig::network(DatabaseType::Postgres, "localhost", 5432, "postgres", "hunter2", "mydb")
}

fn sqlite_source(root: &std::path::Path, name: &str) -> ConnectionConfig {
    std::fs::create_dir_all(root).unwrap();
    let db = root.join(name);
    std::fs::write(&db, b"SQLite format 3\0 pretend").unwrap();
    ConnectionConfig::sqlite(&db)
}

fn manifest_entries(root: &std::path::Path, connection_id: &str) -> usize {
    BackupManifest::load(&root.join(connection_id).join(MANIFEST_FILE)).unwrap().entries.len()
}

// ============================================================================
// Backup
// ============================================================================

#[tokio::test]
async fn test_postgres_backup_records_entry() {
    let root = temp_root();
    let runner = RecordingRunner::new(Mode::Succeed);
    let service = BackupService::new(&root, runner.clone());

    let outcome = service
        .backup("pg-1", "My PG", &pg_config(), &BackupOptions::default(), Some("staging"))
        .await
        .unwrap();

    assert_eq!(outcome.entry.engine, DatabaseType::Postgres);
    assert_eq!(outcome.entry.database, "mydb");
    assert_eq!(outcome.entry.connection_name, "My PG");
    assert_eq!(outcome.entry.environment.as_deref(), Some("staging"));
    assert!(outcome.entry.file_path.is_absolute());
    assert_eq!(outcome.path.extension().and_then(|e| e.to_str()), Some("sql"));
    assert!(outcome.size > 0);
    assert_eq!(outcome.size, outcome.entry.size);

    let command = outcome.command.unwrap();
    assert!(command.contains("pg_dump"));
    assert!(command.contains("-p 5432"));
    assert!(command.contains("PGPASSWORD="));
    assert!(!command.contains("hunter2"));

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].env_value("PGPASSWORD"), Some("hunter2"));

    let listed = service.list_backups("pg-1").unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0], outcome.entry);
}

#[tokio::test]
async fn test_mssql_is_rejected_before_any_tool_runs() {
    let root = temp_root();
    let runner = RecordingRunner::new(Mode::Succeed);
    let service = BackupService::new(&root, runner.clone());
    let config = ConnectionConfig::network(DatabaseType::Mssql, "localhost", 1433, "sa", "pw", "master");

    let err = service.backup("sql-1", "SQL", &config, &BackupOptions::default(), None).await.unwrap_err();
    assert_eq!(err.error_code(), "UNSUPPORTED_ENGINE");
    assert!(err.message().contains("MSSQL"));

    // Restore with an MSSQL target is rejected the same way
    let pg = service.backup("pg-1", "PG", &pg_config(), &BackupOptions::default(), None).await.unwrap();
    runner.calls.lock().clear();
    let err = service.restore(&pg.entry, &config).await.unwrap_err();
    assert_eq!(err.error_code(), "UNSUPPORTED_ENGINE");
    assert!(err.message().contains("MSSQL"));

    assert!(runner.calls().is_empty());
    assert!(!root.join("sql-1").exists());
}

#[tokio::test]
async fn test_failed_backup_leaves_no_trace() {
    let root = temp_root();
    let service = BackupService::new(&root, RecordingRunner::new(Mode::FailAfterPartialWrite));

    let err = service.backup("pg-1", "PG", &pg_config(), &BackupOptions::default(), None).await.unwrap_err();
    assert_eq!(err.error_code(), "EXTERNAL_TOOL_FAILED");
    assert!(err.message().contains("Connection refused"));

    let leftovers: Vec<_> = std::fs::read_dir(root.join("pg-1")).unwrap().flatten().collect();
    assert!(leftovers.is_empty(), "partial files left: {leftovers:?}");
    assert_eq!(manifest_entries(&root, "pg-1"), 0);
}

#[tokio::test]
async fn test_conflicting_options_are_rejected() {
    let service = BackupService::new(temp_root(), RecordingRunner::new(Mode::Succeed));
    let options = BackupOptions { data_only: true, schema_only: true, tables: vec![] };
    let err = service.backup("pg-1", "PG", &pg_config(), &options, None).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_INPUT");
}

#[tokio::test]
async fn test_mysql_backup_uses_env_password() {
    let runner = RecordingRunner::new(Mode::Succeed);
    let service = BackupService::new(temp_root(), runner.clone());
    let config = ConnectionConfig::network(DatabaseType::MySQL, "db", 3306, "root", "pw", "shop");
    let options = BackupOptions { schema_only: true, tables: vec!["orders".into()], ..Default::default() };

    service.backup("my-1", "MySQL", &config, &options, None).await.unwrap();

    let call = &runner.calls()[0];
    assert_eq!(call.program, "mysqldump");
    assert!(call.args.contains(&"--no-data".to_string()));
    assert_eq!(call.args.last().map(String::as_str), Some("orders"));
    assert_eq!(call.env_value("MYSQL_PWD"), Some("pw"));
}

#[tokio::test]
async fn test_mongo_password_goes_through_private_config() {
    let root = temp_root();
    let runner = RecordingRunner::new(Mode::Succeed);
    let service = BackupService::new(&root, runner.clone());
    let config = ConnectionConfig::network(DatabaseType::MongoDB, "localhost", 27017, "admin", "s3cret", "app");

    let outcome = service.backup("mongo-1", "Mongo", &config, &BackupOptions::default(), None).await.unwrap();
    assert_eq!(outcome.path.extension().and_then(|e| e.to_str()), Some("archive"));

    let call = &runner.calls()[0];
    assert_eq!(call.program, "mongodump");
    assert!(call.args.iter().all(|a| !a.contains("s3cret")));
    assert!(call.args.contains(&"--db".to_string()));
    assert_eq!(runner.configs.lock().as_slice(), ["password: 's3cret'\n".to_string()]);

    let config_arg = call.args.iter().find_map(|a| a.strip_prefix("--config=")).unwrap();
    assert!(!std::path::Path::new(config_arg).exists());
}

#[tokio::test]
async fn test_sqlite_default_backup_copies_file() {
    let root = temp_root();
    let runner = RecordingRunner::new(Mode::Succeed);
    let service = BackupService::new(&root, runner.clone());

    std::fs::create_dir_all(&root).unwrap();
    let db = root.join("app.db");
    std::fs::write(&db, b"SQLite format 3\0 pretend").unwrap();

    let outcome = service
        .backup("lite", "Lite", &ConnectionConfig::sqlite(&db), &BackupOptions::default(), None)
        .await
        .unwrap();
    assert!(outcome.command.is_none());
    assert_eq!(outcome.entry.database, "app");
    assert_eq!(outcome.path.extension().and_then(|e| e.to_str()), Some("sqlite"));
    assert_eq!(std::fs::read(&outcome.path).unwrap(), std::fs::read(&db).unwrap());

    // Restoring a copy writes the file back
    std::fs::write(&db, b"changed").unwrap();
    service.restore(&outcome.entry, &ConnectionConfig::sqlite(&db)).await.unwrap();
    assert_eq!(std::fs::read(&db).unwrap(), b"SQLite format 3\0 pretend");
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_spawned_backup_can_be_cancelled() {
    let root = temp_root();
    let service = Arc::new(BackupService::new(&root, RecordingRunner::new(Mode::WaitForCancel)));

    let task = service.spawn_backup("pg-1".into(), "PG".into(), pg_config(), BackupOptions::default(), None);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    task.cancel();

    let err = task.join().await.unwrap_err();
    assert_eq!(err.error_code(), "CANCELLED");
    assert_eq!(manifest_entries(&root, "pg-1"), 0);
}

// ============================================================================
// Listing, deletion, restore
// ============================================================================

#[tokio::test]
async fn test_list_skips_entries_with_missing_files() {
    let root = temp_root();
    let service = BackupService::new(&root, RecordingRunner::new(Mode::Succeed));

    let first = service.backup("pg-1", "PG", &pg_config(), &BackupOptions::default(), None).await.unwrap();
    let second = service.backup("pg-1", "PG", &pg_config(), &BackupOptions::default(), None).await.unwrap();
    assert_ne!(first.path, second.path);
    assert_eq!(service.list_backups("pg-1").unwrap().len(), 2);

    std::fs::remove_file(&first.path).unwrap();
    let listed = service.list_backups("pg-1").unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, second.entry.id);

    // Listing never rewrites the manifest
    assert_eq!(manifest_entries(&root, "pg-1"), 2);
    assert!(service.list_backups("never-backed-up").unwrap().is_empty());
}

#[tokio::test]
async fn test_similar_connection_ids_keep_separate_backups() {
    let root = temp_root();
    let service = Arc::new(BackupService::new(&root, RecordingRunner::new(Mode::Succeed)));
    let config = sqlite_source(&root, "app.db");

    let (spaced, underscored) = tokio::join!(
        service.backup("my db", "A", &config, &BackupOptions::default(), None),
        service.backup("my_db", "B", &config, &BackupOptions::default(), None),
    );
    let (spaced, underscored) = (spaced.unwrap(), underscored.unwrap());
    assert_ne!(spaced.path.parent(), underscored.path.parent());

    let names = |id: &str| -> Vec<String> {
        service.list_backups(id).unwrap().into_iter().map(|e| e.connection_name).collect()
    };
    assert_eq!(names("my db"), vec!["A"]);
    assert_eq!(names("my_db"), vec!["B"]);

    // Deleting through the other id cannot reach this connection's backup
    let err = service.delete_backup("my_db", &spaced.entry.id).await.unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
    assert!(spaced.path.exists());

    service.delete_backup("my db", &spaced.entry.id).await.unwrap();
    assert!(service.list_backups("my db").unwrap().is_empty());
    assert_eq!(names("my_db"), vec!["B"]);
}

#[tokio::test]
async fn test_delete_backup() {
    let root = temp_root();
    let service = BackupService::new(&root, RecordingRunner::new(Mode::Succeed));
    let outcome = service.backup("pg-1", "PG", &pg_config(), &BackupOptions::default(), None).await.unwrap();

    let err = service.delete_backup("pg-1", "no-such-id").await.unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
    assert!(err.message().contains("Backup not found"));
    assert!(outcome.path.exists());

    service.delete_backup("pg-1", &outcome.entry.id).await.unwrap();
    assert!(!outcome.path.exists());
    assert!(service.list_backups("pg-1").unwrap().is_empty());
    assert_eq!(manifest_entries(&root, "pg-1"), 0);

    let err = service.delete_backup("pg-1", &outcome.entry.id).await.unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
}

#[tokio::test]
async fn test_restore_postgres_runs_psql() {
    let runner = RecordingRunner::new(Mode::Succeed);
    let service = BackupService::new(temp_root(), runner.clone());
    let outcome = service.backup("pg-1", "PG", &pg_config(), &BackupOptions::default(), None).await.unwrap();

    service.restore(&outcome.entry, &pg_config()).await.unwrap();

    let call = &runner.calls()[1];
    assert_eq!(call.program, "psql");
    assert_eq!(&call.args[..2], ["-v", "ON_ERROR_STOP=1"]);
    assert_eq!(call.args.last(), Some(&outcome.path.display().to_string()));
    assert_eq!(call.env_value("PGPASSWORD"), Some("hunter2"));
}

#[tokio::test]
async fn test_restore_missing_file_and_engine_mismatch() {
    let runner = RecordingRunner::new(Mode::Succeed);
    let service = BackupService::new(temp_root(), runner.clone());
    let outcome = service.backup("pg-1", "PG", &pg_config(), &BackupOptions::default(), None).await.unwrap();

    let mysql = ConnectionConfig::network(DatabaseType::MySQL, "db", 3306, "root", "pw", "shop");
    let err = service.restore(&outcome.entry, &mysql).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_INPUT");

    std::fs::remove_file(&outcome.path).unwrap();
    let err = service.restore(&outcome.entry, &pg_config()).await.unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
    assert!(err.message().contains("Backup file not found"));
    assert_eq!(runner.calls().len(), 1);
}
