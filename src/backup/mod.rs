//! Backup and Restore
//!
//! Backups shell out to the engine's own dump tools (`pg_dump`, `mysqldump`,
//! `mongodump`, `sqlite3`) or copy the `SQLite` file. Every completed backup is
//! recorded in a per-connection manifest (see [`manifest`]).
//!
//! # Layout
//! ```text
//! <backups_root>/<percent-encoded connection_id>/manifest.json
//! <backups_root>/<percent-encoded connection_id>/<database>_<YYYYMMDD_HHMMSS_mmm>.<ext>
//! ```
//!
//! # Secrets
//! Passwords never appear on a command line. `PostgreSQL` and `MySQL` read them from
//! `PGPASSWORD` / `MYSQL_PWD`; the Mongo tools get a private `--config` file that is
//! removed once the tool exits.
//!
//! SQL Server has no supported dump tool and is rejected before anything runs.

pub mod manifest;
pub mod tools;

use chrono::Utc;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{parse_url_connection, ConnectionConfig, DatabaseType};
use crate::error::{QuarryError, Result};

pub use manifest::{BackupEntry, BackupManifest, MANIFEST_FILE, MANIFEST_VERSION};
pub use tools::{augmented_path, ProcessRunner, ToolCommand, ToolRunner};

/// What to include in a backup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupOptions {
    pub data_only: bool,
    pub schema_only: bool,
    /// Restrict to these tables (collections for `MongoDB`); empty means all
    pub tables: Vec<String>,
}

impl BackupOptions {
    #[must_use]
    pub fn is_default(&self) -> bool {
        !self.data_only && !self.schema_only && self.tables.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.data_only && self.schema_only {
            return Err(QuarryError::invalid_input("data_only and schema_only are mutually exclusive"));
        }
        Ok(())
    }
}

/// Result of a successful backup
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub entry: BackupEntry,
    pub path: PathBuf,
    pub size: u64,
    /// Rendered command with secrets masked (`None` for a file copy)
    pub command: Option<String>,
}

/// A backup running on its own task
pub struct BackupTask {
    cancel: CancellationToken,
    pub handle: JoinHandle<Result<BackupOutcome>>,
}

impl BackupTask {
    /// Kill the dump process; the task then resolves to `Cancelled`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this backup, for callers that outlive the borrow
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn join(self) -> Result<BackupOutcome> {
        self.handle
            .await
            .map_err(|e| QuarryError::engine_error("backup", format!("backup task failed: {e}")))?
    }
}

/// Creates, lists, deletes and restores backups
pub struct BackupService {
    root: PathBuf,
    runner: Arc<dyn ToolRunner>,
    manifest_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BackupService {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, runner: Arc<dyn ToolRunner>) -> Self {
        Self { root: root.into(), runner, manifest_locks: Mutex::new(HashMap::new()) }
    }

    /// Service running real tools as child processes
    #[must_use]
    pub fn with_process_runner(root: impl Into<PathBuf>) -> Self {
        Self::new(root, Arc::new(ProcessRunner))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn connection_dir(&self, connection_id: &str) -> PathBuf {
        self.root.join(connection_key(connection_id))
    }

    fn manifest_path(&self, connection_id: &str) -> PathBuf {
        self.connection_dir(connection_id).join(MANIFEST_FILE)
    }

    fn manifest_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.manifest_locks.lock().entry(key.to_string()).or_default().clone()
    }

    /// Drop the map entry for `key` once no other task holds or awaits it
    fn release_manifest_lock(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.manifest_locks.lock();
        // The map's clone plus ours
        if Arc::strong_count(&lock) == 2 && locks.get(key).is_some_and(|held| Arc::ptr_eq(held, &lock)) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.manifest_locks.lock().len()
    }

    async fn append_entry(&self, entry: &BackupEntry) -> Result<()> {
        let key = connection_key(&entry.connection_id);
        let lock = self.manifest_lock(&key);
        let saved = {
            let _guard = lock.lock().await;
            let manifest_path = self.manifest_path(&entry.connection_id);
            BackupManifest::load(&manifest_path).and_then(|mut manifest| {
                manifest.entries.push(entry.clone());
                manifest.save(&manifest_path)
            })
        };
        self.release_manifest_lock(&key, lock);
        saved
    }

    /// Back up `config`'s database and record it in the manifest
    pub async fn backup(
        &self,
        connection_id: &str,
        connection_name: &str,
        config: &ConnectionConfig,
        options: &BackupOptions,
        environment: Option<&str>,
    ) -> Result<BackupOutcome> {
        self.backup_with_cancel(
            connection_id,
            connection_name,
            config,
            options,
            environment,
            &CancellationToken::new(),
        )
        .await
    }

    /// Run [`Self::backup`] on a separate task that can be cancelled
    pub fn spawn_backup(
        self: &Arc<Self>,
        connection_id: String,
        connection_name: String,
        config: ConnectionConfig,
        options: BackupOptions,
        environment: Option<String>,
    ) -> BackupTask {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            service
                .backup_with_cancel(
                    &connection_id,
                    &connection_name,
                    &config,
                    &options,
                    environment.as_deref(),
                    &token,
                )
                .await
        });
        BackupTask { cancel, handle }
    }

    async fn backup_with_cancel(
        &self,
        connection_id: &str,
        connection_name: &str,
        config: &ConnectionConfig,
        options: &BackupOptions,
        environment: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BackupOutcome> {
        if config.engine == DatabaseType::Mssql {
            return Err(QuarryError::unsupported_engine("MSSQL backup is not supported"));
        }
        options.validate()?;

        let dir = self.connection_dir(connection_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            QuarryError::config_error(format!("Failed to create backup directory {}: {e}", dir.display()))
        })?;
        let dir = absolute(&dir);

        let database = config.database_label();
        let extension = backup_extension(config.engine, options);
        let path = unique_backup_path(&dir, &database, extension);

        let command = match self.run_backup(config, options, &path, cancel).await {
            Ok(command) => command,
            Err(e) => {
                if path.exists() {
                    if let Err(rm) = tokio::fs::remove_file(&path).await {
                        warn!(path = %path.display(), error = %rm, "failed to remove partial backup");
                    }
                }
                warn!(connection_id = %connection_id, engine = %config.engine, code = e.error_code(), "backup failed");
                return Err(e);
            }
        };

        let size = tokio::fs::metadata(&path).await.map(|m| m.len()).map_err(|e| {
            QuarryError::external_tool("backup", format!("backup file missing after tool exit: {e}"))
        })?;

        let entry = BackupEntry {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            connection_name: connection_name.to_string(),
            engine: config.engine,
            database,
            created_at: Utc::now(),
            file_path: path.clone(),
            size,
            environment: environment.map(str::to_string),
        };

        self.append_entry(&entry).await?;

        info!(connection_id = %connection_id, engine = %config.engine, size, "backup created");
        Ok(BackupOutcome { entry, path, size, command })
    }

    /// Build and run the engine-specific dump; returns the masked command line
    async fn run_backup(
        &self,
        config: &ConnectionConfig,
        options: &BackupOptions,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let command = match config.engine {
            DatabaseType::Postgres => pg_dump_command(&network_fields(config)?, options, path),
            DatabaseType::MySQL => mysqldump_command(&network_fields(config)?, options, path)?,
            DatabaseType::SQLite => {
                let source = sqlite_file(config)?;
                if options.is_default() {
                    tokio::fs::copy(&source, path).await.map_err(|e| {
                        QuarryError::external_tool("copy", format!("{}: {e}", source.display()))
                    })?;
                    return Ok(None);
                }
                sqlite_dump_command(&source, options, path)
            }
            DatabaseType::MongoDB => {
                let (uri, password) = mongo_uri(config)?;
                let mut command =
                    ToolCommand::new("mongodump").arg(format!("--uri={uri}")).arg(format!("--archive={}", path.display()));
                if options.schema_only {
                    return Err(QuarryError::invalid_input("MongoDB backups cannot be schema-only"));
                }
                if let Some(db) = config.database.as_deref().filter(|d| !d.is_empty()) {
                    command = command.arg("--db").arg(db);
                }
                match options.tables.as_slice() {
                    [] => {}
                    [collection] => command = command.arg("--collection").arg(collection),
                    _ => return Err(QuarryError::invalid_input("mongodump accepts a single collection")),
                }
                return self.run_with_mongo_config(command, password, path, cancel).await.map(Some);
            }
            DatabaseType::Mssql => return Err(QuarryError::unsupported_engine("MSSQL backup is not supported")),
        };

        self.runner.run(&command, cancel).await?;
        Ok(Some(command.to_string()))
    }

    /// Run a Mongo tool with the password in a private config file
    async fn run_with_mongo_config(
        &self,
        mut command: ToolCommand,
        password: Option<String>,
        near: &Path,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let Some(password) = password else {
            self.runner.run(&command, cancel).await?;
            return Ok(command.to_string());
        };

        let dir = near.parent().map_or_else(std::env::temp_dir, Path::to_path_buf);
        let config_path = dir.join(format!(".mongo-{}.yaml", uuid::Uuid::new_v4()));
        write_private_file(&config_path, &format!("password: '{}'\n", password.replace('\'', "''")))?;
        command = command.arg(format!("--config={}", config_path.display()));

        let result = self.runner.run(&command, cancel).await;
        if let Err(e) = std::fs::remove_file(&config_path) {
            warn!(path = %config_path.display(), error = %e, "failed to remove mongo tool config");
        }
        result.map(|()| command.to_string())
    }

    /// Restore `entry` into the database described by `target`
    pub async fn restore(&self, entry: &BackupEntry, target: &ConnectionConfig) -> Result<()> {
        self.restore_with_cancel(entry, target, &CancellationToken::new()).await
    }

    pub async fn restore_with_cancel(
        &self,
        entry: &BackupEntry,
        target: &ConnectionConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if entry.engine == DatabaseType::Mssql || target.engine == DatabaseType::Mssql {
            return Err(QuarryError::unsupported_engine("MSSQL restore is not supported"));
        }
        if !entry.file_path.exists() {
            return Err(QuarryError::not_found(format!(
                "Backup file not found: {}",
                entry.file_path.display()
            )));
        }
        if entry.engine != target.engine {
            return Err(QuarryError::invalid_input(format!(
                "A {} backup cannot be restored into {}",
                entry.engine.display_name(),
                target.engine.display_name()
            )));
        }

        let file = &entry.file_path;
        let command = match target.engine {
            DatabaseType::Postgres => {
                let fields = network_fields(target)?;
                let mut command = ToolCommand::new("psql").args(["-v", "ON_ERROR_STOP=1"]);
                command = with_pg_connection(command, &fields);
                command = command.arg("-f").arg(file.display().to_string());
                command
            }
            DatabaseType::MySQL => {
                let fields = network_fields(target)?;
                let database = fields
                    .database
                    .clone()
                    .filter(|d| !d.is_empty())
                    .ok_or_else(|| QuarryError::invalid_input("MySQL restore requires a target database"))?;
                with_mysql_connection(ToolCommand::new("mysql"), &fields).arg(database).stdin_from(file)
            }
            DatabaseType::MongoDB => {
                let (uri, password) = mongo_uri(target)?;
                let command = ToolCommand::new("mongorestore")
                    .arg(format!("--uri={uri}"))
                    .arg(format!("--archive={}", file.display()));
                self.run_with_mongo_config(command, password, file, cancel).await?;
                info!(backup_id = %entry.id, "restore completed");
                return Ok(());
            }
            DatabaseType::SQLite => {
                let target_file = sqlite_file(target)?;
                if file.extension().and_then(|e| e.to_str()) == Some("sql") {
                    ToolCommand::new("sqlite3").arg(target_file.display().to_string()).stdin_from(file)
                } else {
                    tokio::fs::copy(file, &target_file).await.map_err(|e| {
                        QuarryError::external_tool("copy", format!("{}: {e}", target_file.display()))
                    })?;
                    info!(backup_id = %entry.id, "restore completed");
                    return Ok(());
                }
            }
            DatabaseType::Mssql => return Err(QuarryError::unsupported_engine("MSSQL restore is not supported")),
        };

        debug!(command = %command, "restoring backup");
        self.runner.run(&command, cancel).await?;
        info!(backup_id = %entry.id, "restore completed");
        Ok(())
    }

    /// Recorded backups whose files still exist, newest first
    pub fn list_backups(&self, connection_id: &str) -> Result<Vec<BackupEntry>> {
        let manifest = BackupManifest::load(&self.manifest_path(connection_id))?;
        let mut entries: Vec<BackupEntry> = manifest
            .entries
            .into_iter()
            .filter(|e| e.connection_id == connection_id && e.file_path.exists())
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    /// Look up one live backup by id
    pub fn get_backup(&self, connection_id: &str, backup_id: &str) -> Result<BackupEntry> {
        self.list_backups(connection_id)?
            .into_iter()
            .find(|e| e.id == backup_id)
            .ok_or_else(|| QuarryError::not_found("Backup not found"))
    }

    /// Remove a backup file and its manifest entry
    pub async fn delete_backup(&self, connection_id: &str, backup_id: &str) -> Result<()> {
        let key = connection_key(connection_id);
        let lock = self.manifest_lock(&key);
        let removed = {
            let _guard = lock.lock().await;
            self.remove_entry(connection_id, backup_id).await
        };
        self.release_manifest_lock(&key, lock);
        removed
    }

    async fn remove_entry(&self, connection_id: &str, backup_id: &str) -> Result<()> {
        let manifest_path = self.manifest_path(connection_id);
        let mut manifest = BackupManifest::load(&manifest_path)?;
        let Some(index) =
            manifest.entries.iter().position(|e| e.id == backup_id && e.connection_id == connection_id)
        else {
            return Err(QuarryError::not_found("Backup not found"));
        };

        let entry = manifest.entries.remove(index);
        match tokio::fs::remove_file(&entry.file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(QuarryError::config_error(format!(
                    "Failed to delete {}: {e}",
                    entry.file_path.display()
                )))
            }
        }
        manifest.save(&manifest_path)?;
        info!(connection_id = %connection_id, backup_id = %backup_id, "backup deleted");
        Ok(())
    }
}

/// Bytes kept verbatim in a connection directory name
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Collision-free directory name for a connection id
///
/// Percent-encoding is injective, so distinct ids never share a directory. The
/// empty id maps to a bare `%`, which no encoded id can produce.
fn connection_key(connection_id: &str) -> String {
    if connection_id.is_empty() {
        return "%".to_string();
    }
    utf8_percent_encode(connection_id, KEY_ENCODE_SET).to_string()
}

/// Replace anything outside `[A-Za-z0-9_-]` so names are safe path components
fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.trim_matches('_').is_empty() {
        "backup".to_string()
    } else {
        cleaned
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    })
}

fn backup_extension(engine: DatabaseType, options: &BackupOptions) -> &'static str {
    match engine {
        DatabaseType::MongoDB => "archive",
        DatabaseType::SQLite if options.is_default() => "sqlite",
        _ => "sql",
    }
}

/// `<dir>/<db>_<timestamp>.<ext>`, with `-<n>` appended on collision
fn unique_backup_path(dir: &Path, database: &str, extension: &str) -> PathBuf {
    let stem = format!("{}_{}", sanitize_component(database), Utc::now().format("%Y%m%d_%H%M%S_%3f"));
    let mut candidate = dir.join(format!("{stem}.{extension}"));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}-{n}.{extension}"));
        n += 1;
    }
    candidate
}

/// Discrete host/port/user fields, parsed from a URL connection string when needed
fn network_fields(config: &ConnectionConfig) -> Result<ConnectionConfig> {
    if config.host.is_some() {
        return Ok(config.clone());
    }
    match &config.connection_string {
        Some(s) if s.contains("://") => {
            let schemes: &[&str] = match config.engine {
                DatabaseType::Postgres => &["postgres", "postgresql"],
                DatabaseType::MySQL => &["mysql", "mariadb"],
                _ => &["mongodb", "mongodb+srv"],
            };
            parse_url_connection(config.engine, s, schemes)
        }
        Some(_) => Err(QuarryError::invalid_input(format!(
            "{} backups need host/port fields or a URL connection string",
            config.engine.display_name()
        ))),
        None => Ok(config.clone()),
    }
}

fn with_pg_connection(command: ToolCommand, fields: &ConnectionConfig) -> ToolCommand {
    let mut command = command
        .arg("-h")
        .arg(fields.host.clone().unwrap_or_else(|| "localhost".to_string()))
        .arg("-p")
        .arg(fields.port.unwrap_or(5432).to_string());
    if let Some(user) = &fields.username {
        command = command.arg("-U").arg(user);
    }
    command = command.arg("-d").arg(fields.database.clone().unwrap_or_else(|| "postgres".to_string()));
    if let Some(password) = &fields.password {
        command = command.env("PGPASSWORD", password);
    }
    command
}

fn pg_dump_command(fields: &ConnectionConfig, options: &BackupOptions, path: &Path) -> ToolCommand {
    let mut command = with_pg_connection(ToolCommand::new("pg_dump"), fields);
    if options.data_only {
        command = command.arg("--data-only");
    } else if options.schema_only {
        command = command.arg("--schema-only");
    }
    for table in &options.tables {
        command = command.arg("-t").arg(table);
    }
    command.stdout_to(path)
}

fn with_mysql_connection(command: ToolCommand, fields: &ConnectionConfig) -> ToolCommand {
    let mut command = command
        .arg("-h")
        .arg(fields.host.clone().unwrap_or_else(|| "localhost".to_string()))
        .arg("-P")
        .arg(fields.port.unwrap_or(3306).to_string());
    if let Some(user) = &fields.username {
        command = command.arg("-u").arg(user);
    }
    if let Some(password) = &fields.password {
        command = command.env("MYSQL_PWD", password);
    }
    command
}

fn mysqldump_command(fields: &ConnectionConfig, options: &BackupOptions, path: &Path) -> Result<ToolCommand> {
    let database = fields
        .database
        .clone()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| QuarryError::invalid_input("MySQL backup requires a database"))?;

    let mut command = with_mysql_connection(ToolCommand::new("mysqldump"), fields).arg("--single-transaction");
    if options.data_only {
        command = command.arg("--no-create-info");
    } else if options.schema_only {
        command = command.arg("--no-data");
    }
    Ok(command.arg(database).args(options.tables.iter().cloned()).stdout_to(path))
}

fn sqlite_dump_command(source: &Path, options: &BackupOptions, path: &Path) -> ToolCommand {
    let command = ToolCommand::new("sqlite3").arg(source.display().to_string());
    let command = if options.schema_only {
        if options.tables.is_empty() {
            command.arg(".schema")
        } else {
            command.args(options.tables.iter().map(|t| format!(".schema {t}")))
        }
    } else {
        let mut dump = String::from(".dump");
        if options.data_only {
            dump.push_str(" --data-only");
        }
        for table in &options.tables {
            dump.push(' ');
            dump.push_str(table);
        }
        command.arg(dump)
    };
    command.stdout_to(path)
}

fn sqlite_file(config: &ConnectionConfig) -> Result<PathBuf> {
    if let Some(path) = &config.file_path {
        return Ok(path.clone());
    }
    config
        .connection_string
        .as_deref()
        .map(|s| {
            let s = s.trim();
            PathBuf::from(s.strip_prefix("sqlite://").or_else(|| s.strip_prefix("sqlite:")).unwrap_or(s))
        })
        .ok_or_else(|| QuarryError::invalid_input("SQLite requires 'file_path' parameter"))
}

/// Mongo URI without its password, plus the password to pass out of band
fn mongo_uri(config: &ConnectionConfig) -> Result<(String, Option<String>)> {
    if let Some(uri) = &config.connection_string {
        return Ok(split_uri_password(uri));
    }

    let host = config.host.clone().unwrap_or_else(|| "localhost".to_string());
    let port = config.port.unwrap_or(27017);
    let uri = match &config.username {
        Some(user) => format!("mongodb://{user}@{host}:{port}/?authSource=admin"),
        None => format!("mongodb://{host}:{port}/"),
    };
    Ok((uri, config.password.clone()))
}

fn split_uri_password(uri: &str) -> (String, Option<String>) {
    let Some(scheme_end) = uri.find("://") else {
        return (uri.to_string(), None);
    };
    let rest = &uri[scheme_end + 3..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let Some(at) = rest[..authority_end].rfind('@') else {
        return (uri.to_string(), None);
    };
    match rest[..at].split_once(':') {
        Some((user, password)) => (
            format!("{}://{user}{}", &uri[..scheme_end], &rest[at..]),
            Some(crate::engine::percent_decode(password)),
        ),
        None => (uri.to_string(), None),
    }
}

/// Create a file readable only by the current user
fn write_private_file(path: &Path, contents: &str) -> Result<()> {
    use std::io::Write;

    let mut open = std::fs::OpenOptions::new();
    open.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        open.mode(0o600);
    }
    let mut file = open
        .open(path)
        .map_err(|e| QuarryError::config_error(format!("Failed to create {}: {e}", path.display())))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| QuarryError::config_error(format!("Failed to write {}: {e}", path.display())))
}
