//! Quarry CLI Entry Point
//!
//! Thin wrapper over the library. Every command resolves its connection profile
//! through [`ConnectionStore`], does one thing, and prints one JSON envelope.
//!
//! All output to stdout is JSON-only. Logs go to stderr (`QUARRY_LOG`, then `RUST_LOG`).
//! Ctrl-C cancels the running query, backup or NL request.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use quarry::backup::{BackupOptions, BackupService};
use quarry::config::{ConnectionStore, Settings, StoredConnection};
use quarry::connection::{ConnectionManager, DriverFactory, EngineDriverFactory};
use quarry::nl::{NlHistoryEntry, NlPipeline};
use quarry::output::{ErrorEnvelope, ErrorInfo, Metadata, SuccessEnvelope};
use quarry::transfer::TransferEngine;
use quarry::{ConnectionConfig, DatabaseType, Driver, NlPermissions, QuarryError};

/// Quarry - multi-engine database administration
#[derive(Parser)]
#[command(name = "quarry")]
#[command(about = "Query, introspect, back up and transfer PostgreSQL, MySQL, SQL Server, MongoDB and SQLite databases")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save a connection profile and verify it
    Connect {
        /// Profile name, used as the connection id
        name: String,
        /// Engine: postgresql, mysql, mssql, mongodb or sqlite
        #[arg(long)]
        engine: String,
        /// Engine-native connection string (URL, ADO or file path)
        #[arg(long, conflicts_with_all = ["host", "file"])]
        url: Option<String>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long, conflicts_with_all = ["prompt_password", "password_env"])]
        password: Option<String>,
        /// Ask for the password interactively
        #[arg(long)]
        prompt_password: bool,
        /// Read the password from this environment variable at connect time
        #[arg(long)]
        password_env: Option<String>,
        #[arg(long)]
        database: Option<String>,
        /// `SQLite` database file
        #[arg(long)]
        file: Option<PathBuf>,
        /// Environment tag, e.g. production
        #[arg(long)]
        environment: Option<String>,
        /// Save without testing the connection
        #[arg(long)]
        no_verify: bool,
    },

    /// List saved connection profiles
    Connections,

    /// Delete a saved connection profile
    Forget { name: String },

    /// List databases
    Databases { name: String },

    /// List schemas
    Schemas { name: String },

    /// List tables (collections for `MongoDB`)
    Tables {
        name: String,
        #[arg(long)]
        schema: Option<String>,
    },

    /// Describe a table's columns and indexes
    Describe {
        name: String,
        table: String,
        #[arg(long)]
        schema: Option<String>,
    },

    /// Execute one statement (or `MongoDB` command document)
    Query {
        name: String,
        sql: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        offset: Option<usize>,
    },

    /// Back up a connection's database with the engine's dump tool
    Backup {
        name: String,
        #[arg(long, conflicts_with = "schema_only")]
        data_only: bool,
        #[arg(long)]
        schema_only: bool,
        /// Restrict to a table; repeatable
        #[arg(long = "table")]
        tables: Vec<String>,
    },

    /// List backups for a connection, newest first
    Backups { name: String },

    /// Delete a backup file and its manifest entry
    DeleteBackup { name: String, backup_id: String },

    /// Restore a backup into its connection, or into --target
    Restore {
        name: String,
        backup_id: String,
        /// Profile to restore into (defaults to NAME)
        #[arg(long)]
        target: Option<String>,
    },

    /// Copy table rows from one connection to another
    Transfer {
        source: String,
        target: String,
        /// Table to copy; repeatable
        #[arg(long = "table", required = true)]
        tables: Vec<String>,
    },

    /// Turn a question into a query with the reasoning service
    Ask {
        name: String,
        prompt: String,
        #[arg(long)]
        allow_write: bool,
        #[arg(long)]
        allow_ddl: bool,
        #[arg(long)]
        max_rows: Option<usize>,
        /// Run the generated statement
        #[arg(long)]
        execute: bool,
        /// Explain the results (implies --execute)
        #[arg(long)]
        explain: bool,
        /// JSON file with earlier turns: [{"prompt": "...", "sql": "...", "result_summary": "..."}]
        #[arg(long)]
        history: Option<PathBuf>,
    },
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Connections => "connections",
            Self::Forget { .. } => "forget",
            Self::Databases { .. } => "databases",
            Self::Schemas { .. } => "schemas",
            Self::Tables { .. } => "tables",
            Self::Describe { .. } => "describe",
            Self::Query { .. } => "query",
            Self::Backup { .. } => "backup",
            Self::Backups { .. } => "backups",
            Self::DeleteBackup { .. } => "delete-backup",
            Self::Restore { .. } => "restore",
            Self::Transfer { .. } => "transfer",
            Self::Ask { .. } => "ask",
        }
    }
}

/// Command payload plus the row count for metadata
struct Output {
    data: Value,
    rows: Option<usize>,
}

impl Output {
    fn new(data: impl Serialize) -> anyhow::Result<Self> {
        Ok(Self { data: serde_json::to_value(data).context("Failed to serialize output")?, rows: None })
    }

    fn with_rows(data: impl Serialize, rows: usize) -> anyhow::Result<Self> {
        Ok(Self { rows: Some(rows), ..Self::new(data)? })
    }
}

struct App {
    settings: Settings,
    store: ConnectionStore,
    manager: Arc<ConnectionManager>,
    /// Engine of the profile being worked on, for the envelope
    engine: Option<DatabaseType>,
}

impl App {
    fn load() -> anyhow::Result<Self> {
        Ok(Self {
            settings: Settings::load_default()?,
            store: ConnectionStore::load_default()?,
            manager: Arc::new(ConnectionManager::default()),
            engine: None,
        })
    }

    fn resolve(&mut self, name: &str) -> quarry::Result<ConnectionConfig> {
        let config = self.store.resolve(name)?;
        self.engine = Some(config.engine);
        Ok(config)
    }

    /// Connect the profile `name` under id `name`
    async fn open(&mut self, name: &str) -> quarry::Result<Arc<dyn Driver>> {
        let config = self.resolve(name)?;
        self.manager.connect(name, &config).await?;
        self.manager
            .get_driver(name)
            .ok_or_else(|| QuarryError::not_found(format!("Connection '{name}' not found")))
    }

    fn backup_service(&self) -> quarry::Result<Arc<BackupService>> {
        Ok(Arc::new(BackupService::with_process_runner(self.settings.backups_root()?)))
    }

    async fn run(&mut self, command: Commands) -> anyhow::Result<Output> {
        match command {
            Commands::Connect {
                name,
                engine,
                url,
                host,
                port,
                user,
                password,
                prompt_password,
                password_env,
                database,
                file,
                environment,
                no_verify,
            } => {
                let engine: DatabaseType = engine.parse()?;
                self.engine = Some(engine);

                let mut config = match &url {
                    Some(url) => EngineDriverFactory.create(engine)?.parse_connection_string(url)?,
                    None => ConnectionConfig::new(engine),
                };
                config.host = host.or(config.host);
                config.port = port.or(config.port);
                config.username = user.or(config.username);
                config.database = database.or(config.database);
                config.file_path = file.or(config.file_path);
                if let Some(password) = password {
                    config.password = Some(password);
                } else if prompt_password {
                    let password = dialoguer::Password::new()
                        .with_prompt(format!("Password for '{name}'"))
                        .allow_empty_password(true)
                        .interact()
                        .context("Failed to read password")?;
                    config.password = Some(password);
                }

                let latency_ms = if no_verify {
                    None
                } else {
                    let mut probe = config.clone();
                    if let Some(var) = &password_env {
                        probe.password = std::env::var(var).ok();
                    }
                    Some(self.manager.test_connection(&probe).await?)
                };

                let redacted = config.redacted();
                self.store.upsert(&name, StoredConnection { config, password_env, environment });
                self.store.save()?;
                Output::new(json!({
                    "name": name,
                    "config": redacted,
                    "latency_ms": latency_ms,
                    "saved_to": self.store.path(),
                }))
            }

            Commands::Connections => {
                let profiles: Vec<Value> = self
                    .store
                    .list()
                    .into_iter()
                    .map(|(name, stored)| {
                        let c = &stored.config;
                        json!({
                            "name": name,
                            "engine": c.engine,
                            "host": c.host,
                            "port": c.port_or_default(),
                            "database": c.database,
                            "file_path": c.file_path,
                            "environment": stored.environment,
                            "uses_connection_string": c.connection_string.is_some(),
                        })
                    })
                    .collect();
                let count = profiles.len();
                Output::with_rows(profiles, count)
            }

            Commands::Forget { name } => {
                let removed = self.store.remove(&name)?;
                self.engine = Some(removed.config.engine);
                self.store.save()?;
                Output::new(json!({ "removed": name }))
            }

            Commands::Databases { name } => {
                let names = self.open(&name).await?.list_databases().await?;
                let count = names.len();
                Output::with_rows(names, count)
            }

            Commands::Schemas { name } => {
                let names = self.open(&name).await?.list_schemas().await?;
                let count = names.len();
                Output::with_rows(names, count)
            }

            Commands::Tables { name, schema } => {
                let names = self.open(&name).await?.list_tables(schema.as_deref()).await?;
                let count = names.len();
                Output::with_rows(names, count)
            }

            Commands::Describe { name, table, schema } => {
                let info = self.open(&name).await?.get_table_info(&table, schema.as_deref()).await?;
                Output::new(info)
            }

            Commands::Query { name, sql, limit, offset } => {
                let driver = self.open(&name).await?;
                let watcher = {
                    let manager = Arc::clone(&self.manager);
                    let id = name.clone();
                    tokio::spawn(async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            let _ = manager.cancel_query(&id).await;
                        }
                    })
                };
                // Straight to the driver so the envelope keeps the engine's error code
                let result = driver.execute_query(&sql, limit, offset).await;
                watcher.abort();

                let result = result?;
                let count = result.row_count;
                Output::with_rows(result, count)
            }

            Commands::Backup { name, data_only, schema_only, tables } => {
                let config = self.resolve(&name)?;
                let environment = self.store.get(&name).and_then(|s| s.environment.clone());
                let options = BackupOptions { data_only, schema_only, tables };

                let task = self.backup_service()?.spawn_backup(
                    name.clone(),
                    name,
                    config,
                    options,
                    environment,
                );
                let cancel = task.cancellation();
                let watcher = tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                });
                let outcome = task.join().await;
                watcher.abort();

                let outcome = outcome?;
                Output::new(json!({
                    "entry": outcome.entry,
                    "command": outcome.command,
                }))
            }

            Commands::Backups { name } => {
                let stored = self.store.get(&name).ok_or_else(|| {
                    QuarryError::not_found(format!("Connection profile '{name}' not found"))
                })?;
                self.engine = Some(stored.config.engine);
                let entries = self.backup_service()?.list_backups(&name)?;
                let count = entries.len();
                Output::with_rows(entries, count)
            }

            Commands::DeleteBackup { name, backup_id } => {
                self.engine = self.store.get(&name).map(|s| s.config.engine);
                self.backup_service()?.delete_backup(&name, &backup_id).await?;
                Output::new(json!({ "deleted": backup_id }))
            }

            Commands::Restore { name, backup_id, target } => {
                let service = self.backup_service()?;
                let entry = service.get_backup(&name, &backup_id)?;
                let target_name = target.unwrap_or_else(|| name.clone());
                let target_config = self.resolve(&target_name)?;
                service.restore(&entry, &target_config).await?;
                Output::new(json!({ "restored": entry.id, "into": target_name }))
            }

            Commands::Transfer { source, target, tables } => {
                self.open(&source).await?;
                self.open(&target).await?;
                self.engine = None;
                let result = TransferEngine::new(Arc::clone(&self.manager)).transfer(&source, &target, &tables).await?;
                let rows = usize::try_from(result.rows_transferred).unwrap_or(usize::MAX);
                Output::with_rows(result, rows)
            }

            Commands::Ask { name, prompt, allow_write, allow_ddl, max_rows, execute, explain, history } => {
                let history: Vec<NlHistoryEntry> = match history {
                    Some(path) => {
                        let contents = std::fs::read_to_string(&path)
                            .with_context(|| format!("Failed to read history file {}", path.display()))?;
                        serde_json::from_str(&contents).context("Invalid history file")?
                    }
                    None => Vec::new(),
                };
                let permissions = NlPermissions { allow_write, allow_ddl, max_rows };
                let reasoning = Arc::new(self.settings.reasoning_service()?);

                self.open(&name).await?;
                let pipeline = Arc::new(NlPipeline::new(Arc::clone(&self.manager), reasoning));
                let watcher = {
                    let pipeline = Arc::clone(&pipeline);
                    let id = name.clone();
                    tokio::spawn(async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            pipeline.cancel(&id);
                        }
                    })
                };

                let output = if execute || explain {
                    let outcome = pipeline.execute_nl_query(&name, &prompt, &permissions, &history).await;
                    match outcome {
                        Ok(outcome) if explain => {
                            let result = &outcome.result;
                            let interpretation = pipeline
                                .interpret_results(
                                    &name,
                                    &prompt,
                                    &outcome.sql,
                                    &result.columns,
                                    &result.rows,
                                    result.row_count,
                                    &history,
                                )
                                .await;
                            interpretation.map(|i| {
                                let count = outcome.result.row_count;
                                (json!({ "outcome": outcome, "interpretation": i }), Some(count))
                            })
                        }
                        Ok(outcome) => {
                            let count = outcome.result.row_count;
                            Ok((json!({ "outcome": outcome }), Some(count)))
                        }
                        Err(e) => Err(e),
                    }
                } else {
                    pipeline
                        .generate_sql(&name, &prompt, &permissions, &history)
                        .await
                        .map(|generated| (json!(generated), None))
                };
                watcher.abort();

                let (data, rows) = output?;
                Ok(Output { data, rows })
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("QUARRY_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn print_json(value: &impl Serialize) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{json}"),
        Err(e) => println!(
            r#"{{"ok":false,"command":"","error":{{"code":"INTERNAL_ERROR","message":"Failed to serialize output: {e}"}}}}"#
        ),
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let command_name = cli.command.name();
    let started = Instant::now();

    let mut app = match App::load() {
        Ok(app) => app,
        Err(e) => {
            print_json(&error_envelope(None, command_name, &e));
            std::process::exit(1);
        }
    };

    let result = app.run(cli.command).await;
    app.manager.disconnect_all().await;
    let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match result {
        Ok(output) => {
            let meta = match output.rows {
                Some(rows) => Metadata::with_rows(elapsed, rows),
                None => Metadata::new(elapsed),
            };
            print_json(&SuccessEnvelope::new(app.engine, command_name, output.data, meta));
        }
        Err(e) => {
            debug!(command = command_name, error = %e, "command failed");
            print_json(&error_envelope(app.engine, command_name, &e));
            std::process::exit(1);
        }
    }
}

fn error_envelope(engine: Option<DatabaseType>, command: &str, err: &anyhow::Error) -> ErrorEnvelope {
    match err.downcast_ref::<QuarryError>() {
        Some(quarry_err) => ErrorEnvelope::from_error(engine, command, quarry_err),
        None => ErrorEnvelope::new(engine, command, ErrorInfo::new("INTERNAL_ERROR", format!("{err:#}"))),
    }
}
