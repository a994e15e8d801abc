//! Quarry - Multi-Engine Database Administration Core
//!
//! Quarry connects to `PostgreSQL`, `MySQL`, SQL Server, `MongoDB` and `SQLite` behind one
//! driver contract and builds the administration features on top of it.
//!
//! # Module Organization
//! - [`error`] - Error types and stable error codes
//! - [`output`] - JSON output envelope types for the CLI
//! - [`engine`] - Driver trait, core types and the five engine implementations
//! - [`capability`] - Statement classification and NL permission checks
//! - [`connection`] - Connection registry and driver factory
//! - [`vault`] - Credential protection for stored secrets
//! - [`backup`] - Backup and restore through the engines' dump tools
//! - [`transfer`] - Row copy between two live connections
//! - [`nl`] - Natural-language to SQL pipeline
//! - [`config`] - Settings and named connection profiles
//!
//! # Engine Features
//! Each engine sits behind a cargo feature (`postgres`, `mysql`, `mssql`, `mongodb`,
//! `sqlite`); `all-engines` is the default. Engines left out of a build report
//! `UNSUPPORTED_ENGINE` from the driver factory.

pub mod backup;
pub mod capability;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod nl;
pub mod output;
pub mod transfer;
pub mod vault;

// Re-export commonly used types for convenience
pub use backup::{BackupEntry, BackupManifest, BackupOptions, BackupOutcome, BackupService, BackupTask};
pub use capability::{classify, validate_query, NlPermissions, QueryCategory};
pub use config::{ConnectionStore, Settings, StoredConnection};
pub use connection::{ConnectionManager, DriverFactory, EngineDriverFactory};
pub use engine::{
    ColumnInfo, ConnectionConfig, DatabaseType, Driver, IndexInfo, QueryResult, ResultRow, TableInfo,
};
pub use error::{QuarryError, Result};
pub use nl::{NlHistoryEntry, NlInterpretation, NlPipeline, NlQueryOutcome, NlState, ReasoningService};
pub use output::{ErrorEnvelope, ErrorInfo, Metadata, SuccessEnvelope};
pub use transfer::{TransferEngine, TransferResult};
pub use vault::{CredentialVault, SecureStorage};
