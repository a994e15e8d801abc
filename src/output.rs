//! JSON Output Envelope Types
//!
//! Every CLI command prints exactly one envelope to stdout.
//!
//! # Output Contract
//! - Success: `{"ok": true, "engine": "...", "command": "...", "data": {...}, "meta": {...}}`
//! - Error: `{"ok": false, "engine": "...", "command": "...", "error": {"code": "...", "message": "..."}}`
//!
//! `engine` is omitted for commands that are not tied to one engine (`connections`,
//! `transfer`).

use serde::{Deserialize, Serialize};

use crate::engine::DatabaseType;
use crate::error::QuarryError;

/// Success envelope for command results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<DatabaseType>,

    /// Command that was executed (query, backup, ask, ...)
    pub command: String,

    pub data: T,

    pub meta: Metadata,
}

impl<T: Serialize> SuccessEnvelope<T> {
    pub fn new(engine: Option<DatabaseType>, command: impl Into<String>, data: T, meta: Metadata) -> Self {
        Self { ok: true, engine, command: command.into(), data, meta }
    }
}

/// Error envelope for command failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<DatabaseType>,

    pub command: String,

    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    pub fn new(engine: Option<DatabaseType>, command: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, engine, command: command.into(), error }
    }

    /// Create error envelope from a [`QuarryError`]
    pub fn from_error(engine: Option<DatabaseType>, command: impl Into<String>, err: &QuarryError) -> Self {
        Self::new(engine, command, ErrorInfo::new(err.error_code(), err.message()))
    }
}

/// Error information structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g., "NOT_FOUND", "EXTERNAL_TOOL_FAILED")
    pub code: String,

    /// Human-readable error message (no credentials)
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }
}

/// Execution metadata included in all success responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Wall-clock time of the whole command in milliseconds
    pub execution_ms: u64,

    /// Number of rows returned (queries only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_returned: Option<usize>,
}

impl Metadata {
    #[must_use]
    pub const fn new(execution_ms: u64) -> Self {
        Self { execution_ms, rows_returned: None }
    }

    #[must_use]
    pub const fn with_rows(execution_ms: u64, rows_returned: usize) -> Self {
        Self { execution_ms, rows_returned: Some(rows_returned) }
    }
}
