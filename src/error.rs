//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout Quarry.
//! All errors are structured and map to specific error codes for JSON output.
//!
//! # Error Categories
//! - `ConnectionFailed`, `Authentication`, `Network`: connect-time failures
//! - `NotFound`: missing connection, table, database or backup
//! - `UnsupportedEngine`: engine lacks a code path (e.g. MSSQL backups)
//! - `ExternalTool`: dump/restore utility missing or exited non-zero
//! - `QueryFailed`: engine-reported statement failure, passed through verbatim
//! - `Cancelled`: operation abandoned through a cancellation handle
//! - `CapabilityViolation`: statement exceeds the declared NL permissions
//! - `InvalidInput`, `EngineError`, `ConfigError`, `Vault`, `Reasoning`

use thiserror::Error;

/// Main error type for Quarry operations
#[derive(Error, Debug)]
pub enum QuarryError {
    /// Database connection failed for a reason other than auth or network
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Credentials rejected by the server
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Timeout, DNS failure, refused or reset connection
    #[error("Network error: {0}")]
    Network(String),

    /// Schema, table, database, connection or backup absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Engine has no implementation for the requested operation
    #[error("Unsupported engine: {0}")]
    UnsupportedEngine(String),

    /// External dump/restore tool failed
    #[error("{tool} failed: {detail}")]
    ExternalTool { tool: String, detail: String },

    /// Query execution failed (engine text is preserved)
    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    /// Operation was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Statement blocked by caller-declared permissions
    #[error("Capability violation: {0}")]
    CapabilityViolation(String),

    /// Invalid input or missing required parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Engine-specific database error
    #[error("Engine error ({engine}): {detail}")]
    EngineError { engine: String, detail: String },

    /// Configuration error (file not found, invalid JSON, etc.)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Credential encryption or decryption failed
    #[error("Credential vault error: {0}")]
    Vault(String),

    /// Reasoning service request failed or returned an unusable answer
    #[error("Reasoning service error: {0}")]
    Reasoning(String),
}

impl QuarryError {
    /// Convert error to error code string for JSON output
    ///
    /// Error codes are stable and suitable for programmatic handling.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::Authentication(_) => "AUTHENTICATION_FAILED",
            Self::Network(_) => "NETWORK_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::UnsupportedEngine(_) => "UNSUPPORTED_ENGINE",
            Self::ExternalTool { .. } => "EXTERNAL_TOOL_FAILED",
            Self::QueryFailed(_) => "QUERY_FAILED",
            Self::Cancelled(_) => "CANCELLED",
            Self::CapabilityViolation(_) => "CAPABILITY_VIOLATION",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::EngineError { .. } => "ENGINE_ERROR",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::Vault(_) => "VAULT_ERROR",
            Self::Reasoning(_) => "REASONING_FAILED",
        }
    }

    /// Get human-readable error message
    ///
    /// Never contains credentials; drivers strip passwords before building errors.
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// True for errors raised while establishing a connection
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::Authentication(_) | Self::Network(_))
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create an unsupported engine error
    pub fn unsupported_engine(message: impl Into<String>) -> Self {
        Self::UnsupportedEngine(message.into())
    }

    /// Create an external tool error
    pub fn external_tool(tool: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ExternalTool { tool: tool.into(), detail: detail.into() }
    }

    /// Create a query failed error
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::QueryFailed(message.into())
    }

    /// Create a cancelled error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled(message.into())
    }

    /// Create a capability violation error
    pub fn capability_violation(message: impl Into<String>) -> Self {
        Self::CapabilityViolation(message.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create an engine-specific error
    pub fn engine_error(engine: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::EngineError { engine: engine.into(), detail: detail.into() }
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Create a vault error
    pub fn vault(message: impl Into<String>) -> Self {
        Self::Vault(message.into())
    }

    /// Create a reasoning service error
    pub fn reasoning(message: impl Into<String>) -> Self {
        Self::Reasoning(message.into())
    }
}

/// Result type alias for Quarry operations
pub type Result<T> = std::result::Result<T, QuarryError>;
