//! # Outbox Error Types
//!
//! Structured error handling for the outbox using thiserror. `OutboxError` covers
//! everything that can propagate to a caller (store round-trips, configuration,
//! serialization on the write path). Failures that happen while dispatching a
//! single envelope are modelled separately as [`DispatchFailure`] because they are
//! recorded on the envelope and never escape the processing loop.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by outbox operations
#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("Store error: {operation}: {message}")]
    Store { operation: String, message: String },

    #[error("Store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Message serialization error: {message}")]
    Serialization { message: String },

    #[error("Message deserialization error: {message}")]
    Deserialization { message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Envelope not found: {id}")]
    NotFound { id: Uuid },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Timeout: operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
}

impl OutboxError {
    /// Create a store operation error
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a store unavailable error
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a deserialization error
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Whether the error indicates the store could not be reached at all
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::Timeout { .. })
    }
}

impl From<sqlx::Error> for OutboxError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => OutboxError::store("query", "No rows found"),
            sqlx::Error::Database(db_err) => OutboxError::store("database", db_err.to_string()),
            sqlx::Error::PoolTimedOut => OutboxError::timeout("database_pool", 30_000),
            sqlx::Error::PoolClosed => OutboxError::store_unavailable("Database pool is closed"),
            sqlx::Error::Io(io_err) => OutboxError::store_unavailable(io_err.to_string()),
            sqlx::Error::Configuration(config_err) => {
                OutboxError::configuration("database", config_err.to_string())
            }
            sqlx::Error::ColumnDecode { index, source } => OutboxError::deserialization(format!(
                "column {index} could not be decoded: {source}"
            )),
            _ => OutboxError::store("database", err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OutboxError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_eof() || err.is_data() {
            OutboxError::deserialization(err.to_string())
        } else {
            OutboxError::serialization(err.to_string())
        }
    }
}

impl From<config::ConfigError> for OutboxError {
    fn from(err: config::ConfigError) -> Self {
        OutboxError::configuration("config", err.to_string())
    }
}

/// Result type alias for outbox operations
pub type Result<T> = std::result::Result<T, OutboxError>;

/// Why a single dispatch attempt failed
///
/// The display string is what ends up in the envelope's `last_error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchFailure {
    #[error("no handler registered")]
    NoHandler,

    #[error("payload could not be decoded as {message_type}: {message}")]
    Decode {
        message_type: String,
        message: String,
    },

    #[error("handler failed: {message}")]
    Handler { message: String },

    #[error("handler timed out after {timeout_ms}ms")]
    HandlerTimeout { timeout_ms: u64 },
}
