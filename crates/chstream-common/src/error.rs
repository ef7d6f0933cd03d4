//! Error types for ChStream services

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type alias using ChStreamError
pub type Result<T> = std::result::Result<T, ChStreamError>;

/// Numeric error codes reported to clients.
///
/// Engine-originated failures carry the engine's own code; the gateway only
/// assigns codes for failures it detects itself, using the matching ClickHouse
/// error numbers so clients see a single code space.
pub mod codes {
    /// CANNOT_PARSE_INPUT_ASSERTION_FAILED
    pub const CANNOT_PARSE_INPUT: i32 = 27;
    /// BAD_ARGUMENTS
    pub const BAD_ARGUMENTS: i32 = 36;
    /// LOGICAL_ERROR
    pub const LOGICAL_ERROR: i32 = 49;
    /// NETWORK_ERROR
    pub const NETWORK_ERROR: i32 = 210;
    /// UNKNOWN_EXCEPTION
    pub const UNKNOWN_EXCEPTION: i32 = 1002;
}

/// Main error type for ChStream services
#[derive(Debug, thiserror::Error)]
pub enum ChStreamError {
    /// The engine could not be reached
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The engine rejected or aborted the query
    #[error("Code: {code}. {message}")]
    QueryExecutionFailed { code: i32, message: String },

    /// The engine answered with something we could not understand
    #[error("Engine protocol error: {0}")]
    ProtocolError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChStreamError {
    /// Create an internal error from any error type
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        ChStreamError::Internal(err.to_string())
    }

    /// Create an execution error carrying an engine code
    pub fn execution(code: i32, message: impl Into<String>) -> Self {
        ChStreamError::QueryExecutionFailed {
            code,
            message: message.into(),
        }
    }

    /// Numeric code delivered to clients in the terminal event
    pub fn code(&self) -> i32 {
        match self {
            ChStreamError::ConnectionFailed(_) => codes::NETWORK_ERROR,
            ChStreamError::QueryExecutionFailed { code, .. } => *code,
            ChStreamError::ProtocolError(_) => codes::CANNOT_PARSE_INPUT,
            ChStreamError::ConfigError(_) => codes::BAD_ARGUMENTS,
            ChStreamError::SerializationError(_) => codes::LOGICAL_ERROR,
            ChStreamError::Internal(_) => codes::UNKNOWN_EXCEPTION,
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ChStreamError::ConnectionFailed(_) => "CONNECTION_FAILED",
            ChStreamError::QueryExecutionFailed { .. } => "QUERY_FAILED",
            ChStreamError::ProtocolError(_) => "PROTOCOL_ERROR",
            ChStreamError::ConfigError(_) => "CONFIG_ERROR",
            ChStreamError::SerializationError(_) => "SERIALIZATION_ERROR",
            ChStreamError::Internal(_) => "INTERNAL",
        }
    }

    /// Message delivered to clients; engine errors keep the engine's text verbatim
    pub fn client_message(&self) -> String {
        match self {
            ChStreamError::QueryExecutionFailed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Error shape carried by a terminal `result` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub code: i32,
    pub message: String,
}

impl From<&ChStreamError> for ExecutionError {
    fn from(err: &ChStreamError) -> Self {
        ExecutionError {
            code: err.code(),
            message: err.client_message(),
        }
    }
}

impl From<ChStreamError> for ExecutionError {
    fn from(err: ChStreamError) -> Self {
        ExecutionError::from(&err)
    }
}

// Implement conversions from common error types
impl From<serde_json::Error> for ChStreamError {
    fn from(err: serde_json::Error) -> Self {
        ChStreamError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for ChStreamError {
    fn from(err: std::io::Error) -> Self {
        ChStreamError::Internal(format!("IO error: {}", err))
    }
}
