//! Error hierarchy shared across Switchboard crates.

use thiserror::Error;

use crate::jsonrpc::{INVALID_REQUEST, PARSE_ERROR};

/// Malformed JSON-RPC input.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid JSON-RPC message: {0}")]
    InvalidMessage(String),

    #[error("Empty batch")]
    EmptyBatch,
}

impl ProtocolError {
    /// The JSON-RPC error code to report for this failure.
    pub fn code(&self) -> i64 {
        match self {
            ProtocolError::Parse(_) => PARSE_ERROR,
            ProtocolError::InvalidMessage(_) | ProtocolError::EmptyBatch => INVALID_REQUEST,
        }
    }
}

/// Errors from tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Invalid input for tool '{tool}': {message}")]
    InvalidInput { tool: String, message: String },

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Elicitation is not available in this context")]
    ElicitationUnavailable,

    #[error("Elicitation failed: {0}")]
    Elicitation(String),
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Missing required configuration: {key}")]
    MissingKey { key: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}
