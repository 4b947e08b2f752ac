//! Server-side errors and HTTP rejections.

use switchboard_types::{
    CONNECTION_CLOSED, INTERNAL_ERROR, JsonRpcMessage, ProtocolError, RequestId,
    SESSION_NOT_FOUND,
};
use thiserror::Error;

/// Errors from sending on a session or from the stores behind it.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("No connection established for request ID: {id}")]
    NoRoute { id: RequestId },

    #[error("Stream connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A request refused before reaching the handler: an HTTP status plus the
/// JSON-RPC error body sent with it.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRejection {
    pub status: u16,
    pub code: i64,
    pub message: String,
}

impl HttpRejection {
    pub fn new(status: u16, code: i64, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn not_acceptable(message: impl Into<String>) -> Self {
        Self::new(406, CONNECTION_CLOSED, message)
    }

    pub fn bad_request(code: i64, message: impl Into<String>) -> Self {
        Self::new(400, code, message)
    }

    pub fn missing_session() -> Self {
        Self::new(400, CONNECTION_CLOSED, "Bad Request: Mcp-Session-Id header is required")
    }

    pub fn session_not_found() -> Self {
        Self::new(404, SESSION_NOT_FOUND, "Session not found")
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, CONNECTION_CLOSED, message)
    }

    /// The JSON-RPC error response carried in the body. The id is always null.
    pub fn body(&self) -> JsonRpcMessage {
        JsonRpcMessage::error(None, self.code, self.message.clone())
    }
}

impl From<ProtocolError> for HttpRejection {
    fn from(err: ProtocolError) -> Self {
        let message = match &err {
            ProtocolError::Parse(_) => "Parse error".to_string(),
            ProtocolError::InvalidMessage(_) | ProtocolError::EmptyBatch => err.to_string(),
        };
        Self::bad_request(err.code(), message)
    }
}

impl From<ServerError> for HttpRejection {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::SessionNotFound { .. } => Self::session_not_found(),
            other => Self::new(500, INTERNAL_ERROR, other.to_string()),
        }
    }
}
