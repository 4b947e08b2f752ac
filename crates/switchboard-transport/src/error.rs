//! Error types for MCP client transports.

use switchboard_types::METHOD_NOT_FOUND;
use thiserror::Error;

/// Errors from talking to an upstream MCP server.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("JSON-RPC error (code {code}): {message}")]
    JsonRpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Transport closed")]
    Closed,

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    /// The server wants credentials before it will talk to us.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            TransportError::Unauthorized { .. } => true,
            TransportError::Http { status, .. } => *status == 401,
            TransportError::Network(text) | TransportError::Protocol(text) => {
                text.contains("Unauthorized") || text.contains("401")
            }
            _ => false,
        }
    }

    /// The endpoint does not speak the transport we tried.
    pub fn is_not_implemented(&self) -> bool {
        match self {
            TransportError::Http { status, .. } => matches!(status, 404 | 405 | 501),
            TransportError::Network(text) | TransportError::Protocol(text) => {
                text.contains("Not Implemented") || text.contains("not implemented")
            }
            _ => false,
        }
    }

    /// JSON-RPC -32601: the server does not implement the method.
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, TransportError::JsonRpc { code, .. } if *code == METHOD_NOT_FOUND)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return classify_status(status.as_u16(), &e.to_string());
        }
        TransportError::Network(e.to_string())
    }
}

/// Classify a non-success HTTP response into a typed error.
pub fn classify_status(status: u16, body: &str) -> TransportError {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        error: Option<ErrorDetail>,
    }
    #[derive(serde::Deserialize)]
    struct ErrorDetail {
        message: Option<String>,
    }

    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .and_then(|e| e.message)
        .unwrap_or_else(|| body.trim().to_string());

    match status {
        401 => TransportError::Unauthorized { message },
        _ => TransportError::Http { status, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_401_is_unauthorized() {
        let err = classify_status(401, r#"{"error":{"message":"missing token"}}"#);
        match &err {
            TransportError::Unauthorized { message } => assert_eq!(message, "missing token"),
            other => panic!("Expected Unauthorized, got: {other:?}"),
        }
        assert!(err.is_unauthorized());
        assert!(!err.is_not_implemented());
    }

    #[test]
    fn classify_404_and_405_are_not_implemented() {
        assert!(classify_status(404, "Not Found").is_not_implemented());
        assert!(classify_status(405, "").is_not_implemented());
        assert!(classify_status(501, "").is_not_implemented());
        assert!(!classify_status(500, "boom").is_not_implemented());
    }

    #[test]
    fn plain_body_becomes_message() {
        match classify_status(500, "  internal failure \n") {
            TransportError::Http { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "internal failure");
            }
            other => panic!("Expected Http, got: {other:?}"),
        }
    }

    #[test]
    fn message_text_signatures() {
        let auth = TransportError::Protocol("SSE error: Unauthorized".into());
        assert!(auth.is_unauthorized());
        let missing = TransportError::Network("Not Implemented".into());
        assert!(missing.is_not_implemented());
    }

    #[test]
    fn method_not_found_code() {
        let err = TransportError::JsonRpc {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        };
        assert!(err.is_method_not_found());
        assert!(!err.is_unauthorized());
    }
}
