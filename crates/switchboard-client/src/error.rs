//! Error types for client connections and the manager.

use switchboard_transport::TransportError;
use thiserror::Error;

use crate::state::ConnectionState;

/// Errors from MCP client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Invalid connection state: expected {expected}, found {actual}")]
    InvalidState {
        expected: ConnectionState,
        actual: ConnectionState,
    },

    #[error("Server {url} did not report its capabilities")]
    MissingCapabilities { url: String },

    #[error("Unknown MCP server '{id}'")]
    UnknownServer { id: String },

    #[error("Invalid server URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error("Connection has no OAuth provider")]
    NoAuthProvider,

    #[error("Not connected to an MCP server")]
    NotConnected,

    #[error("Elicitation failed: {0}")]
    Elicitation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether the server asked for credentials.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Transport(e) if e.is_unauthorized())
    }
}

/// Reasons an OAuth callback request is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackError {
    #[error("No callback URI match found for the request url: {url}")]
    UnmatchedUrl { url: String },

    #[error("Unauthorized: no code provided")]
    MissingCode,

    #[error("Unauthorized: no state provided")]
    MissingState,

    #[error("Could not find serverId: {server_id}")]
    UnknownServer { server_id: String },

    #[error("Failed to authenticate: the client isn't in the `authenticating` state")]
    NotAuthenticating { server_id: String },

    #[error("Trying to finalize authentication for a server connection without an authProvider")]
    NoAuthProvider { server_id: String },
}
