//! MCP client for Switchboard.
//!
//! A [`ClientConnection`] talks to one upstream server over Streamable HTTP or
//! legacy SSE, pausing for OAuth when the server asks for it. The
//! [`ClientManager`] keeps a registry of connections and exposes their tools,
//! resources and prompts under per-server namespaces.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod manager;
pub mod state;
pub mod tool;

pub use config::{ConnectOptions, Reconnect, TransportMode, UpstreamConfig, UpstreamServerConfig};
pub use connection::{ClientConnection, ElicitationHandler, HttpTransportFactory, TransportFactory};
pub use error::{CallbackError, ClientError};
pub use events::EventEmitter;
pub use manager::{
    CallToolRequest, ClientManager, ConnectResult, Namespaced, OAuthCallbackConfig,
    OAuthCallbackResult, generate_server_id,
};
pub use state::ConnectionState;
pub use tool::{McpTool, namespaced_tool_name};
