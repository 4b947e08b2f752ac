//! Connection options and upstream server configuration.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use switchboard_transport::{DEFAULT_REQUEST_TIMEOUT_MS, OAuthProvider, TransportKind};
use switchboard_types::Implementation;

use crate::connection::{ElicitationHandler, TransportFactory};

fn default_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

/// Which wire protocol to use for an upstream server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    StreamableHttp,
    Sse,
    /// Streamable HTTP first, legacy SSE if the server does not implement it.
    #[default]
    Auto,
}

impl TransportMode {
    /// The transport tried first.
    pub fn first_kind(self) -> TransportKind {
        match self {
            TransportMode::Sse => TransportKind::Sse,
            TransportMode::StreamableHttp | TransportMode::Auto => TransportKind::StreamableHttp,
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportMode::StreamableHttp => "streamable-http",
            TransportMode::Sse => "sse",
            TransportMode::Auto => "auto",
        })
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streamable-http" => Ok(TransportMode::StreamableHttp),
            "sse" => Ok(TransportMode::Sse),
            "auto" => Ok(TransportMode::Auto),
            other => Err(format!(
                "unknown transport '{other}' (expected streamable-http, sse or auto)"
            )),
        }
    }
}

/// Identity carried over when re-connecting after an OAuth redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconnect {
    /// Server id to reuse instead of generating a fresh one.
    pub id: String,
    pub oauth_client_id: Option<String>,
    /// Authorization code to complete the pending flow with.
    pub oauth_code: Option<String>,
}

/// Options for one upstream connection.
#[derive(Clone)]
pub struct ConnectOptions {
    pub transport: TransportMode,
    pub auth_provider: Option<Arc<dyn OAuthProvider>>,
    pub headers: HashMap<String, String>,
    pub request_timeout_ms: u64,
    pub client_info: Implementation,
    pub elicitation_handler: Option<Arc<dyn ElicitationHandler>>,
    /// Creates transport instances; the HTTP transports when unset.
    pub transport_factory: Option<Arc<dyn TransportFactory>>,
    pub reconnect: Option<Reconnect>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            transport: TransportMode::Auto,
            auth_provider: None,
            headers: HashMap::new(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            client_info: Implementation::new("switchboard", env!("CARGO_PKG_VERSION")),
            elicitation_handler: None,
            transport_factory: None,
            reconnect: None,
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("transport", &self.transport)
            .field("auth_provider", &self.auth_provider.is_some())
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("client_info", &self.client_info)
            .field("elicitation_handler", &self.elicitation_handler.is_some())
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

/// Top-level upstream configuration (`[servers.<name>]` tables).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, UpstreamServerConfig>,
}

/// Configuration for a single upstream MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamServerConfig {
    /// Server endpoint, e.g. `https://example.com/mcp`.
    pub url: String,
    #[serde(default)]
    pub transport: TransportMode,
    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Timeout for requests in milliseconds (default: 60000).
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl UpstreamServerConfig {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            transport: self.transport,
            headers: self.headers.clone(),
            request_timeout_ms: self.timeout_ms,
            ..ConnectOptions::default()
        }
    }
}
