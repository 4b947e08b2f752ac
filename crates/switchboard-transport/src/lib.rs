//! MCP wire codec and HTTP client transports for Switchboard.
//!
//! Two incompatible wire protocols are supported: Streamable HTTP (one
//! endpoint, POST for everything, SSE-framed replies) and the legacy HTTP+SSE
//! transport (GET stream for receiving, per-message POST for sending).

pub mod auth;
mod error;
mod legacy;
pub mod sse;
mod stream;
mod streamable;
mod transport;

pub use auth::{OAuthProvider, OAuthTokens, PkceOAuthProvider};
pub use error::{TransportError, classify_status};
pub use legacy::SseClientTransport;
pub use reqwest::Url;
pub use sse::{SseEvent, SseFrame, SseParser};
pub use stream::EventStream;
pub use streamable::StreamableHttpClientTransport;
pub use transport::{
    BoxFuture, ClientTransport, DEFAULT_REQUEST_TIMEOUT_MS, HttpTransportOptions,
    JSON_AND_SSE_ACCEPT, PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER, TransportKind,
    is_event_stream,
};
