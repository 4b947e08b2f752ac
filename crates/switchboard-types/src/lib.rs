//! Shared types and error hierarchy for Switchboard.

pub mod error;
pub mod jsonrpc;
pub mod mcp;
pub mod observability;
pub mod tool;

pub use error::{ConfigError, ProtocolError, ToolError};
pub use jsonrpc::*;
pub use mcp::*;
pub use observability::{EventKind, ObservabilityEvent};
pub use tool::*;
