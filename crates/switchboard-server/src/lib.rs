//! Server side of MCP for Switchboard.
//!
//! Sessions multiplex many concurrent JSON-RPC requests onto the HTTP streams
//! attached to them: a Streamable HTTP transport (one endpoint; POST, GET and
//! DELETE) and the legacy HTTP+SSE transport. Elicitation lets tools ask the
//! connected client for input mid-call.

pub mod elicitation;
mod error;
pub mod event_store;
mod handler;
mod http;
mod legacy;
mod router;
mod session;
pub mod storage;
mod stream;
mod streamable;

pub use elicitation::{
    DEFAULT_ELICITATION_TIMEOUT, ElicitationBroker, PendingElicitation, SessionElicitor,
};
pub use error::{HttpRejection, ServerError};
pub use event_store::{EventStore, InMemoryEventStore, Replay};
pub use handler::{MessageHandler, RequestContext, SessionSink};
pub use http::{McpServer, ServerOptions};
pub use legacy::{LegacySession, LegacySseTransport};
pub use router::ToolRouter;
pub use session::{AttachError, Session, StreamRole};
pub use storage::{KeyValueStore, MemoryStore};
pub use stream::{ConnectionId, SessionStream};
pub use streamable::{PostOutcome, RequestHeaders, StreamableHttpTransport};
