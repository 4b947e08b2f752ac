//! Structured events describing MCP client lifecycle milestones.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "mcp:client:connect")]
    ClientConnect,
    #[serde(rename = "mcp:client:discover")]
    ClientDiscover,
    #[serde(rename = "mcp:client:preconnect")]
    ClientPreconnect,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ClientConnect => "mcp:client:connect",
            EventKind::ClientDiscover => "mcp:client:discover",
            EventKind::ClientPreconnect => "mcp:client:preconnect",
        }
    }
}

/// `{type, displayMessage, payload, timestamp, id}` as delivered to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilityEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub display_message: String,
    pub payload: Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub id: String,
}

impl ObservabilityEvent {
    pub fn new(kind: EventKind, display_message: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            display_message: display_message.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
            id: uuid::Uuid::new_v4().to_string(),
        }
    }
}
