//! Server-Sent Events framing.
//!
//! [`SseParser`] turns raw response text into events according to the W3C
//! EventSource rules; [`SseFrame`] produces the records MCP servers emit
//! (`event: message` for JSON-RPC traffic, `event: endpoint` for the legacy
//! transport's POST URL).

use switchboard_types::JsonRpcMessage;

/// Event name carrying a JSON-RPC message.
pub const MESSAGE_EVENT: &str = "message";
/// Event name the legacy transport uses to announce its POST URL.
pub const ENDPOINT_EVENT: &str = "endpoint";

/// A single SSE event parsed from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Events without a name default to `message`.
    pub fn is_message(&self) -> bool {
        self.event_type.as_deref().is_none_or(|t| t == MESSAGE_EVENT)
    }
}

/// Incremental SSE parser that processes text into events.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of text and return any complete events.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        if chunk.contains('\r') {
            self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        } else {
            self.buffer.push_str(chunk);
        }
        let mut events = Vec::new();

        // Process complete event blocks (separated by blank lines)
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();

            if let Some(event) = Self::parse_block(&block[..pos]) {
                events.push(event);
            }
        }

        events
    }

    /// Parse a single SSE block (lines between blank lines) into an event.
    fn parse_block(block: &str) -> Option<SseEvent> {
        let mut event_type = None;
        let mut id = None;
        let mut data_lines = Vec::new();

        for line in block.lines() {
            if line.starts_with(':') {
                continue;
            }

            if let Some((field, value)) = line.split_once(':') {
                let value = value.strip_prefix(' ').unwrap_or(value);
                match field {
                    "event" => event_type = Some(value.to_string()),
                    "data" => data_lines.push(value.to_string()),
                    "id" => id = Some(value.to_string()),
                    _ => {}
                }
            } else if line == "data" {
                data_lines.push(String::new());
            }
        }

        if data_lines.is_empty() {
            return None;
        }

        Some(SseEvent {
            event_type,
            data: data_lines.join("\n"),
            id,
        })
    }
}

/// An outgoing SSE record.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    event: &'static str,
    id: Option<String>,
    data: String,
}

impl SseFrame {
    /// A JSON-RPC message frame, optionally tagged with a replay id.
    pub fn message(message: &JsonRpcMessage, id: Option<String>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: MESSAGE_EVENT,
            id,
            data: serde_json::to_string(message)?,
        })
    }

    /// The legacy transport's `endpoint` announcement.
    pub fn endpoint(url: impl Into<String>) -> Self {
        Self {
            event: ENDPOINT_EVENT,
            id: None,
            data: url.into(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Render the record, terminated by a blank line.
    pub fn encode(&self) -> String {
        let mut out = format!("event: {}\n", self.event);
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}
