//! JSON-RPC 2.0 envelope types shared by the client and server halves.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ProtocolError;

/// The only JSON-RPC version we speak.
pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Implementation-defined: generic transport-level rejection.
pub const CONNECTION_CLOSED: i64 = -32000;
/// Implementation-defined: the session id is not known to this server.
pub const SESSION_NOT_FOUND: i64 = -32001;

/// A request id. Servers must echo it back with the exact same type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A successful JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: Value,
}

impl JsonRpcResponse {
    pub fn new(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// An error response. The id is `null` when the failing request could not be
/// identified (e.g. the body did not parse).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    pub error: JsonRpcError,
}

impl JsonRpcErrorResponse {
    pub fn new(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error,
        }
    }
}

/// Any JSON-RPC message that can travel over an MCP transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcErrorResponse),
}

impl JsonRpcMessage {
    /// Classify a decoded JSON value as one of the four message shapes.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(map) = &value else {
            return Err(ProtocolError::InvalidMessage(
                "message must be a JSON object".into(),
            ));
        };

        if map.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(ProtocolError::InvalidMessage(
                "jsonrpc field must be \"2.0\"".into(),
            ));
        }

        let has_id = map.get("id").is_some_and(|id| !id.is_null());
        let invalid = |e: serde_json::Error| ProtocolError::InvalidMessage(e.to_string());

        if map.contains_key("method") {
            if has_id {
                serde_json::from_value(value)
                    .map(JsonRpcMessage::Request)
                    .map_err(invalid)
            } else {
                serde_json::from_value(value)
                    .map(JsonRpcMessage::Notification)
                    .map_err(invalid)
            }
        } else if map.contains_key("result") && has_id {
            serde_json::from_value(value)
                .map(JsonRpcMessage::Response)
                .map_err(invalid)
        } else if map.contains_key("error") {
            serde_json::from_value(value)
                .map(JsonRpcMessage::Error)
                .map_err(invalid)
        } else {
            Err(ProtocolError::InvalidMessage(
                "message is neither a request, notification, response nor error".into(),
            ))
        }
    }

    /// Parse an HTTP body holding either a single message or a batch array.
    pub fn parse_body(body: &[u8]) -> Result<Vec<JsonRpcMessage>, ProtocolError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| ProtocolError::Parse(e.to_string()))?;
        match value {
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(ProtocolError::EmptyBatch);
                }
                items.into_iter().map(Self::from_value).collect()
            }
            single => Ok(vec![Self::from_value(single)?]),
        }
    }

    /// Build a notification message.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification::new(method, params))
    }

    /// Build a success response message.
    pub fn response(id: RequestId, result: Value) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse::new(id, result))
    }

    /// Build an error response message.
    pub fn error(id: Option<RequestId>, code: i64, message: impl Into<String>) -> Self {
        JsonRpcMessage::Error(JsonRpcErrorResponse::new(
            id,
            JsonRpcError::new(code, message),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(_))
    }

    /// The id of a response or error, i.e. the id that routes it.
    pub fn response_id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Response(r) => Some(&r.id),
            JsonRpcMessage::Error(e) => e.id.as_ref(),
            _ => None,
        }
    }

    /// True for responses and errors: the messages that finish a request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_))
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        JsonRpcMessage::from_value(value).map_err(D::Error::custom)
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(r: JsonRpcRequest) -> Self {
        JsonRpcMessage::Request(r)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(n: JsonRpcNotification) -> Self {
        JsonRpcMessage::Notification(n)
    }
}
