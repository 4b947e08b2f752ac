//! The client transport abstraction and the plumbing both HTTP transports
//! share: request-id allocation, response correlation and header handling.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Url;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_types::{JsonRpcMessage, JsonRpcRequest, RequestId};
use tokio::sync::{mpsc, oneshot};

use crate::auth::OAuthProvider;
use crate::error::{TransportError, classify_status};

/// Boxed future returned by the object-safe transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Header carrying the Streamable HTTP session id.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";
/// Header carrying the negotiated protocol revision.
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";
/// Accept value a Streamable HTTP POST must carry.
pub const JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// The two wire protocols an upstream server may speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    StreamableHttp,
    Sse,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::StreamableHttp => "streamable-http",
            TransportKind::Sse => "sse",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streamable-http" => Ok(TransportKind::StreamableHttp),
            "sse" => Ok(TransportKind::Sse),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// A connection to one upstream MCP server over some wire protocol.
pub trait ClientTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Open the receive side. Called once before the first request.
    fn start(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Send a request and wait for the `result` of its response.
    fn request<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> BoxFuture<'a, Result<Value, TransportError>>;

    /// Send a notification, or a response to a server-initiated request.
    fn send(&self, message: JsonRpcMessage) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Server-initiated requests and notifications. Yields `Some` once.
    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>>;

    /// Record the protocol revision agreed during `initialize`.
    fn set_protocol_version(&self, _version: &str) {}

    /// Complete an OAuth authorization-code exchange started by a 401.
    fn finish_auth<'a>(&'a self, code: &'a str) -> BoxFuture<'a, Result<(), TransportError>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Settings shared by both HTTP transports.
#[derive(Clone)]
pub struct HttpTransportOptions {
    pub headers: HashMap<String, String>,
    pub auth_provider: Option<Arc<dyn OAuthProvider>>,
    pub request_timeout_ms: u64,
}

impl Default for HttpTransportOptions {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            auth_provider: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl fmt::Debug for HttpTransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransportOptions")
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("auth_provider", &self.auth_provider.is_some())
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

/// Correlates responses with the requests waiting on them and forwards
/// everything else to the incoming channel.
pub(crate) struct Dispatcher {
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcMessage>>>,
    incoming_tx: mpsc::UnboundedSender<JsonRpcMessage>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcMessage>>>,
    timeout_ms: u64,
}

impl Dispatcher {
    pub(crate) fn new(timeout_ms: u64) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            next_id: AtomicI64::new(0),
            pending: Mutex::new(HashMap::new()),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            timeout_ms,
        }
    }

    /// Allocate an id and register a waiter for its response.
    pub(crate) fn begin(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> (JsonRpcRequest, oneshot::Receiver<JsonRpcMessage>) {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id.clone(), tx);
        (JsonRpcRequest::new(id, method, params), rx)
    }

    pub(crate) fn forget(&self, id: &RequestId) {
        self.lock_pending().remove(id);
    }

    /// Route one inbound message.
    pub(crate) fn dispatch(&self, message: JsonRpcMessage) {
        if let Some(id) = message.response_id() {
            let waiter = self.lock_pending().remove(id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => tracing::debug!("Dropping response for unknown request id {id}"),
            }
            return;
        }
        if message.is_terminal() {
            tracing::warn!("Dropping error response without an id: {message:?}");
            return;
        }
        if self.incoming_tx.send(message).is_err() {
            tracing::debug!("Incoming channel closed; dropping server message");
        }
    }

    /// Wait for the response to `request`, honoring the request timeout.
    pub(crate) async fn wait(
        &self,
        request: &JsonRpcRequest,
        rx: oneshot::Receiver<JsonRpcMessage>,
    ) -> Result<Value, TransportError> {
        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), rx).await {
            Ok(Ok(JsonRpcMessage::Response(resp))) => Ok(resp.result),
            Ok(Ok(JsonRpcMessage::Error(err))) => Err(TransportError::JsonRpc {
                code: err.error.code,
                message: err.error.message,
                data: err.error.data,
            }),
            Ok(Ok(other)) => Err(TransportError::Protocol(format!(
                "unexpected message in place of a response: {other:?}"
            ))),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.forget(&request.id);
                Err(TransportError::Timeout {
                    method: request.method.clone(),
                    timeout_ms: self.timeout_ms,
                })
            }
        }
    }

    pub(crate) fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>> {
        self.incoming_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Fail every outstanding request with [`TransportError::Closed`].
    pub(crate) fn fail_pending(&self) {
        self.lock_pending().clear();
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<RequestId, oneshot::Sender<JsonRpcMessage>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// HTTP client, target URL and header/auth policy.
pub(crate) struct HttpBase {
    pub(crate) http: reqwest::Client,
    pub(crate) url: Url,
    pub(crate) options: HttpTransportOptions,
}

impl HttpBase {
    pub(crate) fn new(url: Url, options: HttpTransportOptions) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self { http, url, options })
    }

    /// Custom headers plus the bearer token, if one is available.
    pub(crate) fn headers(&self, accept: &'static str) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(accept));
        for (name, value) in &self.options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Protocol(format!("bad header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Protocol(format!("bad header value: {e}")))?;
            headers.insert(name, value);
        }
        if let Some(token) = self
            .options
            .auth_provider
            .as_ref()
            .and_then(|p| p.access_token())
        {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| TransportError::OAuth("access token is not a valid header".into()))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Turn a non-success response into an error, starting OAuth on a 401.
    pub(crate) async fn reject(&self, response: reqwest::Response) -> TransportError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let err = classify_status(status, &body);
        if err.is_unauthorized() {
            if let Some(provider) = &self.options.auth_provider {
                if let Err(e) = provider.begin_authorization(&self.url).await {
                    tracing::warn!("Failed to prepare OAuth authorization for {}: {e}", self.url);
                }
            }
        }
        err
    }

    pub(crate) async fn finish_auth(&self, code: &str) -> Result<(), TransportError> {
        let provider = self
            .options
            .auth_provider
            .as_ref()
            .ok_or_else(|| TransportError::OAuth("no auth provider configured".into()))?;
        provider.exchange_code(code).await?;
        Ok(())
    }
}

/// Whether a `Content-Type` value denotes an SSE body.
pub fn is_event_stream(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| {
        ct.split(';')
            .next()
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/event-stream"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_parse_and_display() {
        assert_eq!(
            "streamable-http".parse::<TransportKind>().unwrap(),
            TransportKind::StreamableHttp
        );
        assert_eq!(TransportKind::Sse.to_string(), "sse");
        assert!("websocket".parse::<TransportKind>().is_err());
    }

    #[test]
    fn event_stream_detection() {
        assert!(is_event_stream(Some("text/event-stream")));
        assert!(is_event_stream(Some("text/event-stream; charset=utf-8")));
        assert!(!is_event_stream(Some("application/json")));
        assert!(!is_event_stream(None));
    }

    #[tokio::test]
    async fn dispatcher_correlates_responses() {
        let dispatcher = Dispatcher::new(1000);
        let (request, rx) = dispatcher.begin("tools/list", None);
        dispatcher.dispatch(JsonRpcMessage::response(
            request.id.clone(),
            serde_json::json!({"tools": []}),
        ));
        let result = dispatcher.wait(&request, rx).await.unwrap();
        assert_eq!(result["tools"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn dispatcher_maps_error_responses() {
        let dispatcher = Dispatcher::new(1000);
        let (request, rx) = dispatcher.begin("prompts/list", None);
        dispatcher.dispatch(JsonRpcMessage::error(
            Some(request.id.clone()),
            -32601,
            "Method not found",
        ));
        let err = dispatcher.wait(&request, rx).await.unwrap_err();
        assert!(err.is_method_not_found());
    }

    #[tokio::test]
    async fn dispatcher_forwards_server_messages() {
        let dispatcher = Dispatcher::new(1000);
        let mut incoming = dispatcher.take_incoming().unwrap();
        assert!(dispatcher.take_incoming().is_none());
        dispatcher.dispatch(JsonRpcMessage::notification(
            "notifications/tools/list_changed",
            None,
        ));
        let msg = incoming.recv().await.unwrap();
        assert_eq!(msg.method(), Some("notifications/tools/list_changed"));
    }

    #[tokio::test]
    async fn dispatcher_times_out() {
        let dispatcher = Dispatcher::new(20);
        let (request, rx) = dispatcher.begin("slow", None);
        match dispatcher.wait(&request, rx).await {
            Err(TransportError::Timeout { method, timeout_ms }) => {
                assert_eq!(method, "slow");
                assert_eq!(timeout_ms, 20);
            }
            other => panic!("Expected Timeout, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn closing_fails_waiters() {
        let dispatcher = Dispatcher::new(1000);
        let (request, rx) = dispatcher.begin("tools/list", None);
        dispatcher.fail_pending();
        assert!(matches!(
            dispatcher.wait(&request, rx).await,
            Err(TransportError::Closed)
        ));
    }
}
