//! Scripted transports and OAuth provider shared by the client tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use switchboard_client::{ConnectOptions, TransportFactory, TransportMode};
use switchboard_transport::{
    BoxFuture, ClientTransport, HttpTransportOptions, OAuthProvider, OAuthTokens, TransportError,
    TransportKind, Url, classify_status,
};
use switchboard_types::JsonRpcMessage;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// MockServer
// ---------------------------------------------------------------------------

/// Canned MCP server behind a mock transport.
pub struct MockServer {
    pub capabilities: Value,
    pub instructions: Option<String>,
    /// Results keyed by method, or `method?cursor` for later pages.
    responses: Mutex<HashMap<String, Value>>,
    /// JSON-RPC error codes keyed by method.
    errors: Mutex<HashMap<String, i64>>,
    /// Every request seen, in order.
    pub requests: Mutex<Vec<(String, Option<Value>)>>,
}

impl MockServer {
    pub fn new(capabilities: Value) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            instructions: None,
            responses: Mutex::new(HashMap::new()),
            errors: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn with_instructions(capabilities: Value, instructions: &str) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            instructions: Some(instructions.to_string()),
            responses: Mutex::new(HashMap::new()),
            errors: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn respond(&self, key: &str, result: Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(key.to_string(), result);
    }

    pub fn fail(&self, method: &str, code: i64) {
        self.errors.lock().unwrap().insert(method.to_string(), code);
    }

    pub fn requested(&self, method: &str) -> Vec<Option<Value>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        self.requests
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));

        if method == "initialize" {
            let mut result = json!({
                "protocolVersion": "2025-06-18",
                "capabilities": self.capabilities,
                "serverInfo": {"name": "mock", "version": "1.0.0"}
            });
            if let Some(instructions) = &self.instructions {
                result["instructions"] = json!(instructions);
            }
            return Ok(result);
        }
        if let Some(code) = self.errors.lock().unwrap().get(method) {
            return Err(TransportError::JsonRpc {
                code: *code,
                message: format!("{method} failed"),
                data: None,
            });
        }
        let cursor = params
            .as_ref()
            .and_then(|p| p.get("cursor"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let key = match cursor {
            Some(cursor) => format!("{method}?{cursor}"),
            None => method.to_string(),
        };
        if method == "tools/call" {
            let name = params
                .as_ref()
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if let Some(result) = self.responses.lock().unwrap().get(&format!("tools/call:{name}")) {
                return Ok(result.clone());
            }
        }
        self.responses
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| TransportError::JsonRpc {
                code: -32601,
                message: format!("Method not found: {method}"),
                data: None,
            })
    }
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub enum Behavior {
    /// Fail the handshake with this HTTP status.
    Status(u16),
    Serve(Arc<MockServer>),
}

pub struct MockTransport {
    pub kind: TransportKind,
    behavior: Behavior,
    url: Url,
    options: HttpTransportOptions,
    incoming_tx: mpsc::UnboundedSender<JsonRpcMessage>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcMessage>>>,
    /// Messages the client sent with `send`.
    pub sent: Mutex<Vec<JsonRpcMessage>>,
    pub closed: Mutex<bool>,
}

impl MockTransport {
    /// Deliver a server-initiated message to the client.
    pub fn push(&self, message: JsonRpcMessage) {
        self.incoming_tx.send(message).unwrap();
    }

    pub fn sent(&self) -> Vec<JsonRpcMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

impl ClientTransport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn start(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }

    fn request<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> BoxFuture<'a, Result<Value, TransportError>> {
        Box::pin(async move {
            match &self.behavior {
                Behavior::Status(status) => {
                    let err = classify_status(*status, "");
                    if err.is_unauthorized() {
                        if let Some(provider) = &self.options.auth_provider {
                            provider.begin_authorization(&self.url).await?;
                        }
                    }
                    Err(err)
                }
                Behavior::Serve(server) => server.handle(method, params),
            }
        })
    }

    fn send(&self, message: JsonRpcMessage) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.sent.lock().unwrap().push(message);
            Ok(())
        })
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>> {
        self.incoming_rx.lock().unwrap().take()
    }

    fn finish_auth<'a>(&'a self, code: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let provider = self
                .options
                .auth_provider
                .as_ref()
                .ok_or_else(|| TransportError::OAuth("no auth provider configured".into()))?;
            provider.exchange_code(code).await?;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            *self.closed.lock().unwrap() = true;
        })
    }
}

// ---------------------------------------------------------------------------
// MockFactory
// ---------------------------------------------------------------------------

/// Hands out mock transports following a per-kind plan. The last planned
/// behavior for a kind repeats.
#[derive(Default)]
pub struct MockFactory {
    plans: Mutex<HashMap<TransportKind, VecDeque<Behavior>>>,
    pub created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn plan(self: &Arc<Self>, kind: TransportKind, behaviors: Vec<Behavior>) -> Arc<Self> {
        self.plans.lock().unwrap().insert(kind, behaviors.into());
        Arc::clone(self)
    }

    /// Kinds of every transport created so far, in order.
    pub fn created_kinds(&self) -> Vec<TransportKind> {
        self.created.lock().unwrap().iter().map(|t| t.kind).collect()
    }

    pub fn last(&self) -> Arc<MockTransport> {
        Arc::clone(self.created.lock().unwrap().last().unwrap())
    }
}

impl TransportFactory for MockFactory {
    fn create(
        &self,
        kind: TransportKind,
        url: &Url,
        options: HttpTransportOptions,
    ) -> Result<Arc<dyn ClientTransport>, TransportError> {
        let behavior = {
            let mut plans = self.plans.lock().unwrap();
            let queue = plans
                .get_mut(&kind)
                .ok_or_else(|| TransportError::Network(format!("no plan for {kind}")))?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        }
        .ok_or_else(|| TransportError::Network(format!("empty plan for {kind}")))?;

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            kind,
            behavior,
            url: url.clone(),
            options,
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            sent: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        });
        self.created.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// OAuth provider accepting the code `"good"` and nothing else.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<ProviderState>,
}

#[derive(Default)]
struct ProviderState {
    client_id: Option<String>,
    server_id: Option<String>,
    authorization_url: Option<String>,
    access_token: Option<String>,
}

impl OAuthProvider for MockProvider {
    fn redirect_url(&self) -> String {
        let server_id = self.server_id().unwrap_or_default();
        format!("http://localhost:8787/oauth/callback/{server_id}")
    }

    fn client_id(&self) -> Option<String> {
        self.state.lock().unwrap().client_id.clone()
    }

    fn set_client_id(&self, client_id: String) {
        self.state.lock().unwrap().client_id = Some(client_id);
    }

    fn server_id(&self) -> Option<String> {
        self.state.lock().unwrap().server_id.clone()
    }

    fn set_server_id(&self, server_id: String) {
        self.state.lock().unwrap().server_id = Some(server_id);
    }

    fn authorization_url(&self) -> Option<String> {
        self.state.lock().unwrap().authorization_url.clone()
    }

    fn access_token(&self) -> Option<String> {
        self.state.lock().unwrap().access_token.clone()
    }

    fn begin_authorization<'a>(
        &'a self,
        _server_url: &'a Url,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            let client_id = state
                .client_id
                .get_or_insert_with(|| "mock-client".to_string())
                .clone();
            state.authorization_url = Some(format!(
                "https://auth.example.com/authorize?client_id={client_id}"
            ));
            Ok(())
        })
    }

    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
    ) -> BoxFuture<'a, Result<OAuthTokens, TransportError>> {
        Box::pin(async move {
            if code != "good" {
                return Err(TransportError::OAuth(format!("invalid code '{code}'")));
            }
            self.state.lock().unwrap().access_token = Some("token-1".to_string());
            Ok(OAuthTokens {
                access_token: "token-1".to_string(),
                token_type: Some("Bearer".to_string()),
                refresh_token: None,
                expires_in: None,
                scope: None,
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn url() -> Url {
    Url::parse("http://upstream.test/mcp").unwrap()
}

pub fn options(mode: TransportMode, factory: &Arc<MockFactory>) -> ConnectOptions {
    ConnectOptions {
        transport: mode,
        transport_factory: Some(Arc::clone(factory) as Arc<dyn TransportFactory>),
        ..ConnectOptions::default()
    }
}

/// A server advertising tools with one `add` tool.
pub fn tool_server() -> Arc<MockServer> {
    let server = MockServer::new(json!({"tools": {"listChanged": true}}));
    server.respond(
        "tools/list",
        json!({"tools": [{"name": "add", "description": "Add two numbers"}]}),
    );
    server
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
