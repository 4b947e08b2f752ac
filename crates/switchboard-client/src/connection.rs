//! One upstream MCP server connection.
//!
//! Handles transport selection (Streamable HTTP, legacy SSE, or auto with
//! fallback), the OAuth pause when the server answers 401, the protocol
//! handshake, capability discovery and server-initiated messages.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::{Value, json};
use switchboard_transport::{
    BoxFuture, ClientTransport, HttpTransportOptions, OAuthProvider, SseClientTransport,
    StreamableHttpClientTransport, TransportError, TransportKind, Url,
};
use switchboard_types::{
    CallToolParams, CallToolResult, ClientCapabilities, ElicitRequestParams, ElicitResult,
    EventKind, GetPromptParams, GetPromptResult, INTERNAL_ERROR, INVALID_PARAMS, Implementation,
    InitializeParams, InitializeResult, JsonRpcMessage, JsonRpcRequest,
    LATEST_PROTOCOL_VERSION, ListPage, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, METHOD_NOT_FOUND, ObservabilityEvent, Prompt,
    ReadResourceParams, ReadResourceResult, Resource, ResourceTemplate, ServerCapabilities,
    ToolInfo, method,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{ConnectOptions, TransportMode};
use crate::error::ClientError;
use crate::events::EventEmitter;
use crate::state::ConnectionState;

/// Creates transport instances for a connection.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        kind: TransportKind,
        url: &Url,
        options: HttpTransportOptions,
    ) -> Result<Arc<dyn ClientTransport>, TransportError>;
}

/// Builds the real HTTP transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpTransportFactory;

impl TransportFactory for HttpTransportFactory {
    fn create(
        &self,
        kind: TransportKind,
        url: &Url,
        options: HttpTransportOptions,
    ) -> Result<Arc<dyn ClientTransport>, TransportError> {
        Ok(match kind {
            TransportKind::StreamableHttp => {
                Arc::new(StreamableHttpClientTransport::new(url.clone(), options)?)
            }
            TransportKind::Sse => Arc::new(SseClientTransport::new(url.clone(), options)?),
        })
    }
}

/// Answers `elicitation/create` requests from an upstream server.
pub trait ElicitationHandler: Send + Sync {
    fn elicit(&self, params: ElicitRequestParams) -> BoxFuture<'_, Result<ElicitResult, ClientError>>;
}

/// The transport that reported the 401, kept until the code exchange.
struct AuthChallenge {
    kind: TransportKind,
    transport: Arc<dyn ClientTransport>,
}

struct Inner {
    state: ConnectionState,
    transport: Option<Arc<dyn ClientTransport>>,
    connected_transport: Option<TransportKind>,
    auth_challenge: Option<AuthChallenge>,
    init: Option<InitializeResult>,
    instructions: Option<String>,
    tools: Vec<ToolInfo>,
    resources: Vec<Resource>,
    prompts: Vec<Prompt>,
    resource_templates: Vec<ResourceTemplate>,
}

/// Client for a single upstream MCP server.
pub struct ClientConnection {
    url: Url,
    options: ConnectOptions,
    factory: Arc<dyn TransportFactory>,
    events: EventEmitter,
    inner: Mutex<Inner>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl ClientConnection {
    pub fn new(url: Url, options: ConnectOptions) -> Arc<Self> {
        let factory = options
            .transport_factory
            .clone()
            .unwrap_or_else(|| Arc::new(HttpTransportFactory));
        Arc::new(Self {
            url,
            options,
            factory,
            events: EventEmitter::new(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Connecting,
                transport: None,
                connected_transport: None,
                auth_challenge: None,
                init: None,
                instructions: None,
                tools: Vec::new(),
                resources: Vec::new(),
                prompts: Vec::new(),
                resource_templates: Vec::new(),
            }),
            pump: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expect_state(&self, expected: ConnectionState) -> Result<(), ClientError> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(ClientError::InvalidState { expected, actual })
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut inner = self.lock();
        if inner.state.can_transition_to(next) {
            tracing::debug!("{}: {} -> {}", self.url, inner.state, next);
            inner.state = next;
        } else {
            tracing::warn!(
                "{}: refusing state transition {} -> {}",
                self.url,
                inner.state,
                next
            );
        }
    }

    fn emit(&self, kind: EventKind, message: String, payload: Value) {
        self.events.emit(kind, message, payload);
    }

    fn emit_failure(&self, message: String, error: &dyn fmt::Display) {
        tracing::warn!("{message}: {error}");
        self.emit(
            EventKind::ClientConnect,
            message,
            json!({ "url": self.url.as_str(), "error": error.to_string() }),
        );
    }

    fn fail(&self) {
        self.set_state(ConnectionState::Failed);
    }

    /// Connect, then discover capabilities.
    ///
    /// A 401 parks the connection in `authenticating` and returns `Ok`; the
    /// caller finishes the flow with [`complete_authorization`] and
    /// [`establish_connection`].
    ///
    /// [`complete_authorization`]: ClientConnection::complete_authorization
    /// [`establish_connection`]: ClientConnection::establish_connection
    pub async fn init(self: &Arc<Self>) -> Result<(), ClientError> {
        self.expect_state(ConnectionState::Connecting)?;
        match self.try_connect().await {
            Ok(()) => {
                self.set_state(ConnectionState::Discovering);
                self.discover_and_register().await
            }
            Err(e) if e.is_unauthorized() => {
                tracing::info!("{} requires authorization", self.url);
                self.set_state(ConnectionState::Authenticating);
                Ok(())
            }
            Err(e) => {
                self.fail();
                self.emit_failure(format!("Failed to connect to {}", self.url), &e);
                Err(e.into())
            }
        }
    }

    /// Run transport selection: at most two transports, and only `auto`
    /// falls back.
    async fn try_connect(self: &Arc<Self>) -> Result<(), TransportError> {
        let mode = self.options.transport;
        match self.connect_via(mode.first_kind()).await {
            Err(e) if mode == TransportMode::Auto && e.is_not_implemented() => {
                self.emit(
                    EventKind::ClientConnect,
                    format!(
                        "Streamable HTTP not supported by {}, falling back to SSE",
                        self.url
                    ),
                    json!({ "url": self.url.as_str(), "error": e.to_string() }),
                );
                self.connect_via(TransportKind::Sse).await
            }
            other => other,
        }
    }

    async fn connect_via(self: &Arc<Self>, kind: TransportKind) -> Result<(), TransportError> {
        let options = HttpTransportOptions {
            headers: self.options.headers.clone(),
            auth_provider: self.options.auth_provider.clone(),
            request_timeout_ms: self.options.request_timeout_ms,
        };
        let transport = self.factory.create(kind, &self.url, options)?;

        let init = match self.handshake(transport.as_ref()).await {
            Ok(init) => init,
            Err(e) => {
                if e.is_unauthorized() {
                    self.lock().auth_challenge = Some(AuthChallenge {
                        kind,
                        transport: Arc::clone(&transport),
                    });
                } else {
                    transport.close().await;
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Connected to {} ({}) using {kind}",
            self.url,
            init.server_info.name
        );
        let incoming = transport.take_incoming();
        {
            let mut inner = self.lock();
            inner.init = Some(init);
            inner.transport = Some(Arc::clone(&transport));
            inner.connected_transport = Some(kind);
        }
        if let Some(rx) = incoming {
            self.start_pump(Arc::clone(&transport), rx);
        }
        self.emit(
            EventKind::ClientConnect,
            format!("Connected successfully using {kind} transport for {}", self.url),
            json!({ "url": self.url.as_str(), "transport": kind.as_str() }),
        );
        Ok(())
    }

    async fn handshake(
        &self,
        transport: &dyn ClientTransport,
    ) -> Result<InitializeResult, TransportError> {
        transport.start().await?;

        let capabilities = ClientCapabilities {
            elicitation: self.options.elicitation_handler.as_ref().map(|_| json!({})),
            ..ClientCapabilities::default()
        };
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities,
            client_info: self.options.client_info.clone(),
        };
        let result = transport
            .request(method::INITIALIZE, Some(serde_json::to_value(params)?))
            .await?;
        let init: InitializeResult = serde_json::from_value(result)?;

        transport.set_protocol_version(&init.protocol_version);
        transport
            .send(JsonRpcMessage::notification(method::INITIALIZED, None))
            .await?;
        Ok(init)
    }

    /// Finish the OAuth code exchange through the transport that saw the 401.
    pub async fn complete_authorization(&self, code: &str) -> Result<(), ClientError> {
        self.expect_state(ConnectionState::Authenticating)?;
        let challenge = self.lock().auth_challenge.take();
        let Some(challenge) = challenge else {
            self.fail();
            return Err(ClientError::NotConnected);
        };

        tracing::debug!(
            "Completing authorization for {} via {}",
            self.url,
            challenge.kind
        );
        let outcome = challenge.transport.finish_auth(code).await;
        challenge.transport.close().await;
        match outcome {
            Ok(()) => {
                self.set_state(ConnectionState::Connecting);
                Ok(())
            }
            Err(e) => {
                self.fail();
                Err(e.into())
            }
        }
    }

    /// Connect again after authorization and run discovery.
    pub async fn establish_connection(self: &Arc<Self>) -> Result<(), ClientError> {
        self.expect_state(ConnectionState::Connecting)?;
        match self.try_connect().await {
            Ok(()) => {
                self.set_state(ConnectionState::Discovering);
                self.discover_and_register().await
            }
            Err(e) => {
                self.fail();
                self.emit_failure(format!("Failed to connect to {}", self.url), &e);
                Err(e.into())
            }
        }
    }

    /// Fetch instructions, tools, resources, prompts and resource templates
    /// concurrently. Individual failures leave that list empty.
    pub async fn discover_and_register(&self) -> Result<(), ClientError> {
        self.expect_state(ConnectionState::Discovering)?;
        let Some(capabilities) = self.server_capabilities() else {
            self.fail();
            return Err(ClientError::MissingCapabilities {
                url: self.url.to_string(),
            });
        };
        let transport = self.transport()?;
        let transport = transport.as_ref();
        let has_resources = capabilities.resources.is_some();

        let (instructions, tools, resources, prompts, resource_templates) = tokio::join!(
            self.fetch_instructions(),
            self.fetch_list::<ListToolsResult>(transport, capabilities.tools.is_some(), "tools"),
            self.fetch_list::<ListResourcesResult>(transport, has_resources, "resources"),
            self.fetch_list::<ListPromptsResult>(transport, capabilities.prompts.is_some(), "prompts"),
            self.fetch_list::<ListResourceTemplatesResult>(
                transport,
                has_resources,
                "resource templates"
            ),
        );

        tracing::info!(
            "Discovered {} tools, {} resources, {} prompts on {}",
            tools.len(),
            resources.len(),
            prompts.len(),
            self.url
        );
        {
            let mut inner = self.lock();
            inner.instructions = instructions;
            inner.tools = tools;
            inner.resources = resources;
            inner.prompts = prompts;
            inner.resource_templates = resource_templates;
        }
        self.set_state(ConnectionState::Ready);
        Ok(())
    }

    async fn fetch_instructions(&self) -> Option<String> {
        self.lock()
            .init
            .as_ref()
            .and_then(|init| init.instructions.clone())
    }

    /// Follow `nextCursor` until the listing is exhausted.
    async fn fetch_list<P: ListPage>(
        &self,
        transport: &dyn ClientTransport,
        advertised: bool,
        label: &str,
    ) -> Vec<P::Item> {
        if !advertised {
            return Vec::new();
        }
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page = match transport.request(P::METHOD, params).await {
                Ok(value) => serde_json::from_value::<P>(value).map_err(TransportError::from),
                Err(e) => Err(e),
            };
            match page {
                Ok(page) => {
                    let (page_items, next) = page.into_parts();
                    items.extend(page_items);
                    match next {
                        Some(next) if cursor.as_deref() != Some(next.as_str()) => {
                            cursor = Some(next)
                        }
                        _ => return items,
                    }
                }
                Err(e) if e.is_method_not_found() => {
                    let message = format!(
                        "The server {} advertised support for {label} but does not implement {}",
                        self.url,
                        P::METHOD
                    );
                    tracing::warn!("{message}");
                    self.emit(
                        EventKind::ClientDiscover,
                        message,
                        json!({ "url": self.url.as_str(), "method": P::METHOD }),
                    );
                    return items;
                }
                Err(e) => {
                    let message = format!("Failed to discover {label} for {}", self.url);
                    tracing::warn!("{message}: {e}");
                    self.emit(
                        EventKind::ClientDiscover,
                        message,
                        json!({ "url": self.url.as_str(), "error": e.to_string() }),
                    );
                    return Vec::new();
                }
            }
        }
    }

    fn start_pump(
        self: &Arc<Self>,
        transport: Arc<dyn ClientTransport>,
        rx: mpsc::UnboundedReceiver<JsonRpcMessage>,
    ) {
        let handle = tokio::spawn(run_pump(Arc::downgrade(self), transport, rx));
        let previous = self
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn handle_incoming(
        self: &Arc<Self>,
        transport: &Arc<dyn ClientTransport>,
        message: JsonRpcMessage,
    ) {
        match message {
            JsonRpcMessage::Request(request) => {
                let conn = Arc::clone(self);
                let transport = Arc::clone(transport);
                // Elicitation may wait on a human; keep the pump moving.
                tokio::spawn(async move {
                    let reply = conn.answer_request(request).await;
                    if let Err(e) = transport.send(reply).await {
                        tracing::warn!("Failed to answer request from {}: {e}", conn.url);
                    }
                });
            }
            JsonRpcMessage::Notification(notification) => {
                match notification.method.as_str() {
                    method::TOOLS_LIST_CHANGED => self.refresh_tools().await,
                    method::RESOURCES_LIST_CHANGED => self.refresh_resources().await,
                    method::PROMPTS_LIST_CHANGED => self.refresh_prompts().await,
                    other => tracing::debug!("Notification from {}: {other}", self.url),
                }
            }
            other => tracing::debug!("Ignoring unsolicited message from {}: {other:?}", self.url),
        }
    }

    async fn answer_request(&self, request: JsonRpcRequest) -> JsonRpcMessage {
        let id = request.id.clone();
        match request.method.as_str() {
            method::PING => JsonRpcMessage::response(id, json!({})),
            method::ELICITATION_CREATE => {
                let Some(handler) = self.options.elicitation_handler.clone() else {
                    return JsonRpcMessage::error(
                        Some(id),
                        METHOD_NOT_FOUND,
                        "Elicitation is not supported by this client",
                    );
                };
                let params = match request
                    .params
                    .map(serde_json::from_value::<ElicitRequestParams>)
                {
                    Some(Ok(params)) => params,
                    Some(Err(e)) => {
                        return JsonRpcMessage::error(Some(id), INVALID_PARAMS, e.to_string());
                    }
                    None => {
                        return JsonRpcMessage::error(
                            Some(id),
                            INVALID_PARAMS,
                            "elicitation/create requires params",
                        );
                    }
                };
                match handler.elicit(params).await {
                    Ok(result) => match serde_json::to_value(result) {
                        Ok(value) => JsonRpcMessage::response(id, value),
                        Err(e) => JsonRpcMessage::error(Some(id), INTERNAL_ERROR, e.to_string()),
                    },
                    Err(e) => JsonRpcMessage::error(Some(id), INTERNAL_ERROR, e.to_string()),
                }
            }
            other => JsonRpcMessage::error(
                Some(id),
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        }
    }

    async fn refresh_tools(&self) {
        let Ok(transport) = self.transport() else {
            return;
        };
        let advertised = self
            .server_capabilities()
            .is_some_and(|c| c.tools.as_ref().is_some_and(|t| t.list_changed));
        if !advertised {
            return;
        }
        let tools = self
            .fetch_list::<ListToolsResult>(transport.as_ref(), true, "tools")
            .await;
        tracing::debug!("Tool list of {} changed ({} tools)", self.url, tools.len());
        self.lock().tools = tools;
    }

    async fn refresh_resources(&self) {
        let Ok(transport) = self.transport() else {
            return;
        };
        let advertised = self
            .server_capabilities()
            .is_some_and(|c| c.resources.as_ref().is_some_and(|r| r.list_changed));
        if !advertised {
            return;
        }
        let resources = self
            .fetch_list::<ListResourcesResult>(transport.as_ref(), true, "resources")
            .await;
        self.lock().resources = resources;
    }

    async fn refresh_prompts(&self) {
        let Ok(transport) = self.transport() else {
            return;
        };
        let advertised = self
            .server_capabilities()
            .is_some_and(|c| c.prompts.as_ref().is_some_and(|p| p.list_changed));
        if !advertised {
            return;
        }
        let prompts = self
            .fetch_list::<ListPromptsResult>(transport.as_ref(), true, "prompts")
            .await;
        self.lock().prompts = prompts;
    }

    fn transport(&self) -> Result<Arc<dyn ClientTransport>, ClientError> {
        self.lock().transport.clone().ok_or(ClientError::NotConnected)
    }

    /// Call a tool on this server.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, ClientError> {
        let transport = self.transport()?;
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let result = transport
            .request(method::TOOLS_CALL, Some(serde_json::to_value(params)?))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, ClientError> {
        let transport = self.transport()?;
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        let result = transport
            .request(method::RESOURCES_READ, Some(serde_json::to_value(params)?))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResult, ClientError> {
        let transport = self.transport()?;
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        let result = transport
            .request(method::PROMPTS_GET, Some(serde_json::to_value(params)?))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Stop the inbound pump and close every transport this connection holds.
    pub async fn close(&self) {
        let pump = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pump) = pump {
            pump.abort();
        }
        let (transport, challenge) = {
            let mut inner = self.lock();
            (inner.transport.take(), inner.auth_challenge.take())
        };
        if let Some(transport) = transport {
            transport.close().await;
        }
        if let Some(challenge) = challenge {
            challenge.transport.close().await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn tools(&self) -> Vec<ToolInfo> {
        self.lock().tools.clone()
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.lock().resources.clone()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.lock().prompts.clone()
    }

    pub fn resource_templates(&self) -> Vec<ResourceTemplate> {
        self.lock().resource_templates.clone()
    }

    pub fn instructions(&self) -> Option<String> {
        self.lock().instructions.clone()
    }

    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.lock().init.as_ref().map(|i| i.capabilities.clone())
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.lock().init.as_ref().map(|i| i.server_info.clone())
    }

    /// The transport of the last successful connect.
    pub fn connected_transport(&self) -> Option<TransportKind> {
        self.lock().connected_transport
    }

    pub fn auth_provider(&self) -> Option<Arc<dyn OAuthProvider>> {
        self.options.auth_provider.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObservabilityEvent> {
        self.events.subscribe()
    }
}

async fn run_pump(
    connection: Weak<ClientConnection>,
    transport: Arc<dyn ClientTransport>,
    mut rx: mpsc::UnboundedReceiver<JsonRpcMessage>,
) {
    while let Some(message) = rx.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        connection.handle_incoming(&transport, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connection_starts_connecting() {
        let url = Url::parse("http://localhost:1/mcp").unwrap();
        let conn = ClientConnection::new(url, ConnectOptions::default());
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.tools().is_empty());
        assert!(conn.server_capabilities().is_none());
        assert!(conn.connected_transport().is_none());
    }

    #[tokio::test]
    async fn wrong_state_is_rejected() {
        let url = Url::parse("http://localhost:1/mcp").unwrap();
        let conn = ClientConnection::new(url, ConnectOptions::default());
        match conn.complete_authorization("code").await {
            Err(ClientError::InvalidState { expected, actual }) => {
                assert_eq!(expected, ConnectionState::Authenticating);
                assert_eq!(actual, ConnectionState::Connecting);
            }
            other => panic!("Expected InvalidState, got: {other:?}"),
        }
        assert!(matches!(
            conn.discover_and_register().await,
            Err(ClientError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn operations_require_a_transport() {
        let url = Url::parse("http://localhost:1/mcp").unwrap();
        let conn = ClientConnection::new(url, ConnectOptions::default());
        assert!(matches!(
            conn.call_tool("add", None).await,
            Err(ClientError::NotConnected)
        ));
        conn.close().await;
    }
}
