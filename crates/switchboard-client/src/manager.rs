//! Client manager: orchestrates many upstream server connections.
//!
//! Each connection is registered under a short generated server id. The
//! manager routes OAuth callbacks back to the connection that started the flow
//! and flattens every server's tools, resources and prompts into one
//! namespace.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use switchboard_transport::Url;
use switchboard_types::{
    CallToolResult, EventKind, GetPromptResult, ObservabilityEvent, Prompt, ReadResourceResult,
    Resource, ResourceTemplate, Tool, ToolInfo,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ConnectOptions;
use crate::connection::ClientConnection;
use crate::error::{CallbackError, ClientError};
use crate::events::EventEmitter;
use crate::state::ConnectionState;
use crate::tool::McpTool;

const SERVER_ID_LEN: usize = 8;
const CONNECTED_CHANNEL_CAPACITY: usize = 64;

/// Generate an opaque server id.
pub fn generate_server_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SERVER_ID_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Outcome of [`ClientManager::connect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    pub id: String,
    /// Where to send the user when the server requires authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Outcome of [`ClientManager::handle_callback_request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCallbackResult {
    pub server_id: String,
    pub auth_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_error: Option<String>,
}

/// Where to send the browser after an OAuth callback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCallbackConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_redirect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_redirect: Option<String>,
}

/// A descriptor annotated with the server that owns it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespaced<T> {
    pub server_id: String,
    #[serde(flatten)]
    pub item: T,
}

/// Arguments of [`ClientManager::call_tool`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolRequest {
    pub server_id: String,
    /// Bare tool name, or `"{server_id}.{name}"`.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

struct ServerEntry {
    connection: Arc<ClientConnection>,
    forwarder: JoinHandle<()>,
}

/// Manages connections to many upstream MCP servers.
pub struct ClientManager {
    connections: RwLock<BTreeMap<String, ServerEntry>>,
    callback_urls: RwLock<Vec<String>>,
    callback_config: RwLock<Option<OAuthCallbackConfig>>,
    events: EventEmitter,
    connected_tx: broadcast::Sender<String>,
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientManager {
    pub fn new() -> Self {
        let (connected_tx, _) = broadcast::channel(CONNECTED_CHANNEL_CAPACITY);
        Self {
            connections: RwLock::new(BTreeMap::new()),
            callback_urls: RwLock::new(Vec::new()),
            callback_config: RwLock::new(None),
            events: EventEmitter::new(),
            connected_tx,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, ServerEntry>> {
        self.connections.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, ServerEntry>> {
        self.connections.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect to an upstream server, or resume one after an OAuth redirect.
    pub async fn connect(
        &self,
        url: &str,
        options: ConnectOptions,
    ) -> Result<ConnectResult, ClientError> {
        let parsed = Url::parse(url).map_err(|e| ClientError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let reconnect = options.reconnect.clone();
        let id = reconnect
            .as_ref()
            .map(|r| r.id.clone())
            .unwrap_or_else(generate_server_id);

        let existing = match &reconnect {
            Some(r) if r.oauth_code.is_some() => self.connection(&id),
            _ => None,
        };
        let reused = existing.is_some();
        let connection = match existing {
            Some(connection) => connection,
            None => {
                let connection = ClientConnection::new(parsed, options.clone());
                let forwarder = self.forward_events(&connection);
                let previous = self.write().insert(
                    id.clone(),
                    ServerEntry {
                        connection: Arc::clone(&connection),
                        forwarder,
                    },
                );
                if let Some(previous) = previous {
                    previous.forwarder.abort();
                    previous.connection.close().await;
                }
                connection
            }
        };

        if let Some(provider) = connection.auth_provider() {
            provider.set_server_id(id.clone());
            if let Some(client_id) = reconnect.as_ref().and_then(|r| r.oauth_client_id.clone()) {
                provider.set_client_id(client_id);
            }
        }

        if !reused || connection.state() != ConnectionState::Authenticating {
            if let Err(e) = connection.init().await {
                // The forwarder is left to drain the failure event; it exits
                // once the connection is dropped.
                let entry = self.write().remove(&id);
                if let Some(entry) = entry {
                    entry.connection.close().await;
                }
                return Err(e);
            }
        }

        if let Some(code) = reconnect.and_then(|r| r.oauth_code) {
            let outcome = async {
                connection.complete_authorization(&code).await?;
                connection.establish_connection().await
            }
            .await;
            if let Err(e) = outcome {
                self.events.emit(
                    EventKind::ClientConnect,
                    "Failed to complete OAuth reconnection",
                    json!({ "url": url, "error": e.to_string() }),
                );
                return Err(e);
            }
        }

        let mut result = ConnectResult {
            id: id.clone(),
            auth_url: None,
            client_id: None,
        };
        match connection.state() {
            ConnectionState::Authenticating => {
                if let Some(provider) = connection.auth_provider() {
                    if let Some(auth_url) = provider.authorization_url() {
                        self.register_callback_url(&provider.redirect_url());
                        result.auth_url = Some(auth_url);
                        result.client_id = provider.client_id();
                    }
                }
            }
            ConnectionState::Ready => {
                let _ = self.connected_tx.send(id);
            }
            _ => {}
        }
        Ok(result)
    }

    fn forward_events(&self, connection: &Arc<ClientConnection>) -> JoinHandle<()> {
        let mut rx = connection.subscribe();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => events.publish(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Dropped {n} observability events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn remove_entry(&self, id: &str) -> bool {
        let entry = self.write().remove(id);
        match entry {
            Some(entry) => {
                entry.forwarder.abort();
                entry.connection.close().await;
                true
            }
            None => false,
        }
    }

    pub fn connection(&self, server_id: &str) -> Option<Arc<ClientConnection>> {
        self.read()
            .get(server_id)
            .map(|entry| Arc::clone(&entry.connection))
    }

    /// Registered server ids, in order.
    pub fn server_ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn register_callback_url(&self, url: &str) {
        let mut urls = self.callback_urls.write().unwrap_or_else(|e| e.into_inner());
        if !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
        }
    }

    /// Forget every callback URL that ends in `server_id`.
    pub fn unregister_callback_url(&self, server_id: &str) {
        self.callback_urls
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|u| last_path_segment(u) != Some(server_id));
    }

    pub fn configure_oauth_callback(&self, config: OAuthCallbackConfig) {
        *self
            .callback_config
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(config);
    }

    pub fn oauth_callback_config(&self) -> Option<OAuthCallbackConfig> {
        self.callback_config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn matching_callback_url(&self, url: &str) -> Option<String> {
        self.callback_urls
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|cb| url.starts_with(cb.as_str()))
            .cloned()
    }

    /// Whether an incoming HTTP request is an OAuth redirect for one of our
    /// connections.
    pub fn is_callback_request(&self, method: &str, url: &str) -> bool {
        method.eq_ignore_ascii_case("GET") && self.matching_callback_url(url).is_some()
    }

    /// Complete the OAuth flow for the connection a callback belongs to.
    ///
    /// The connection is left in `connecting`; call
    /// [`establish_connection`](ClientManager::establish_connection) next.
    pub async fn handle_callback_request(
        &self,
        url: &str,
    ) -> Result<OAuthCallbackResult, ClientError> {
        let unmatched = || CallbackError::UnmatchedUrl {
            url: url.to_string(),
        };
        let matched = self.matching_callback_url(url).ok_or_else(unmatched)?;
        let parsed = Url::parse(url).map_err(|_| unmatched())?;

        let query: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
        let code = query.get("code").ok_or(CallbackError::MissingCode)?;
        let state = query.get("state").ok_or(CallbackError::MissingState)?;

        let server_id = last_path_segment(&matched)
            .ok_or_else(unmatched)?
            .to_string();
        let connection = self
            .connection(&server_id)
            .ok_or_else(|| CallbackError::UnknownServer {
                server_id: server_id.clone(),
            })?;
        if connection.state() != ConnectionState::Authenticating {
            return Err(CallbackError::NotAuthenticating { server_id }.into());
        }
        let provider = connection
            .auth_provider()
            .ok_or_else(|| CallbackError::NoAuthProvider {
                server_id: server_id.clone(),
            })?;

        provider.set_client_id(state.clone());
        provider.set_server_id(server_id.clone());

        match connection.complete_authorization(code).await {
            Ok(()) => Ok(OAuthCallbackResult {
                server_id,
                auth_success: true,
                auth_error: None,
            }),
            Err(e) => {
                tracing::warn!("OAuth callback for {server_id} failed: {e}");
                Ok(OAuthCallbackResult {
                    server_id,
                    auth_success: false,
                    auth_error: Some(e.to_string()),
                })
            }
        }
    }

    /// Connect an authorized server and run discovery.
    ///
    /// An unknown id only emits an `mcp:client:preconnect` event.
    pub async fn establish_connection(&self, server_id: &str) -> Result<(), ClientError> {
        let Some(connection) = self.connection(server_id) else {
            self.events.emit(
                EventKind::ClientPreconnect,
                format!("Connection {server_id} not found"),
                json!({ "serverId": server_id }),
            );
            return Ok(());
        };
        match connection.establish_connection().await {
            Ok(()) => {
                let _ = self.connected_tx.send(server_id.to_string());
                Ok(())
            }
            Err(e) => {
                self.events.emit(
                    EventKind::ClientConnect,
                    format!("Failed to connect to {}", connection.url()),
                    json!({
                        "serverId": server_id,
                        "url": connection.url().as_str(),
                        "error": e.to_string(),
                    }),
                );
                Err(e)
            }
        }
    }

    fn collect<T>(&self, items: impl Fn(&ClientConnection) -> Vec<T>) -> Vec<Namespaced<T>> {
        self.read()
            .iter()
            .flat_map(|(server_id, entry)| {
                items(entry.connection.as_ref())
                    .into_iter()
                    .map(move |item| Namespaced {
                        server_id: server_id.clone(),
                        item,
                    })
            })
            .collect()
    }

    pub fn list_tools(&self) -> Vec<Namespaced<ToolInfo>> {
        self.collect(ClientConnection::tools)
    }

    pub fn list_resources(&self) -> Vec<Namespaced<Resource>> {
        self.collect(ClientConnection::resources)
    }

    pub fn list_prompts(&self) -> Vec<Namespaced<Prompt>> {
        self.collect(ClientConnection::prompts)
    }

    pub fn list_resource_templates(&self) -> Vec<Namespaced<ResourceTemplate>> {
        self.collect(ClientConnection::resource_templates)
    }

    /// Every upstream tool as a local [`Tool`] named `tool_{server_id}_{name}`.
    pub fn ai_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.read()
            .iter()
            .flat_map(|(server_id, entry)| {
                entry.connection.tools().into_iter().map(move |info| {
                    Arc::new(McpTool::new(server_id, info, Arc::clone(&entry.connection)))
                        as Arc<dyn Tool>
                })
            })
            .collect()
    }

    fn require(&self, server_id: &str) -> Result<Arc<ClientConnection>, ClientError> {
        self.connection(server_id)
            .ok_or_else(|| ClientError::UnknownServer {
                id: server_id.to_string(),
            })
    }

    pub async fn call_tool(&self, request: CallToolRequest) -> Result<CallToolResult, ClientError> {
        let connection = self.require(&request.server_id)?;
        let name = strip_server_prefix(&request.server_id, &request.name);
        connection.call_tool(name, request.arguments).await
    }

    pub async fn read_resource(
        &self,
        server_id: &str,
        uri: &str,
    ) -> Result<ReadResourceResult, ClientError> {
        let connection = self.require(server_id)?;
        connection
            .read_resource(strip_server_prefix(server_id, uri))
            .await
    }

    pub async fn get_prompt(
        &self,
        server_id: &str,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResult, ClientError> {
        let connection = self.require(server_id)?;
        connection
            .get_prompt(strip_server_prefix(server_id, name), arguments)
            .await
    }

    /// Close one connection and drop it from the registry.
    pub async fn close_connection(&self, server_id: &str) -> Result<(), ClientError> {
        if self.remove_entry(server_id).await {
            tracing::info!("Closed MCP connection {server_id}");
            Ok(())
        } else {
            Err(ClientError::UnknownServer {
                id: server_id.to_string(),
            })
        }
    }

    pub async fn close_all_connections(&self) {
        let entries: Vec<ServerEntry> = {
            let mut connections = self.write();
            std::mem::take(&mut *connections).into_values().collect()
        };
        for entry in entries {
            entry.forwarder.abort();
            entry.connection.close().await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObservabilityEvent> {
        self.events.subscribe()
    }

    /// Server ids as their connections become ready.
    pub fn subscribe_connected(&self) -> broadcast::Receiver<String> {
        self.connected_tx.subscribe()
    }
}

fn strip_server_prefix<'a>(server_id: &str, name: &'a str) -> &'a str {
    name.strip_prefix(server_id)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(name)
}

fn last_path_segment(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
}
