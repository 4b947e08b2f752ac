//! The gateway: upstream MCP connections re-served as one tool router.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use switchboard_client::{
    ClientManager, ConnectOptions, ConnectResult, OAuthCallbackConfig, Reconnect,
    UpstreamServerConfig,
};
use switchboard_config::{GatewayConfig, OAUTH_CALLBACK_PATH};
use switchboard_server::{EventStore, InMemoryEventStore, McpServer, ServerOptions, ToolRouter};
use switchboard_transport::{OAuthProvider, PkceOAuthProvider, Url};
use switchboard_types::{Implementation, JsonRpcMessage, method};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Gateway {
    config: GatewayConfig,
    manager: Arc<ClientManager>,
    router: Arc<ToolRouter>,
    server: McpServer,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let manager = Arc::new(ClientManager::new());
        manager.configure_oauth_callback(OAuthCallbackConfig {
            success_redirect: config.oauth.success_redirect.clone(),
            error_redirect: config.oauth.error_redirect.clone(),
        });

        let router = Arc::new(
            ToolRouter::new(Implementation::new(
                config.server_name.clone(),
                env!("CARGO_PKG_VERSION"),
            ))
            .with_instructions(
                "Tools are named tool_<server>_<name> after the upstream server that provides them.",
            ),
        );
        let event_store = config
            .event_replay
            .then(|| Arc::new(InMemoryEventStore::new()) as Arc<dyn EventStore>);
        let server = McpServer::new(
            router.clone(),
            ServerOptions {
                event_store,
                elicitation_timeout: config.elicitation_timeout,
                ..ServerOptions::default()
            },
        );

        Arc::new(Self {
            config,
            manager,
            router,
            server,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<ToolRouter> {
        &self.router
    }

    /// Connect every configured upstream under its configured name.
    ///
    /// Failures are logged and skipped. Returns how many servers are ready.
    pub async fn connect_upstreams(&self) -> usize {
        let mut ready = 0;
        for (name, upstream) in &self.config.servers {
            let provider: Arc<dyn OAuthProvider> = Arc::new(PkceOAuthProvider::new(
                self.config.callback_base(),
                self.config.server_name.clone(),
            ));
            if self.connect_upstream(name, upstream, provider).await {
                ready += 1;
            }
        }
        self.refresh_tools().await;
        ready
    }

    /// Connect one upstream as `name`; true once it is ready.
    async fn connect_upstream(
        &self,
        name: &str,
        upstream: &UpstreamServerConfig,
        provider: Arc<dyn OAuthProvider>,
    ) -> bool {
        let options = ConnectOptions {
            auth_provider: Some(provider),
            reconnect: Some(Reconnect {
                id: name.to_string(),
                ..Reconnect::default()
            }),
            ..upstream.connect_options()
        };
        match self.manager.connect(&upstream.url, options).await {
            Ok(ConnectResult {
                auth_url: Some(auth_url),
                ..
            }) => {
                warn!(server = %name, "upstream requires authorization");
                eprintln!("{name} requires authorization. Open this URL to continue:\n  {auth_url}");
                false
            }
            Ok(_) => {
                info!(server = %name, url = %upstream.url, "upstream connected");
                true
            }
            Err(e) => {
                warn!(server = %name, url = %upstream.url, "failed to connect upstream: {e}");
                false
            }
        }
    }

    /// Replace the served tool set with every upstream's current tools and
    /// tell connected clients when it changed.
    pub async fn refresh_tools(&self) {
        if !self.router.set_tools(self.manager.ai_tools()) {
            return;
        }
        debug!(tools = ?self.router.tool_names(), "tool set changed");
        self.server
            .notify_all(JsonRpcMessage::notification(method::TOOLS_LIST_CHANGED, None))
            .await;
    }

    /// Refresh tools as connections become ready and log client lifecycle
    /// events. The tasks run until aborted.
    pub fn spawn_watchers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut connected = self.manager.subscribe_connected();
        let gateway = Arc::clone(self);
        let refresh = tokio::spawn(async move {
            loop {
                match connected.recv().await {
                    Ok(server_id) => {
                        debug!(server = %server_id, "upstream ready");
                        gateway.refresh_tools().await;
                    }
                    Err(RecvError::Lagged(_)) => gateway.refresh_tools().await,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let mut events = self.manager.subscribe();
        let log = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => debug!(
                        kind = event.kind.as_str(),
                        payload = %event.payload,
                        "{}",
                        event.display_message
                    ),
                    Err(RecvError::Lagged(n)) => warn!("Dropped {n} client events"),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        vec![refresh, log]
    }

    /// MCP routes plus the OAuth callback route.
    pub fn app(self: &Arc<Self>) -> Router {
        Router::new()
            .route(
                &format!("{OAUTH_CALLBACK_PATH}/{{server_id}}"),
                get(oauth_callback),
            )
            .with_state(Arc::clone(self))
            .merge(self.server.router())
    }

    /// Exchange the callback's code, then connect and discover in the
    /// background so the browser is not held on upstream latency.
    async fn complete_oauth(self: &Arc<Self>, url: &str) -> Result<String, String> {
        let result = self
            .manager
            .handle_callback_request(url)
            .await
            .map_err(|e| e.to_string())?;
        if !result.auth_success {
            return Err(result
                .auth_error
                .unwrap_or_else(|| "Authorization failed".to_string()));
        }

        let gateway = Arc::clone(self);
        let server_id = result.server_id.clone();
        tokio::spawn(async move {
            match gateway.manager.establish_connection(&server_id).await {
                Ok(()) => gateway.refresh_tools().await,
                Err(e) => warn!(server = %server_id, "failed to connect after authorization: {e}"),
            }
        });
        Ok(result.server_id)
    }

    fn callback_response(&self, outcome: Result<String, String>) -> Response {
        let redirects = self.manager.oauth_callback_config().unwrap_or_default();
        match outcome {
            Ok(server_id) => {
                info!(server = %server_id, "upstream authorized");
                match redirects.success_redirect {
                    Some(target) => redirect_with(&target, "serverId", &server_id),
                    None => (
                        StatusCode::OK,
                        format!("Authorization complete for {server_id}. You can close this window."),
                    )
                        .into_response(),
                }
            }
            Err(error) => {
                warn!("OAuth callback failed: {error}");
                match redirects.error_redirect {
                    Some(target) => redirect_with(&target, "error", &error),
                    None => (StatusCode::BAD_REQUEST, format!("Authorization failed: {error}"))
                        .into_response(),
                }
            }
        }
    }

    /// Stop serving sessions and close every upstream connection.
    pub async fn shutdown(&self) {
        self.server.close();
        self.manager.close_all_connections().await;
    }
}

async fn oauth_callback(State(gateway): State<Arc<Gateway>>, uri: Uri) -> Response {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let url = format!("{}{path}", gateway.config.public_url);
    let outcome = gateway.complete_oauth(&url).await;
    gateway.callback_response(outcome)
}

fn redirect_with(target: &str, key: &str, value: &str) -> Response {
    match Url::parse(target) {
        Ok(mut u) => {
            u.query_pairs_mut().append_pair(key, value);
            Redirect::temporary(u.as_str()).into_response()
        }
        Err(_) => Redirect::temporary(target).into_response(),
    }
}
