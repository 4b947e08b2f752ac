//! axum surface for the server transports.
//!
//! Streamable HTTP on one path (POST/GET/DELETE), legacy SSE on a GET path
//! plus a POST path for messages.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::StreamExt;
use serde::Deserialize;
use switchboard_transport::{PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER};
use switchboard_types::JsonRpcMessage;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::elicitation::{DEFAULT_ELICITATION_TIMEOUT, ElicitationBroker};
use crate::error::HttpRejection;
use crate::event_store::EventStore;
use crate::handler::MessageHandler;
use crate::legacy::{DEFAULT_REATTACH_GRACE, LegacySseTransport};
use crate::storage::{KeyValueStore, MemoryStore};
use crate::stream::SessionStream;
use crate::streamable::{PostOutcome, RequestHeaders, StreamableHttpTransport};

/// Paths, stores and timeouts for [`McpServer`].
#[derive(Clone)]
pub struct ServerOptions {
    pub mcp_path: String,
    pub sse_path: String,
    pub message_path: String,
    /// Enables `Last-Event-ID` replay on the Streamable HTTP transport.
    pub event_store: Option<Arc<dyn EventStore>>,
    pub store: Arc<dyn KeyValueStore>,
    pub elicitation_timeout: Duration,
    /// How long a legacy SSE session outlives its stream.
    pub sse_reattach_grace: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            mcp_path: "/mcp".to_string(),
            sse_path: "/sse".to_string(),
            message_path: "/sse/message".to_string(),
            event_store: None,
            store: Arc::new(MemoryStore::new()),
            elicitation_timeout: DEFAULT_ELICITATION_TIMEOUT,
            sse_reattach_grace: DEFAULT_REATTACH_GRACE,
        }
    }
}

/// Both transports over one handler, plus the router serving them.
#[derive(Clone)]
pub struct McpServer {
    streamable: Arc<StreamableHttpTransport>,
    legacy: Arc<LegacySseTransport>,
    options: ServerOptions,
}

impl McpServer {
    pub fn new(handler: Arc<dyn MessageHandler>, options: ServerOptions) -> Self {
        let elicitation = Arc::new(
            ElicitationBroker::new(Arc::clone(&options.store))
                .with_timeout(options.elicitation_timeout),
        );
        let streamable = Arc::new(StreamableHttpTransport::new(
            Arc::clone(&handler),
            Arc::clone(&elicitation),
            options.event_store.clone(),
        ));
        let legacy = Arc::new(
            LegacySseTransport::new(handler, elicitation, options.message_path.clone())
                .with_reattach_grace(options.sse_reattach_grace),
        );
        Self {
            streamable,
            legacy,
            options,
        }
    }

    pub fn streamable(&self) -> &Arc<StreamableHttpTransport> {
        &self.streamable
    }

    pub fn legacy(&self) -> &Arc<LegacySseTransport> {
        &self.legacy
    }

    pub fn router(&self) -> Router {
        let opts = &self.options;
        Router::new()
            .route(
                &opts.mcp_path,
                post(streamable_post).get(streamable_get).delete(streamable_delete),
            )
            .route(&opts.sse_path, get(legacy_get))
            .route(&opts.message_path, post(legacy_post))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Bind `listener` and serve until the server stops.
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(
                addr = %addr,
                mcp = %self.options.mcp_path,
                sse = %self.options.sse_path,
                "starting MCP HTTP server"
            );
        }
        axum::serve(listener, self.router()).await
    }

    /// Broadcast a server notification to every session on both transports.
    pub async fn notify_all(&self, message: JsonRpcMessage) {
        self.streamable.notify_all(&message).await;
        self.legacy.notify_all(&message).await;
    }

    /// End every session on both transports.
    pub fn close(&self) {
        self.streamable.close();
        self.legacy.close();
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

fn request_headers(headers: &HeaderMap) -> RequestHeaders {
    let owned = |name: &str| header_str(headers, name).map(str::to_string);
    RequestHeaders {
        accept: owned("accept"),
        content_type: owned("content-type"),
        session_id: owned(SESSION_ID_HEADER),
        last_event_id: owned("last-event-id"),
        protocol_version: owned(PROTOCOL_VERSION_HEADER),
    }
}

impl IntoResponse for HttpRejection {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_REQUEST);
        let body = serde_json::to_string(&self.body()).unwrap_or_else(|_| "{}".to_string());
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

fn with_session_header(
    mut builder: axum::http::response::Builder,
    session_id: Option<&str>,
) -> axum::http::response::Builder {
    if let Some(v) = session_id.and_then(|sid| HeaderValue::from_str(sid).ok()) {
        builder = builder.header(SESSION_ID_HEADER, v);
    }
    builder
}

fn sse_response(stream: SessionStream, session_id: Option<&str>) -> Response {
    let body = Body::from_stream(stream.map(|frame| Ok::<_, Infallible>(frame.encode())));
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache");
    with_session_header(builder, session_id)
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn accepted(session_id: Option<&str>) -> Response {
    with_session_header(Response::builder().status(StatusCode::ACCEPTED), session_id)
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn streamable_post(State(st): State<McpServer>, headers: HeaderMap, body: Bytes) -> Response {
    match st
        .streamable
        .handle_post(&request_headers(&headers), &body)
        .await
    {
        Ok(PostOutcome::Accepted { session_id }) => accepted(Some(&session_id)),
        Ok(PostOutcome::Stream { session_id, stream }) => sse_response(stream, Some(&session_id)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn streamable_get(State(st): State<McpServer>, headers: HeaderMap) -> Response {
    let headers = request_headers(&headers);
    match st.streamable.handle_get(&headers).await {
        Ok(stream) => sse_response(stream, headers.session_id.as_deref()),
        Err(rejection) => rejection.into_response(),
    }
}

async fn streamable_delete(State(st): State<McpServer>, headers: HeaderMap) -> Response {
    match st.streamable.handle_delete(&request_headers(&headers)).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

async fn legacy_get(State(st): State<McpServer>, Query(q): Query<SessionQuery>) -> Response {
    match st.legacy.handle_get(q.session_id.as_deref()) {
        Ok((_, stream)) => sse_response(stream, None),
        Err(rejection) => rejection.into_response(),
    }
}

async fn legacy_post(
    State(st): State<McpServer>,
    Query(q): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match st
        .legacy
        .handle_post(
            q.session_id.as_deref(),
            header_str(&headers, "content-type"),
            &body,
        )
        .await
    {
        Ok(()) => accepted(None),
        Err(rejection) => rejection.into_response(),
    }
}
