//! Streamable HTTP client transport.
//!
//! Every message is POSTed to a single endpoint. The server answers a request
//! either with a JSON body or with an SSE stream scoped to that POST; once the
//! session is initialized a GET on the same endpoint opens the standalone push
//! stream for server-initiated traffic.

use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use reqwest::Url;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde_json::Value;
use switchboard_types::{JsonRpcMessage, method};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::stream::EventStream;
use crate::transport::{
    BoxFuture, ClientTransport, Dispatcher, HttpBase, HttpTransportOptions, JSON_AND_SSE_ACCEPT,
    PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER, TransportKind, is_event_stream,
};

pub struct StreamableHttpClientTransport {
    base: HttpBase,
    dispatcher: Arc<Dispatcher>,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamableHttpClientTransport {
    pub fn new(url: Url, options: HttpTransportOptions) -> Result<Self, TransportError> {
        let dispatcher = Arc::new(Dispatcher::new(options.request_timeout_ms));
        Ok(Self {
            base: HttpBase::new(url, options)?,
            dispatcher,
            session_id: Mutex::new(None),
            protocol_version: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The session id assigned by the server, once known.
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn session_headers(
        &self,
        accept: &'static str,
    ) -> Result<reqwest::header::HeaderMap, TransportError> {
        let mut headers = self.base.headers(accept)?;
        if let Some(sid) = self.session_id() {
            if let Ok(value) = HeaderValue::from_str(&sid) {
                headers.insert(SESSION_ID_HEADER, value);
            }
        }
        let version = self
            .protocol_version
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(version) = version {
            if let Ok(value) = HeaderValue::from_str(&version) {
                headers.insert(PROTOCOL_VERSION_HEADER, value);
            }
        }
        Ok(headers)
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// POST one message and feed whatever comes back into the dispatcher.
    async fn post(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let mut headers = self.session_headers(JSON_AND_SSE_ACCEPT)?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let body = serde_json::to_vec(message)?;

        tracing::debug!("POST {} ({:?})", self.base.url, message.method());
        let response = self
            .base
            .http
            .post(self.base.url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.base.reject(response).await);
        }

        if let Some(sid) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(sid.to_string());
        }

        if response.status() == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if is_event_stream(content_type.as_deref()) {
            let dispatcher = Arc::clone(&self.dispatcher);
            let events = EventStream::from_response(response);
            self.track(tokio::spawn(pump_events(events, dispatcher)));
            return Ok(());
        }

        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        let messages = JsonRpcMessage::parse_body(&bytes)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        for msg in messages {
            self.dispatcher.dispatch(msg);
        }
        Ok(())
    }

    /// Open the GET push stream. Servers without one answer 405.
    async fn open_push_stream(&self) -> Result<(), TransportError> {
        let headers = self.session_headers("text/event-stream")?;
        let response = self
            .base
            .http
            .get(self.base.url.clone())
            .headers(headers)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            tracing::debug!("{} offers no standalone stream", self.base.url);
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(self.base.reject(response).await);
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let events = EventStream::from_response(response);
        self.track(tokio::spawn(pump_events(events, dispatcher)));
        Ok(())
    }
}

async fn pump_events(mut events: EventStream, dispatcher: Arc<Dispatcher>) {
    while let Some(event) = events.next().await {
        match event {
            Ok(event) if event.is_message() => {
                match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                    Ok(msg) => dispatcher.dispatch(msg),
                    Err(e) => tracing::warn!("Failed to parse MCP message: {e}: {}", event.data),
                }
            }
            Ok(event) => tracing::debug!("Ignoring SSE event {:?}", event.event_type),
            Err(e) => {
                tracing::debug!("SSE stream ended with error: {e}");
                break;
            }
        }
    }
}

impl ClientTransport for StreamableHttpClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    fn start(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        // Nothing to open until the server hands out a session id.
        Box::pin(async { Ok(()) })
    }

    fn request<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> BoxFuture<'a, Result<Value, TransportError>> {
        Box::pin(async move {
            let (request, rx) = self.dispatcher.begin(method, params);
            let message = JsonRpcMessage::Request(request.clone());
            if let Err(e) = self.post(&message).await {
                self.dispatcher.forget(&request.id);
                return Err(e);
            }
            self.dispatcher.wait(&request, rx).await
        })
    }

    fn send(&self, message: JsonRpcMessage) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.post(&message).await?;
            if message.method() == Some(method::INITIALIZED) {
                if let Err(e) = self.open_push_stream().await {
                    tracing::warn!("Could not open standalone stream on {}: {e}", self.base.url);
                }
            }
            Ok(())
        })
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>> {
        self.dispatcher.take_incoming()
    }

    fn set_protocol_version(&self, version: &str) {
        *self
            .protocol_version
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(version.to_string());
    }

    fn finish_auth<'a>(&'a self, code: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(self.base.finish_auth(code))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let tasks: Vec<_> = self
                .tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain(..)
                .collect();
            for task in tasks {
                task.abort();
            }
            self.dispatcher.fail_pending();

            if self.session_id().is_some() {
                let headers = match self.session_headers("application/json") {
                    Ok(h) => h,
                    Err(_) => return,
                };
                let result = self
                    .base
                    .http
                    .delete(self.base.url.clone())
                    .headers(headers)
                    .send()
                    .await;
                if let Err(e) = result {
                    tracing::debug!("Session DELETE to {} failed: {e}", self.base.url);
                }
            }
        })
    }
}
