//! Legacy HTTP+SSE client transport.
//!
//! A long-lived GET delivers an `endpoint` event naming the POST URL, then
//! every server-to-client message. Each client message is POSTed separately
//! and answered with 202; the reply arrives on the GET stream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Url;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde_json::Value;
use switchboard_types::JsonRpcMessage;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::sse::ENDPOINT_EVENT;
use crate::stream::EventStream;
use crate::transport::{
    BoxFuture, ClientTransport, Dispatcher, HttpBase, HttpTransportOptions, TransportKind,
    is_event_stream,
};

pub struct SseClientTransport {
    base: HttpBase,
    dispatcher: Arc<Dispatcher>,
    endpoint: Mutex<Option<Url>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseClientTransport {
    pub fn new(url: Url, options: HttpTransportOptions) -> Result<Self, TransportError> {
        let dispatcher = Arc::new(Dispatcher::new(options.request_timeout_ms));
        Ok(Self {
            base: HttpBase::new(url, options)?,
            dispatcher,
            endpoint: Mutex::new(None),
            reader: Mutex::new(None),
        })
    }

    /// The POST URL announced by the server.
    pub fn endpoint(&self) -> Option<Url> {
        self.endpoint
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn open(&self) -> Result<(), TransportError> {
        let headers = self.base.headers("text/event-stream")?;
        let response = self
            .base
            .http
            .get(self.base.url.clone())
            .headers(headers)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.base.reject(response).await);
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        if !is_event_stream(content_type) {
            return Err(TransportError::Protocol(format!(
                "SSE endpoint answered with content type {content_type:?}"
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let events = EventStream::from_response(response);
        let reader = tokio::spawn(read_stream(
            events,
            self.base.url.clone(),
            endpoint_tx,
            Arc::clone(&self.dispatcher),
        ));
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(reader);

        let timeout = Duration::from_millis(self.base.options.request_timeout_ms);
        let endpoint = match tokio::time::timeout(timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint?,
            Ok(Err(_)) => {
                return Err(TransportError::Protocol(
                    "SSE stream closed before the endpoint event".into(),
                ));
            }
            Err(_) => {
                return Err(TransportError::Timeout {
                    method: ENDPOINT_EVENT.to_string(),
                    timeout_ms: self.base.options.request_timeout_ms,
                });
            }
        };

        tracing::debug!("SSE endpoint for {} is {endpoint}", self.base.url);
        *self.endpoint.lock().unwrap_or_else(|e| e.into_inner()) = Some(endpoint);
        Ok(())
    }

    async fn post(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let endpoint = self
            .endpoint()
            .ok_or_else(|| TransportError::Protocol("SSE transport not started".into()))?;
        let mut headers = self.base.headers("application/json")?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let response = self
            .base
            .http
            .post(endpoint)
            .headers(headers)
            .body(serde_json::to_vec(message)?)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.base.reject(response).await);
        }
        Ok(())
    }
}

/// Resolve the announced endpoint against the stream URL; it must stay on
/// the same origin.
fn resolve_endpoint(base: &Url, announced: &str) -> Result<Url, TransportError> {
    let endpoint = base
        .join(announced.trim())
        .map_err(|e| TransportError::Protocol(format!("invalid endpoint '{announced}': {e}")))?;
    if endpoint.origin() != base.origin() {
        return Err(TransportError::Protocol(format!(
            "endpoint origin does not match connection origin: {endpoint}"
        )));
    }
    Ok(endpoint)
}

async fn read_stream(
    mut events: EventStream,
    base: Url,
    endpoint_tx: oneshot::Sender<Result<Url, TransportError>>,
    dispatcher: Arc<Dispatcher>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!("SSE stream from {base} failed: {e}");
                break;
            }
        };

        if event.event_type.as_deref() == Some(ENDPOINT_EVENT) {
            match endpoint_tx.take() {
                Some(tx) => {
                    let _ = tx.send(resolve_endpoint(&base, &event.data));
                }
                None => tracing::debug!("Ignoring repeated endpoint event from {base}"),
            }
            continue;
        }
        if !event.is_message() {
            continue;
        }
        match serde_json::from_str::<JsonRpcMessage>(&event.data) {
            Ok(msg) => dispatcher.dispatch(msg),
            Err(e) => tracing::warn!("Failed to parse MCP message: {e}: {}", event.data),
        }
    }
    dispatcher.fail_pending();
}

impl ClientTransport for SseClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn start(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.open())
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
        Box::pin(async move { self.post(&message).await })
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>> {
        self.dispatcher.take_incoming()
    }

    fn finish_auth<'a>(&'a self, code: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(self.base.finish_auth(code))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(reader) = reader {
                reader.abort();
            }
            self.dispatcher.fail_pending();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_resolves_relative_to_stream_url() {
        let base = Url::parse("http://localhost:8787/sse").unwrap();
        let endpoint = resolve_endpoint(&base, "/sse/message?sessionId=abc").unwrap();
        assert_eq!(
            endpoint.as_str(),
            "http://localhost:8787/sse/message?sessionId=abc"
        );
    }

    #[test]
    fn endpoint_on_other_origin_is_rejected() {
        let base = Url::parse("http://localhost:8787/sse").unwrap();
        let err = resolve_endpoint(&base, "http://evil.example/message").unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
