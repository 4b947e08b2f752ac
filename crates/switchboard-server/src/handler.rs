//! The seam between the session transports and application code.

use std::sync::Arc;

use serde_json::Value;
use switchboard_transport::BoxFuture;
use switchboard_types::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, RequestId, ToolContext,
};
use tracing::{debug, warn};

use crate::elicitation::{ElicitationBroker, SessionElicitor};
use crate::error::ServerError;

/// Outbound half of a session, as seen by handlers.
pub trait SessionSink: Send + Sync {
    fn session_id(&self) -> &str;

    /// Send a message to the client. Responses and errors route by their own
    /// id; other messages by `related_request_id`, or the session's standalone
    /// stream when there is none.
    fn send(
        &self,
        message: JsonRpcMessage,
        related_request_id: Option<RequestId>,
    ) -> BoxFuture<'_, Result<(), ServerError>>;
}

/// Application-level JSON-RPC handler.
pub trait MessageHandler: Send + Sync {
    /// Produce the response or error for `request`.
    fn handle_request(
        &self,
        request: JsonRpcRequest,
        ctx: RequestContext,
    ) -> BoxFuture<'_, JsonRpcMessage>;

    fn handle_notification(
        &self,
        notification: JsonRpcNotification,
        _ctx: RequestContext,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            debug!(method = %notification.method, "notification ignored");
        })
    }
}

/// What a handler knows about the message it is processing.
#[derive(Clone)]
pub struct RequestContext {
    sink: Arc<dyn SessionSink>,
    request_id: Option<RequestId>,
    elicitation: Option<Arc<ElicitationBroker>>,
}

impl RequestContext {
    pub fn new(sink: Arc<dyn SessionSink>, request_id: Option<RequestId>) -> Self {
        Self {
            sink,
            request_id,
            elicitation: None,
        }
    }

    pub fn with_elicitation(mut self, broker: Arc<ElicitationBroker>) -> Self {
        self.elicitation = Some(broker);
        self
    }

    pub fn session_id(&self) -> &str {
        self.sink.session_id()
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn sink(&self) -> &Arc<dyn SessionSink> {
        &self.sink
    }

    /// Send a notification tied to the current request.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ServerError> {
        self.sink
            .send(
                JsonRpcMessage::notification(method, params),
                self.request_id.clone(),
            )
            .await
    }

    /// A [`ToolContext`] whose elicitations travel back over this session.
    pub fn tool_context(&self) -> ToolContext {
        match &self.elicitation {
            Some(broker) => ToolContext::with_elicitor(Arc::new(SessionElicitor::new(
                Arc::clone(broker),
                Arc::clone(&self.sink),
                self.request_id.clone(),
            ))),
            None => ToolContext::default(),
        }
    }
}

/// Hand each message of a POST to the handler on its own task.
///
/// A request's reply is sent back through `sink`; responses from the client
/// that nobody is waiting for are logged and dropped.
pub(crate) fn dispatch(
    handler: &Arc<dyn MessageHandler>,
    sink: Arc<dyn SessionSink>,
    broker: &Arc<ElicitationBroker>,
    messages: Vec<JsonRpcMessage>,
) {
    for message in messages {
        match message {
            JsonRpcMessage::Request(request) => {
                let handler = Arc::clone(handler);
                let sink = Arc::clone(&sink);
                let ctx = RequestContext::new(Arc::clone(&sink), Some(request.id.clone()))
                    .with_elicitation(Arc::clone(broker));
                tokio::spawn(async move {
                    let id = request.id.clone();
                    let reply = handler.handle_request(request, ctx).await;
                    if let Err(e) = sink.send(reply, None).await {
                        warn!(%id, error = %e, "failed to deliver response");
                    }
                });
            }
            JsonRpcMessage::Notification(notification) => {
                let handler = Arc::clone(handler);
                let ctx = RequestContext::new(Arc::clone(&sink), None)
                    .with_elicitation(Arc::clone(broker));
                tokio::spawn(async move {
                    handler.handle_notification(notification, ctx).await;
                });
            }
            other => {
                debug!(id = ?other.response_id(), "dropping response with no pending request");
            }
        }
    }
}
