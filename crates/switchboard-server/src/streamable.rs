//! Streamable HTTP server transport: session lifecycle and request
//! validation for the single MCP endpoint.
//!
//! Framework-independent; `http.rs` adapts it to axum.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use switchboard_transport::SseFrame;
use switchboard_types::{
    CONNECTION_CLOSED, INVALID_REQUEST, JsonRpcMessage, SUPPORTED_PROTOCOL_VERSIONS, method,
};
use tracing::{debug, info, warn};

use crate::elicitation::ElicitationBroker;
use crate::error::HttpRejection;
use crate::event_store::EventStore;
use crate::handler::{MessageHandler, SessionSink, dispatch};
use crate::session::{AttachError, Session};
use crate::stream::SessionStream;

/// The request headers the transport looks at.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    pub accept: Option<String>,
    pub content_type: Option<String>,
    pub session_id: Option<String>,
    pub last_event_id: Option<String>,
    pub protocol_version: Option<String>,
}

impl RequestHeaders {
    fn accepts(&self, media_type: &str) -> bool {
        self.accept.as_deref().is_some_and(|accept| {
            accept
                .split(',')
                .any(|part| part.split(';').next().unwrap_or("").trim() == media_type)
        })
    }

    fn is_json(&self) -> bool {
        self.content_type.as_deref().is_some_and(|ct| {
            ct.split(';').next().unwrap_or("").trim() == "application/json"
        })
    }
}

/// What a successful POST produces.
#[derive(Debug)]
pub enum PostOutcome {
    /// Nothing to stream back: 202 with no body.
    Accepted { session_id: String },
    /// 200 `text/event-stream` carrying the answers.
    Stream {
        session_id: String,
        stream: SessionStream,
    },
}

pub struct StreamableHttpTransport {
    handler: Arc<dyn MessageHandler>,
    elicitation: Arc<ElicitationBroker>,
    event_store: Option<Arc<dyn EventStore>>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl StreamableHttpTransport {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        elicitation: Arc<ElicitationBroker>,
        event_store: Option<Arc<dyn EventStore>>,
    ) -> Self {
        Self {
            handler,
            elicitation,
            event_store,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn existing_session(&self, headers: &RequestHeaders) -> Result<Arc<Session>, HttpRejection> {
        let id = headers
            .session_id
            .as_deref()
            .ok_or_else(HttpRejection::missing_session)?;
        let session = self.session(id).ok_or_else(HttpRejection::session_not_found)?;
        // Absent means the client predates the header; assume a supported version.
        if let Some(version) = headers.protocol_version.as_deref() {
            if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
                return Err(HttpRejection::bad_request(
                    CONNECTION_CLOSED,
                    format!("Bad Request: Unsupported protocol version: {version}"),
                ));
            }
        }
        Ok(session)
    }

    fn create_session(&self) -> Arc<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), self.event_store.clone());
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), Arc::clone(&session));
        info!(session = %id, "session created");
        session
    }

    pub async fn handle_post(
        &self,
        headers: &RequestHeaders,
        body: &[u8],
    ) -> Result<PostOutcome, HttpRejection> {
        if !headers.accepts("application/json") || !headers.accepts("text/event-stream") {
            return Err(HttpRejection::not_acceptable(
                "Not Acceptable: Client must accept both application/json and text/event-stream",
            ));
        }
        if !headers.is_json() {
            return Err(HttpRejection::new(
                415,
                CONNECTION_CLOSED,
                "Unsupported Media Type: Content-Type must be application/json",
            ));
        }

        let messages = JsonRpcMessage::parse_body(body)?;

        let initialize_count = messages
            .iter()
            .filter(|m| m.is_request() && m.method() == Some(method::INITIALIZE))
            .count();
        let session = if initialize_count > 0 {
            if initialize_count > 1 {
                return Err(HttpRejection::bad_request(
                    INVALID_REQUEST,
                    "Invalid Request: Only one initialization request is allowed",
                ));
            }
            if headers.session_id.is_some() {
                return Err(HttpRejection::bad_request(
                    INVALID_REQUEST,
                    "Invalid Request: Server already initialized",
                ));
            }
            self.create_session()
        } else {
            self.existing_session(headers)?
        };
        let session_id = session.id().to_string();

        let mut remaining = Vec::with_capacity(messages.len());
        for message in messages {
            if message.is_terminal() && self.elicitation.try_resolve(&session_id, &message).await {
                continue;
            }
            remaining.push(message);
        }

        let request_ids: Vec<_> = remaining
            .iter()
            .filter_map(|m| match m {
                JsonRpcMessage::Request(r) => Some(r.id.clone()),
                _ => None,
            })
            .collect();

        if request_ids.is_empty() {
            self.dispatch(&session, remaining);
            return Ok(PostOutcome::Accepted { session_id });
        }

        let stream = session.open_request_stream(request_ids).map_err(|e| match e {
            AttachError::DuplicateRequest(id) => HttpRejection::bad_request(
                INVALID_REQUEST,
                format!("Invalid Request: request id {id} is already in flight"),
            ),
            AttachError::StandaloneActive => {
                HttpRejection::conflict("Conflict: Only one SSE stream is allowed per session")
            }
        })?;
        self.dispatch(&session, remaining);
        Ok(PostOutcome::Stream { session_id, stream })
    }

    pub async fn handle_get(&self, headers: &RequestHeaders) -> Result<SessionStream, HttpRejection> {
        if !headers.accepts("text/event-stream") {
            return Err(HttpRejection::not_acceptable(
                "Not Acceptable: Client must accept text/event-stream",
            ));
        }
        let session = self.existing_session(headers)?;
        if session.has_standalone_stream() {
            return Err(HttpRejection::conflict(
                "Conflict: Only one SSE stream is allowed per session",
            ));
        }

        let replay = match (&self.event_store, headers.last_event_id.as_deref()) {
            (Some(store), Some(last_event_id)) => {
                self.replay(&session, store.as_ref(), last_event_id).await
            }
            _ => Vec::new(),
        };

        session.open_standalone_stream(replay).map_err(|_| {
            HttpRejection::conflict("Conflict: Only one SSE stream is allowed per session")
        })
    }

    async fn replay(
        &self,
        session: &Session,
        store: &dyn EventStore,
        last_event_id: &str,
    ) -> Vec<SseFrame> {
        let replay = match store.replay_events_after(last_event_id).await {
            Ok(Some(replay)) if session.owns_stream(&replay.stream_id) => replay,
            Ok(Some(replay)) => {
                warn!(
                    session = %session.id(),
                    stream = %replay.stream_id,
                    "Last-Event-ID belongs to another session, nothing to replay"
                );
                return Vec::new();
            }
            Ok(None) => {
                debug!(%last_event_id, "unknown Last-Event-ID, nothing to replay");
                return Vec::new();
            }
            Err(e) => {
                warn!(%last_event_id, error = %e, "event replay failed");
                return Vec::new();
            }
        };
        debug!(stream = %replay.stream_id, count = replay.events.len(), "replaying events");
        replay
            .events
            .into_iter()
            .filter_map(|(id, message)| SseFrame::message(&message, Some(id)).ok())
            .collect()
    }

    pub async fn handle_delete(&self, headers: &RequestHeaders) -> Result<(), HttpRejection> {
        let id = headers
            .session_id
            .as_deref()
            .ok_or_else(HttpRejection::missing_session)?;
        let session = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .ok_or_else(HttpRejection::session_not_found)?;
        session.close();
        info!(session = %id, "session terminated");
        Ok(())
    }

    /// Send `message` to every session's standalone stream.
    pub async fn notify_all(&self, message: &JsonRpcMessage) {
        let sessions: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for session in sessions {
            if let Err(e) = session.route(message.clone(), None).await {
                debug!(session = %session.id(), error = %e, "broadcast not delivered");
            }
        }
    }

    /// Drop every session, ending all their streams.
    pub fn close(&self) {
        let sessions: Vec<_> = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in sessions {
            session.close();
        }
    }

    fn dispatch(&self, session: &Arc<Session>, messages: Vec<JsonRpcMessage>) {
        let sink: Arc<dyn SessionSink> = Arc::clone(session) as Arc<dyn SessionSink>;
        dispatch(&self.handler, sink, &self.elicitation, messages);
    }
}
