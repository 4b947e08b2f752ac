//! Legacy HTTP+SSE server transport.
//!
//! `GET /sse` opens the session's only stream and announces where to POST;
//! each POST carries exactly one message and every reply goes out on the GET
//! stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use serde_json::Value;
use switchboard_transport::{BoxFuture, SseFrame};
use switchboard_types::{
    CONNECTION_CLOSED, INVALID_REQUEST, JsonRpcMessage, PARSE_ERROR, RequestId,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::elicitation::ElicitationBroker;
use crate::error::{HttpRejection, ServerError};
use crate::handler::{MessageHandler, SessionSink, dispatch};
use crate::stream::{ConnectionId, Detach, SessionStream};

type Attached = Option<(ConnectionId, mpsc::UnboundedSender<SseFrame>)>;
type Registry = RwLock<HashMap<String, Arc<LegacySession>>>;

/// How long a session without a stream waits for its client to re-attach.
pub const DEFAULT_REATTACH_GRACE: Duration = Duration::from_secs(30);

/// A legacy session: an id plus at most one live stream.
pub struct LegacySession {
    id: String,
    next_connection: AtomicU64,
    stream: Mutex<Attached>,
    registry: Weak<Registry>,
    reattach_grace: Duration,
}

impl LegacySession {
    fn new(id: String, registry: &Arc<Registry>, reattach_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            id,
            next_connection: AtomicU64::new(0),
            stream: Mutex::new(None),
            registry: Arc::downgrade(registry),
            reattach_grace,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, Attached> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    /// Attach a new stream whose first frame is the `endpoint` event.
    fn attach(self: &Arc<Self>, endpoint: String) -> Option<SessionStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = {
            let mut attached = self.lock();
            if attached.is_some() {
                return None;
            }
            let connection = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed) + 1);
            *attached = Some((connection, tx));
            connection
        };
        let weak: Weak<LegacySession> = Arc::downgrade(self);
        Some(SessionStream::new(
            weak,
            connection,
            vec![SseFrame::endpoint(endpoint)],
            rx,
        ))
    }

    fn close(&self) {
        self.lock().take();
    }

    /// Forget the session unless a stream attaches within the grace period.
    fn schedule_eviction(&self) {
        let generation = self.next_connection.load(Ordering::Relaxed);
        let registry = self.registry.clone();
        if self.reattach_grace.is_zero() {
            evict_if_idle(&registry, &self.id, generation);
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(session = %self.id, "no runtime for eviction, session kept until close");
            return;
        };
        let id = self.id.clone();
        let grace = self.reattach_grace;
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            evict_if_idle(&registry, &id, generation);
        });
    }
}

/// Remove `id` if nothing attached since `generation` was observed.
fn evict_if_idle(registry: &Weak<Registry>, id: &str, generation: u64) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let mut sessions = registry.write().unwrap_or_else(|e| e.into_inner());
    let idle = sessions.get(id).is_some_and(|session| {
        !session.is_connected() && session.next_connection.load(Ordering::Relaxed) == generation
    });
    if idle {
        sessions.remove(id);
        info!(session = %id, "sse session evicted");
    }
}

impl Detach for LegacySession {
    fn detach(&self, connection: ConnectionId) {
        let idle = {
            let mut attached = self.lock();
            if attached.as_ref().is_some_and(|(c, _)| *c == connection) {
                *attached = None;
                debug!(session = %self.id, %connection, "sse stream detached");
            }
            attached.is_none()
        };
        if idle {
            self.schedule_eviction();
        }
    }
}

impl SessionSink for LegacySession {
    fn session_id(&self) -> &str {
        &self.id
    }

    /// There is only one stream, so `related_request_id` is not consulted.
    fn send(
        &self,
        message: JsonRpcMessage,
        _related_request_id: Option<RequestId>,
    ) -> BoxFuture<'_, Result<(), ServerError>> {
        Box::pin(async move {
            let frame = SseFrame::message(&message, None)?;
            let mut attached = self.lock();
            let delivered = match attached.as_ref() {
                Some((_, tx)) => tx.send(frame).is_ok(),
                None => return Err(ServerError::NotConnected),
            };
            if !delivered {
                *attached = None;
                return Err(ServerError::ConnectionClosed);
            }
            Ok(())
        })
    }
}

pub struct LegacySseTransport {
    handler: Arc<dyn MessageHandler>,
    elicitation: Arc<ElicitationBroker>,
    message_path: String,
    sessions: Arc<Registry>,
    reattach_grace: Duration,
}

impl LegacySseTransport {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        elicitation: Arc<ElicitationBroker>,
        message_path: impl Into<String>,
    ) -> Self {
        Self {
            handler,
            elicitation,
            message_path: message_path.into(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            reattach_grace: DEFAULT_REATTACH_GRACE,
        }
    }

    /// Zero evicts a session as soon as its stream goes away.
    pub fn with_reattach_grace(mut self, grace: Duration) -> Self {
        self.reattach_grace = grace;
        self
    }

    pub fn session(&self, id: &str) -> Option<Arc<LegacySession>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn endpoint(&self, session_id: &str) -> String {
        format!("{}?sessionId={session_id}", self.message_path)
    }

    /// Open (or, with `session_id`, re-attach) a session's stream.
    pub fn handle_get(
        &self,
        session_id: Option<&str>,
    ) -> Result<(String, SessionStream), HttpRejection> {
        let session = match session_id {
            Some(id) => self.session(id).ok_or_else(HttpRejection::session_not_found)?,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                let session = LegacySession::new(id.clone(), &self.sessions, self.reattach_grace);
                self.sessions
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id.clone(), Arc::clone(&session));
                info!(session = %id, "sse session created");
                session
            }
        };

        let stream = session
            .attach(self.endpoint(session.id()))
            .ok_or_else(|| HttpRejection::conflict("Conflict: SSE stream already connected"))?;
        Ok((session.id().to_string(), stream))
    }

    /// Accept one client message for `session_id`.
    pub async fn handle_post(
        &self,
        session_id: Option<&str>,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<(), HttpRejection> {
        let id = session_id.ok_or_else(|| {
            HttpRejection::bad_request(CONNECTION_CLOSED, "Bad Request: sessionId is required")
        })?;
        let session = self.session(id).ok_or_else(HttpRejection::session_not_found)?;

        let is_json = content_type.is_some_and(|ct| {
            ct.split(';').next().unwrap_or("").trim() == "application/json"
        });
        if !is_json {
            return Err(HttpRejection::bad_request(
                CONNECTION_CLOSED,
                "Unsupported content-type: expected application/json",
            ));
        }

        let value: Value = serde_json::from_slice(body)
            .map_err(|_| HttpRejection::bad_request(PARSE_ERROR, "Parse error"))?;
        if value.is_array() {
            return Err(HttpRejection::bad_request(
                INVALID_REQUEST,
                "Invalid Request: batches are not supported on the SSE transport",
            ));
        }
        let message = JsonRpcMessage::from_value(value)?;

        if message.is_terminal() && self.elicitation.try_resolve(id, &message).await {
            return Ok(());
        }
        let sink: Arc<dyn SessionSink> = session;
        dispatch(&self.handler, sink, &self.elicitation, vec![message]);
        Ok(())
    }

    /// Send `message` to every session with a live stream.
    pub async fn notify_all(&self, message: &JsonRpcMessage) {
        let sessions: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.is_connected())
            .cloned()
            .collect();
        for session in sessions {
            if let Err(e) = session.send(message.clone(), None).await {
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
}
