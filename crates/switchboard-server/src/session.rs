//! One Streamable HTTP session and the routing of outgoing messages onto the
//! HTTP streams attached to it.
//!
//! Each POST carrying requests opens a request stream that stays open until
//! every request id it carried has been answered. At most one GET stream (the
//! standalone stream) carries messages unrelated to any request. Roles and
//! in-flight ids live in a side table keyed by [`ConnectionId`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use switchboard_transport::{BoxFuture, SseFrame};
use switchboard_types::{JsonRpcMessage, RequestId};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ServerError;
use crate::event_store::EventStore;
use crate::handler::SessionSink;
use crate::stream::{ConnectionId, Detach, SessionStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    /// Opened by a POST; carries that POST's responses.
    Request,
    /// Opened by a GET; carries server-initiated traffic.
    Standalone,
}

struct StreamConnection {
    role: StreamRole,
    /// Event-store stream this connection writes to.
    stream_id: String,
    tx: mpsc::UnboundedSender<SseFrame>,
    pending: HashSet<RequestId>,
}

#[derive(Default)]
struct Routing {
    next_connection: u64,
    connections: HashMap<ConnectionId, StreamConnection>,
    request_routes: HashMap<RequestId, ConnectionId>,
    standalone: Option<ConnectionId>,
}

impl Routing {
    fn remove(&mut self, connection: ConnectionId) {
        if let Some(stream) = self.connections.remove(&connection) {
            for id in &stream.pending {
                self.request_routes.remove(id);
            }
        }
        if self.standalone == Some(connection) {
            self.standalone = None;
        }
    }
}

/// Why a stream could not be attached.
#[derive(Debug, Clone, PartialEq)]
pub enum AttachError {
    /// A request id of the POST is already waiting for an answer.
    DuplicateRequest(RequestId),
    /// The session already has a live standalone stream.
    StandaloneActive,
}

pub struct Session {
    id: String,
    event_store: Option<Arc<dyn EventStore>>,
    routing: Mutex<Routing>,
    /// Held from event storage through delivery, so stored order matches
    /// wire order.
    send_order: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(id: impl Into<String>, event_store: Option<Arc<dyn EventStore>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            event_store,
            routing: Mutex::new(Routing::default()),
            send_order: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, Routing> {
        self.routing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn standalone_stream_id(&self) -> String {
        format!("{}:standalone", self.id)
    }

    /// Whether event-store stream `stream_id` was written by this session.
    pub fn owns_stream(&self, stream_id: &str) -> bool {
        stream_id
            .strip_prefix(self.id.as_str())
            .is_some_and(|rest| rest.starts_with(':'))
    }

    /// Register a stream for a POST carrying `request_ids`.
    pub fn open_request_stream(
        self: &Arc<Self>,
        request_ids: Vec<RequestId>,
    ) -> Result<SessionStream, AttachError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = {
            let mut routing = self.lock();
            let mut seen = HashSet::new();
            for id in &request_ids {
                if routing.request_routes.contains_key(id) || !seen.insert(id.clone()) {
                    return Err(AttachError::DuplicateRequest(id.clone()));
                }
            }

            routing.next_connection += 1;
            let connection = ConnectionId(routing.next_connection);
            for id in &request_ids {
                routing.request_routes.insert(id.clone(), connection);
            }
            routing.connections.insert(
                connection,
                StreamConnection {
                    role: StreamRole::Request,
                    stream_id: format!("{}:{}", self.id, connection.0),
                    tx,
                    pending: request_ids.into_iter().collect(),
                },
            );
            connection
        };
        debug!(session = %self.id, %connection, "request stream attached");
        Ok(SessionStream::new(self.weak(), connection, Vec::new(), rx))
    }

    /// Register the standalone stream, to be preceded by `replay`.
    pub fn open_standalone_stream(
        self: &Arc<Self>,
        replay: Vec<SseFrame>,
    ) -> Result<SessionStream, AttachError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = {
            let mut routing = self.lock();
            if routing.standalone.is_some() {
                return Err(AttachError::StandaloneActive);
            }
            routing.next_connection += 1;
            let connection = ConnectionId(routing.next_connection);
            routing.connections.insert(
                connection,
                StreamConnection {
                    role: StreamRole::Standalone,
                    stream_id: self.standalone_stream_id(),
                    tx,
                    pending: HashSet::new(),
                },
            );
            routing.standalone = Some(connection);
            connection
        };
        debug!(session = %self.id, %connection, replayed = replay.len(), "standalone stream attached");
        Ok(SessionStream::new(self.weak(), connection, replay, rx))
    }

    fn weak(self: &Arc<Self>) -> Weak<dyn Detach> {
        let weak: Weak<Session> = Arc::downgrade(self);
        weak
    }

    pub fn has_standalone_stream(&self) -> bool {
        self.lock().standalone.is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn role_of(&self, connection: ConnectionId) -> Option<StreamRole> {
        self.lock().connections.get(&connection).map(|c| c.role)
    }

    /// Request ids still waiting for an answer.
    pub fn in_flight(&self) -> usize {
        self.lock().request_routes.len()
    }

    /// End every attached stream.
    pub fn close(&self) {
        let mut routing = self.lock();
        routing.connections.clear();
        routing.request_routes.clear();
        routing.standalone = None;
        debug!(session = %self.id, "session closed");
    }

    /// Route `message` onto the right stream.
    pub async fn route(
        &self,
        message: JsonRpcMessage,
        related_request_id: Option<RequestId>,
    ) -> Result<(), ServerError> {
        let route_id = message.response_id().cloned().or(related_request_id);
        let _order = self.send_order.lock().await;

        let target = {
            let routing = self.lock();
            match &route_id {
                Some(id) => {
                    let connection = *routing
                        .request_routes
                        .get(id)
                        .ok_or_else(|| ServerError::NoRoute { id: id.clone() })?;
                    let stream = routing
                        .connections
                        .get(&connection)
                        .ok_or(ServerError::ConnectionClosed)?;
                    Some((connection, stream.stream_id.clone()))
                }
                None => routing.standalone.and_then(|connection| {
                    routing
                        .connections
                        .get(&connection)
                        .map(|stream| (connection, stream.stream_id.clone()))
                }),
            }
        };

        let Some((connection, stream_id)) = target else {
            debug!(
                session = %self.id,
                method = ?message.method(),
                "no standalone stream, message dropped"
            );
            return Ok(());
        };

        let event_id = match &self.event_store {
            Some(store) => Some(store.store_event(&stream_id, &message).await?),
            None => None,
        };
        let frame = SseFrame::message(&message, event_id)?;
        let completes = if message.is_terminal() { route_id } else { None };
        self.deliver(connection, frame, completes)
    }

    fn deliver(
        &self,
        connection: ConnectionId,
        frame: SseFrame,
        completes: Option<RequestId>,
    ) -> Result<(), ServerError> {
        let mut routing = self.lock();
        let Some(stream) = routing.connections.get_mut(&connection) else {
            return Err(ServerError::ConnectionClosed);
        };

        if stream.tx.send(frame).is_err() {
            routing.remove(connection);
            debug!(session = %self.id, %connection, "stream receiver gone, detached");
            return Err(ServerError::ConnectionClosed);
        }

        let Some(id) = completes else {
            return Ok(());
        };
        stream.pending.remove(&id);
        let finished = stream.role == StreamRole::Request && stream.pending.is_empty();
        routing.request_routes.remove(&id);
        if finished {
            // Dropping the sender ends the HTTP response once drained.
            routing.remove(connection);
            debug!(session = %self.id, %connection, "all requests answered, stream closed");
        }
        Ok(())
    }
}

impl Detach for Session {
    fn detach(&self, connection: ConnectionId) {
        let mut routing = self.lock();
        if routing.connections.contains_key(&connection) {
            routing.remove(connection);
            debug!(session = %self.id, %connection, "stream detached");
        }
    }
}

impl SessionSink for Session {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn send(
        &self,
        message: JsonRpcMessage,
        related_request_id: Option<RequestId>,
    ) -> BoxFuture<'_, Result<(), ServerError>> {
        Box::pin(self.route(message, related_request_id))
    }
}
