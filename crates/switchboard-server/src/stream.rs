//! The body of an SSE response: frames queued for one attached stream.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use futures_core::Stream;
use switchboard_transport::SseFrame;
use tokio::sync::mpsc;

/// Identifies one HTTP stream attached to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Whatever owns the routing table a stream is registered in.
pub(crate) trait Detach: Send + Sync {
    fn detach(&self, connection: ConnectionId);
}

/// Frames for one attached stream. Dropping it (the client went away)
/// detaches the stream from its session; the session itself survives.
pub struct SessionStream {
    owner: Weak<dyn Detach>,
    connection: ConnectionId,
    backlog: VecDeque<SseFrame>,
    rx: mpsc::UnboundedReceiver<SseFrame>,
}

impl SessionStream {
    pub(crate) fn new(
        owner: Weak<dyn Detach>,
        connection: ConnectionId,
        backlog: Vec<SseFrame>,
        rx: mpsc::UnboundedReceiver<SseFrame>,
    ) -> Self {
        Self {
            owner,
            connection,
            backlog: backlog.into(),
            rx,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    /// Wait for the next frame; `None` once the stream is finished.
    pub async fn next_frame(&mut self) -> Option<SseFrame> {
        if let Some(frame) = self.backlog.pop_front() {
            return Some(frame);
        }
        self.rx.recv().await
    }
}

impl Stream for SessionStream {
    type Item = SseFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<SseFrame>> {
        if let Some(frame) = self.backlog.pop_front() {
            return Poll::Ready(Some(frame));
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.detach(self.connection);
        }
    }
}

impl fmt::Debug for SessionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStream")
            .field("connection", &self.connection)
            .field("backlog", &self.backlog.len())
            .finish()
    }
}
