//! Lifecycle of one upstream connection.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a [`ClientConnection`](crate::ClientConnection) is in its lifecycle.
///
/// ```text
/// connecting ──► authenticating ──► connecting ──► discovering ──► ready
///      └────────────────┴──────────────────┴─────────────┴───────────┴──► failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Discovering,
    Ready,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Discovering => "discovering",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Failed, _) => false,
            (_, Failed) => true,
            (Connecting, Authenticating | Discovering) => true,
            (Authenticating, Connecting) => true,
            (Discovering, Ready) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Failed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
