//! Server-initiated elicitation: ask the connected client for structured input
//! and wait for its answer.
//!
//! A pending request is recorded in the key-value store under
//! `elicitation:<id>` and the caller waits on a oneshot channel. The client's
//! response arrives as an ordinary POST; the transports hand it to
//! [`ElicitationBroker::try_resolve`] before dispatching anything else.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use switchboard_types::{
    ElicitAction, ElicitResult, Elicitor, JsonRpcMessage, JsonRpcRequest, RequestId, ToolError,
    method,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ServerError;
use crate::handler::SessionSink;
use crate::storage::KeyValueStore;

pub const DEFAULT_ELICITATION_TIMEOUT: Duration = Duration::from_secs(60);

const REQUEST_ID_PREFIX: &str = "elicit_";
const STORE_KEY_PREFIX: &str = "elicitation:";
const REQUEST_ID_RANDOM_LEN: usize = 9;

/// What is stored while an elicitation waits for its answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingElicitation {
    /// Only an answer posted on this session resolves the elicitation.
    pub session_id: String,
    pub message: String,
    pub requested_schema: Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

fn store_key(id: &str) -> String {
    format!("{STORE_KEY_PREFIX}{id}")
}

fn new_request_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(REQUEST_ID_RANDOM_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{REQUEST_ID_PREFIX}{suffix}")
}

/// The elicitation id a response answers, if it answers one.
fn elicitation_id(message: &JsonRpcMessage) -> Option<&str> {
    match message.response_id()? {
        RequestId::String(id) if id.starts_with(REQUEST_ID_PREFIX) => Some(id.as_str()),
        _ => None,
    }
}

/// Tracks outstanding `elicitation/create` requests.
pub struct ElicitationBroker {
    store: Arc<dyn KeyValueStore>,
    waiters: Mutex<HashMap<String, oneshot::Sender<ElicitResult>>>,
    timeout: Duration,
}

impl ElicitationBroker {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            waiters: Mutex::new(HashMap::new()),
            timeout: DEFAULT_ELICITATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of elicitations still waiting in this process.
    pub fn pending(&self) -> usize {
        self.waiters.lock().map(|w| w.len()).unwrap_or(0)
    }

    fn take_waiter(&self, id: &str) -> Option<oneshot::Sender<ElicitResult>> {
        self.waiters.lock().ok().and_then(|mut w| w.remove(id))
    }

    /// Send an `elicitation/create` request through `sink` and wait for the
    /// client's answer. A timeout resolves to `cancel`.
    pub async fn elicit(
        &self,
        sink: &dyn SessionSink,
        message: String,
        requested_schema: Value,
        related_request_id: Option<RequestId>,
    ) -> Result<ElicitResult, ServerError> {
        let id = new_request_id();
        let key = store_key(&id);

        let pending = PendingElicitation {
            session_id: sink.session_id().to_string(),
            message: message.clone(),
            requested_schema: requested_schema.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.store.put(&key, serde_json::to_value(&pending)?).await?;

        let (tx, rx) = oneshot::channel();
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.insert(id.clone(), tx);
        }

        let request = JsonRpcRequest::new(
            id.clone(),
            method::ELICITATION_CREATE,
            Some(json!({
                "message": message,
                "requestedSchema": requested_schema,
            })),
        );
        if let Err(e) = sink.send(request.into(), related_request_id).await {
            self.take_waiter(&id);
            self.store.delete(&key).await?;
            return Err(e);
        }
        debug!(%id, session = %sink.session_id(), "elicitation sent");

        let outcome = tokio::time::timeout(self.timeout, rx).await;
        self.take_waiter(&id);
        if let Err(e) = self.store.delete(&key).await {
            warn!(%id, error = %e, "failed to remove pending elicitation");
        }

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Ok(ElicitResult::cancel()),
            Err(_) => {
                debug!(%id, "elicitation timed out");
                Ok(ElicitResult::cancel())
            }
        }
    }

    /// Consume `message`, posted on `session_id`, if it answers an
    /// elicitation.
    ///
    /// Returns `false` for anything that is not a response with an `elicit_`
    /// id. Answers to elicitations nobody is waiting for, or that were sent
    /// to another session, are consumed and ignored.
    pub async fn try_resolve(&self, session_id: &str, message: &JsonRpcMessage) -> bool {
        let Some(id) = elicitation_id(message) else {
            return false;
        };
        let key = store_key(id);

        match self.store.get(&key).await {
            Ok(Some(record)) => {
                let owner = serde_json::from_value::<PendingElicitation>(record)
                    .map(|p| p.session_id)
                    .unwrap_or_default();
                if owner != session_id {
                    debug!(%id, session = %session_id, "elicitation answer from another session ignored");
                    return true;
                }
            }
            Ok(None) => {
                debug!(%id, "response for unknown elicitation ignored");
                return true;
            }
            Err(e) => {
                warn!(%id, error = %e, "failed to look up pending elicitation");
                return true;
            }
        }

        let result = match message {
            JsonRpcMessage::Response(response) => {
                serde_json::from_value::<ElicitResult>(response.result.clone()).unwrap_or_else(
                    |e| ElicitResult {
                        action: ElicitAction::Cancel,
                        content: Some(json!({"error": format!("Invalid elicitation result: {e}")})),
                    },
                )
            }
            JsonRpcMessage::Error(error) => {
                let reason = if error.error.message.is_empty() {
                    "Elicitation request failed"
                } else {
                    error.error.message.as_str()
                };
                ElicitResult {
                    action: ElicitAction::Cancel,
                    content: Some(json!({"error": reason})),
                }
            }
            _ => return false,
        };

        if let Err(e) = self.store.delete(&key).await {
            warn!(%id, error = %e, "failed to remove pending elicitation");
        }
        match self.take_waiter(id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(%id, "elicitation answered after its waiter left"),
        }
        true
    }
}

/// [`Elicitor`] bound to one session and, optionally, the request being
/// served, so the `elicitation/create` travels on that request's stream.
pub struct SessionElicitor {
    broker: Arc<ElicitationBroker>,
    sink: Arc<dyn SessionSink>,
    related_request_id: Option<RequestId>,
}

impl SessionElicitor {
    pub fn new(
        broker: Arc<ElicitationBroker>,
        sink: Arc<dyn SessionSink>,
        related_request_id: Option<RequestId>,
    ) -> Self {
        Self {
            broker,
            sink,
            related_request_id,
        }
    }
}

impl Elicitor for SessionElicitor {
    fn elicit(
        &self,
        message: String,
        requested_schema: Value,
    ) -> Pin<Box<dyn Future<Output = Result<ElicitResult, ToolError>> + Send + '_>> {
        Box::pin(async move {
            self.broker
                .elicit(
                    self.sink.as_ref(),
                    message,
                    requested_schema,
                    self.related_request_id.clone(),
                )
                .await
                .map_err(|e| ToolError::Elicitation(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use switchboard_transport::BoxFuture;
    use switchboard_types::JsonRpcErrorResponse;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(JsonRpcMessage, Option<RequestId>)>>,
        fail: bool,
    }

    impl RecordingSink {
        fn last_request_id(&self) -> Option<String> {
            self.sent.lock().unwrap().iter().rev().find_map(|(m, _)| match m {
                JsonRpcMessage::Request(r) => Some(r.id.to_string()),
                _ => None,
            })
        }
    }

    impl SessionSink for RecordingSink {
        fn session_id(&self) -> &str {
            "test-session"
        }

        fn send(
            &self,
            message: JsonRpcMessage,
            related_request_id: Option<RequestId>,
        ) -> BoxFuture<'_, Result<(), ServerError>> {
            Box::pin(async move {
                if self.fail {
                    return Err(ServerError::NotConnected);
                }
                self.sent.lock().unwrap().push((message, related_request_id));
                Ok(())
            })
        }
    }

    fn broker(store: &Arc<MemoryStore>) -> Arc<ElicitationBroker> {
        Arc::new(ElicitationBroker::new(Arc::clone(store) as Arc<dyn KeyValueStore>))
    }

    async fn wait_for_request(sink: &RecordingSink) -> String {
        for _ in 0..100 {
            if let Some(id) = sink.last_request_id() {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("elicitation request was never sent");
    }

    #[test]
    fn request_ids_are_prefixed() {
        let id = new_request_id();
        assert!(id.starts_with("elicit_"));
        assert_eq!(id.len(), "elicit_".len() + REQUEST_ID_RANDOM_LEN);
    }

    #[tokio::test]
    async fn accepted_answer_resolves_waiter() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(&store);
        let sink = Arc::new(RecordingSink::default());

        let task = {
            let broker = Arc::clone(&broker);
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                broker
                    .elicit(
                        sink.as_ref(),
                        "Your name?".into(),
                        json!({"type": "object"}),
                        Some(RequestId::from(3)),
                    )
                    .await
            })
        };

        let id = wait_for_request(&sink).await;
        let stored = store.get(&store_key(&id)).await.unwrap().unwrap();
        assert_eq!(stored["message"], "Your name?");
        assert_eq!(stored["sessionId"], "test-session");
        assert!(stored["timestamp"].as_i64().unwrap() > 0);

        {
            let sent = sink.sent.lock().unwrap();
            let (JsonRpcMessage::Request(req), related) = &sent[0] else {
                panic!("expected a request");
            };
            assert_eq!(req.method, "elicitation/create");
            assert_eq!(req.params.as_ref().unwrap()["requestedSchema"]["type"], "object");
            assert_eq!(related, &Some(RequestId::from(3)));
        }

        let answer = JsonRpcMessage::response(
            RequestId::from(id.as_str()),
            json!({"action": "accept", "content": {"name": "Ada"}}),
        );
        assert!(broker.try_resolve("test-session", &answer).await);

        let result = task.await.unwrap().unwrap();
        assert_eq!(result, ElicitResult::accept(json!({"name": "Ada"})));
        assert!(store.is_empty());
        assert_eq!(broker.pending(), 0);
    }

    #[tokio::test]
    async fn error_answer_cancels_with_reason() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(&store);
        let sink = Arc::new(RecordingSink::default());

        let task = {
            let broker = Arc::clone(&broker);
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                broker
                    .elicit(sink.as_ref(), "?".into(), json!({}), None)
                    .await
            })
        };
        let id = wait_for_request(&sink).await;
        let answer = JsonRpcMessage::Error(JsonRpcErrorResponse::new(
            Some(RequestId::from(id.as_str())),
            switchboard_types::JsonRpcError::new(-32000, "user closed the dialog"),
        ));
        assert!(broker.try_resolve("test-session", &answer).await);

        let result = task.await.unwrap().unwrap();
        assert_eq!(result.action, ElicitAction::Cancel);
        assert_eq!(result.content, Some(json!({"error": "user closed the dialog"})));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn timeout_cancels_and_clears_record() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(
            ElicitationBroker::new(Arc::clone(&store) as Arc<dyn KeyValueStore>)
                .with_timeout(Duration::from_millis(20)),
        );
        let sink = RecordingSink::default();

        let result = broker
            .elicit(&sink, "?".into(), json!({}), None)
            .await
            .unwrap();
        assert_eq!(result, ElicitResult::cancel());
        assert!(store.is_empty());
        assert_eq!(broker.pending(), 0);

        // A late answer is swallowed.
        let id = sink.last_request_id().unwrap();
        let late = JsonRpcMessage::response(RequestId::from(id.as_str()), json!({"action": "accept"}));
        assert!(broker.try_resolve("test-session", &late).await);
    }

    #[tokio::test]
    async fn send_failure_removes_record() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(&store);
        let sink = RecordingSink {
            fail: true,
            ..RecordingSink::default()
        };

        let err = broker
            .elicit(&sink, "?".into(), json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotConnected));
        assert!(store.is_empty());
        assert_eq!(broker.pending(), 0);
    }

    #[tokio::test]
    async fn unrelated_messages_are_not_consumed() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(&store);

        let numeric = JsonRpcMessage::response(RequestId::from(1), json!({}));
        assert!(!broker.try_resolve("test-session", &numeric).await);

        let other = JsonRpcMessage::response(RequestId::from("req-1"), json!({}));
        assert!(!broker.try_resolve("test-session", &other).await);

        let note = JsonRpcMessage::notification("notifications/initialized", None);
        assert!(!broker.try_resolve("test-session", &note).await);

        let stray = JsonRpcMessage::response(RequestId::from("elicit_nothing"), json!({}));
        assert!(broker.try_resolve("test-session", &stray).await);
    }

    #[tokio::test]
    async fn answer_from_another_session_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(
            ElicitationBroker::new(Arc::clone(&store) as Arc<dyn KeyValueStore>)
                .with_timeout(Duration::from_secs(5)),
        );
        let sink = Arc::new(RecordingSink::default());

        let task = {
            let broker = Arc::clone(&broker);
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                broker
                    .elicit(sink.as_ref(), "Password?".into(), json!({}), None)
                    .await
            })
        };
        let id = wait_for_request(&sink).await;

        let forged = JsonRpcMessage::response(
            RequestId::from(id.as_str()),
            json!({"action": "accept", "content": {"password": "forged"}}),
        );
        assert!(broker.try_resolve("other-session", &forged).await);
        assert_eq!(broker.pending(), 1);
        assert!(!store.is_empty());

        let genuine = JsonRpcMessage::response(
            RequestId::from(id.as_str()),
            json!({"action": "decline"}),
        );
        assert!(broker.try_resolve("test-session", &genuine).await);

        let result = task.await.unwrap().unwrap();
        assert_eq!(result.action, ElicitAction::Decline);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn session_elicitor_maps_errors() {
        let store = Arc::new(MemoryStore::new());
        let sink: Arc<dyn SessionSink> = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let elicitor = SessionElicitor::new(broker(&store), sink, None);
        let err = elicitor.elicit("?".into(), json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Elicitation(_)));
    }
}
