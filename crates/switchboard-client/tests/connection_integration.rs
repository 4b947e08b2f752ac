//! Connection state machine tests against scripted transports.

mod common;

use std::sync::Arc;

use serde_json::json;
use switchboard_client::{
    ClientConnection, ClientError, ConnectOptions, ConnectionState, ElicitationHandler,
    TransportMode,
};
use switchboard_transport::{BoxFuture, OAuthProvider, TransportKind};
use switchboard_types::{
    ElicitRequestParams, ElicitResult, EventKind, JsonRpcMessage, JsonRpcRequest, RequestId,
    method,
};

use common::{Behavior, MockFactory, MockProvider, MockServer, eventually, options, tool_server, url};

// ---------------------------------------------------------------------------
// Transport selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn auto_falls_back_to_sse_when_streamable_http_is_not_implemented() {
    for status in [404, 405, 501] {
        let factory = MockFactory::new()
            .plan(TransportKind::StreamableHttp, vec![Behavior::Status(status)])
            .plan(TransportKind::Sse, vec![Behavior::Serve(tool_server())]);
        let conn = ClientConnection::new(url(), options(TransportMode::Auto, &factory));
        let mut events = conn.subscribe();

        conn.init().await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Ready, "status {status}");
        assert_eq!(conn.connected_transport(), Some(TransportKind::Sse));
        assert_eq!(
            factory.created_kinds(),
            vec![TransportKind::StreamableHttp, TransportKind::Sse]
        );
        assert!(factory.created.lock().unwrap()[0].is_closed());

        let fallback = events.recv().await.unwrap();
        assert_eq!(fallback.kind, EventKind::ClientConnect);
        assert!(fallback.display_message.contains("falling back"));
        let connected = events.recv().await.unwrap();
        assert!(connected.display_message.contains("sse"));
    }
}

#[tokio::test]
async fn auto_tries_at_most_two_transports() {
    let factory = MockFactory::new()
        .plan(TransportKind::StreamableHttp, vec![Behavior::Status(404)])
        .plan(TransportKind::Sse, vec![Behavior::Status(404)]);
    let conn = ClientConnection::new(url(), options(TransportMode::Auto, &factory));

    let err = conn.init().await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(_)));
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert_eq!(factory.created_kinds().len(), 2);
}

#[tokio::test]
async fn unauthorized_never_falls_back() {
    for mode in [
        TransportMode::Auto,
        TransportMode::StreamableHttp,
        TransportMode::Sse,
    ] {
        let factory = MockFactory::new()
            .plan(TransportKind::StreamableHttp, vec![Behavior::Status(401)])
            .plan(TransportKind::Sse, vec![Behavior::Status(401)]);
        let conn = ClientConnection::new(url(), options(mode, &factory));

        conn.init().await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Authenticating, "{mode}");
        assert_eq!(factory.created_kinds(), vec![mode.first_kind()]);
        // The transport that saw the 401 is kept for the code exchange.
        assert!(!factory.last().is_closed());
    }
}

#[tokio::test]
async fn explicit_mode_never_falls_back() {
    let factory = MockFactory::new()
        .plan(TransportKind::StreamableHttp, vec![Behavior::Status(404)])
        .plan(TransportKind::Sse, vec![Behavior::Serve(tool_server())]);
    let conn = ClientConnection::new(url(), options(TransportMode::StreamableHttp, &factory));
    let mut events = conn.subscribe();

    let err = conn.init().await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(ref e) if e.is_not_implemented()));
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert_eq!(factory.created_kinds(), vec![TransportKind::StreamableHttp]);

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, EventKind::ClientConnect);
    assert!(event.display_message.starts_with("Failed to connect"));
}

#[tokio::test]
async fn other_errors_are_fatal_in_auto_mode() {
    let factory = MockFactory::new()
        .plan(TransportKind::StreamableHttp, vec![Behavior::Status(500)])
        .plan(TransportKind::Sse, vec![Behavior::Serve(tool_server())]);
    let conn = ClientConnection::new(url(), options(TransportMode::Auto, &factory));

    assert!(conn.init().await.is_err());
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert_eq!(factory.created_kinds(), vec![TransportKind::StreamableHttp]);
}

#[tokio::test]
async fn handshake_sends_initialized_notification() {
    let server = tool_server();
    let factory = MockFactory::new().plan(
        TransportKind::StreamableHttp,
        vec![Behavior::Serve(Arc::clone(&server))],
    );
    let conn = ClientConnection::new(url(), options(TransportMode::Auto, &factory));
    conn.init().await.unwrap();

    let init = server.requested(method::INITIALIZE);
    assert_eq!(init.len(), 1);
    let params = init[0].as_ref().unwrap();
    assert_eq!(params["protocolVersion"], "2025-06-18");
    assert_eq!(params["clientInfo"]["name"], "switchboard");
    assert!(params["capabilities"].get("elicitation").is_none());

    let sent = factory.last().sent();
    assert_eq!(sent[0].method(), Some(method::INITIALIZED));
    assert_eq!(conn.server_info().unwrap().name, "mock");
    assert_eq!(conn.connected_transport(), Some(TransportKind::StreamableHttp));
}

// ---------------------------------------------------------------------------
// OAuth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn oauth_flow_reaches_ready() {
    let provider = Arc::new(MockProvider::default());
    let factory = MockFactory::new().plan(
        TransportKind::StreamableHttp,
        vec![Behavior::Status(401), Behavior::Serve(tool_server())],
    );
    let conn = ClientConnection::new(
        url(),
        ConnectOptions {
            auth_provider: Some(Arc::clone(&provider) as Arc<dyn OAuthProvider>),
            ..options(TransportMode::StreamableHttp, &factory)
        },
    );

    conn.init().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Authenticating);
    assert!(provider.authorization_url().is_some());

    conn.complete_authorization("good").await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connecting);
    assert_eq!(provider.access_token().as_deref(), Some("token-1"));

    conn.establish_connection().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert_eq!(conn.tools().len(), 1);
}

#[tokio::test]
async fn failed_code_exchange_fails_connection() {
    let provider = Arc::new(MockProvider::default());
    let factory =
        MockFactory::new().plan(TransportKind::StreamableHttp, vec![Behavior::Status(401)]);
    let conn = ClientConnection::new(
        url(),
        ConnectOptions {
            auth_provider: Some(provider as Arc<dyn OAuthProvider>),
            ..options(TransportMode::Auto, &factory)
        },
    );

    conn.init().await.unwrap();
    assert!(conn.complete_authorization("bad").await.is_err());
    assert_eq!(conn.state(), ConnectionState::Failed);

    // Failed is terminal.
    assert!(matches!(
        conn.establish_connection().await,
        Err(ClientError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn establish_requires_connecting() {
    let factory =
        MockFactory::new().plan(TransportKind::StreamableHttp, vec![Behavior::Status(401)]);
    let conn = ClientConnection::new(url(), options(TransportMode::Auto, &factory));
    conn.init().await.unwrap();

    match conn.establish_connection().await {
        Err(ClientError::InvalidState { expected, actual }) => {
            assert_eq!(expected, ConnectionState::Connecting);
            assert_eq!(actual, ConnectionState::Authenticating);
        }
        other => panic!("Expected InvalidState, got: {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn discovery_settles_all_and_still_reaches_ready() {
    let server = MockServer::with_instructions(
        json!({"tools": {}, "resources": {}, "prompts": {}}),
        "Use the weather tools.",
    );
    server.fail("tools/list", -32603);
    server.fail("prompts/list", -32601);
    server.respond(
        "resources/list",
        json!({"resources": [{"uri": "file:///a.txt", "name": "a"}]}),
    );
    server.respond(
        "resources/templates/list",
        json!({"resourceTemplates": [{"uriTemplate": "file:///{path}", "name": "files"}]}),
    );
    let factory = MockFactory::new().plan(
        TransportKind::StreamableHttp,
        vec![Behavior::Serve(Arc::clone(&server))],
    );
    let conn = ClientConnection::new(url(), options(TransportMode::Auto, &factory));
    let mut events = conn.subscribe();

    conn.init().await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Ready);
    assert!(conn.tools().is_empty());
    assert!(conn.prompts().is_empty());
    assert_eq!(conn.resources().len(), 1);
    assert_eq!(conn.resource_templates()[0].uri_template, "file:///{path}");
    assert_eq!(conn.instructions().as_deref(), Some("Use the weather tools."));

    let mut discover_messages = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.kind == EventKind::ClientDiscover {
            discover_messages.push(event.display_message);
        }
    }
    assert_eq!(discover_messages.len(), 2, "{discover_messages:?}");
    assert!(
        discover_messages
            .iter()
            .any(|m| m.starts_with("Failed to discover tools for"))
    );
    assert!(
        discover_messages
            .iter()
            .any(|m| m.contains("does not implement prompts/list"))
    );
}

#[tokio::test]
async fn discovery_follows_cursors() {
    let server = MockServer::new(json!({"tools": {}}));
    server.respond(
        "tools/list",
        json!({"tools": [{"name": "a"}], "nextCursor": "p2"}),
    );
    server.respond(
        "tools/list?p2",
        json!({"tools": [{"name": "b"}], "nextCursor": "p3"}),
    );
    server.respond("tools/list?p3", json!({"tools": [{"name": "c"}]}));
    let factory = MockFactory::new().plan(
        TransportKind::StreamableHttp,
        vec![Behavior::Serve(Arc::clone(&server))],
    );
    let conn = ClientConnection::new(url(), options(TransportMode::Auto, &factory));

    conn.init().await.unwrap();

    let names: Vec<_> = conn.tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert_eq!(server.requested("tools/list").len(), 3);
}

#[tokio::test]
async fn method_not_found_keeps_gathered_pages() {
    let server = MockServer::new(json!({"tools": {}}));
    server.respond(
        "tools/list",
        json!({"tools": [{"name": "a"}], "nextCursor": "missing"}),
    );
    let factory = MockFactory::new().plan(
        TransportKind::StreamableHttp,
        vec![Behavior::Serve(Arc::clone(&server))],
    );
    let conn = ClientConnection::new(url(), options(TransportMode::Auto, &factory));

    conn.init().await.unwrap();
    assert_eq!(conn.tools().len(), 1);
    assert_eq!(conn.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn unadvertised_capabilities_are_not_fetched() {
    let server = MockServer::new(json!({}));
    let factory = MockFactory::new().plan(
        TransportKind::StreamableHttp,
        vec![Behavior::Serve(Arc::clone(&server))],
    );
    let conn = ClientConnection::new(url(), options(TransportMode::Auto, &factory));
    let mut events = conn.subscribe();

    conn.init().await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Ready);
    let methods: Vec<_> = server
        .requests
        .lock()
        .unwrap()
        .iter()
        .map(|(m, _)| m.clone())
        .collect();
    assert_eq!(methods, vec!["initialize"]);
    while let Ok(event) = events.try_recv() {
        assert_ne!(event.kind, EventKind::ClientDiscover);
    }
}

#[tokio::test]
async fn list_changed_triggers_refetch() {
    let server = tool_server();
    let factory = MockFactory::new().plan(
        TransportKind::StreamableHttp,
        vec![Behavior::Serve(Arc::clone(&server))],
    );
    let conn = ClientConnection::new(url(), options(TransportMode::Auto, &factory));
    conn.init().await.unwrap();
    assert_eq!(conn.tools().len(), 1);

    server.respond(
        "tools/list",
        json!({"tools": [{"name": "add"}, {"name": "subtract"}]}),
    );
    factory.last().push(JsonRpcMessage::notification(
        method::TOOLS_LIST_CHANGED,
        None,
    ));

    assert!(eventually(|| conn.tools().len() == 2).await);
}

// ---------------------------------------------------------------------------
// Server-initiated requests
// ---------------------------------------------------------------------------

fn request(id: i64, method: &str, params: Option<serde_json::Value>) -> JsonRpcMessage {
    JsonRpcMessage::Request(JsonRpcRequest::new(id, method, params))
}

#[tokio::test]
async fn ping_and_unknown_requests_are_answered() {
    let factory = MockFactory::new().plan(
        TransportKind::StreamableHttp,
        vec![Behavior::Serve(tool_server())],
    );
    let conn = ClientConnection::new(url(), options(TransportMode::Auto, &factory));
    conn.init().await.unwrap();
    let transport = factory.last();

    transport.push(request(7, method::PING, None));
    transport.push(request(8, "sampling/createMessage", None));
    transport.push(request(9, method::ELICITATION_CREATE, None));

    assert!(eventually(|| transport.sent().len() >= 4).await);
    let sent = transport.sent();
    let reply = |id: i64| {
        sent.iter()
            .find(|m| m.response_id() == Some(&RequestId::Number(id)))
            .cloned()
            .unwrap()
    };
    match reply(7) {
        JsonRpcMessage::Response(resp) => assert_eq!(resp.result, json!({})),
        other => panic!("Expected response, got: {other:?}"),
    }
    for id in [8, 9] {
        match reply(id) {
            JsonRpcMessage::Error(err) => assert_eq!(err.error.code, -32601),
            other => panic!("Expected error, got: {other:?}"),
        }
    }
}

struct AcceptAll;

impl ElicitationHandler for AcceptAll {
    fn elicit(
        &self,
        params: ElicitRequestParams,
    ) -> BoxFuture<'_, Result<ElicitResult, ClientError>> {
        Box::pin(async move { Ok(ElicitResult::accept(json!({"echo": params.message}))) })
    }
}

#[tokio::test]
async fn elicitation_requests_reach_the_handler() {
    let server = tool_server();
    let factory = MockFactory::new().plan(
        TransportKind::StreamableHttp,
        vec![Behavior::Serve(Arc::clone(&server))],
    );
    let conn = ClientConnection::new(
        url(),
        ConnectOptions {
            elicitation_handler: Some(Arc::new(AcceptAll)),
            ..options(TransportMode::Auto, &factory)
        },
    );
    conn.init().await.unwrap();

    let init = server.requested(method::INITIALIZE);
    assert!(init[0].as_ref().unwrap()["capabilities"]["elicitation"].is_object());

    let transport = factory.last();
    transport.push(request(
        3,
        method::ELICITATION_CREATE,
        Some(json!({"message": "Your name?", "requestedSchema": {"type": "object"}})),
    ));

    assert!(eventually(|| transport.sent().len() >= 2).await);
    match transport.sent().last().cloned().unwrap() {
        JsonRpcMessage::Response(resp) => {
            assert_eq!(resp.id, RequestId::Number(3));
            assert_eq!(resp.result["action"], "accept");
            assert_eq!(resp.result["content"]["echo"], "Your name?");
        }
        other => panic!("Expected response, got: {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn call_tool_and_close() {
    let server = tool_server();
    server.respond(
        "tools/call:add",
        json!({"content": [{"type": "text", "text": "5"}]}),
    );
    let factory = MockFactory::new().plan(
        TransportKind::StreamableHttp,
        vec![Behavior::Serve(Arc::clone(&server))],
    );
    let conn = ClientConnection::new(url(), options(TransportMode::Auto, &factory));
    conn.init().await.unwrap();

    let result = conn
        .call_tool("add", Some(json!({"a": 2, "b": 3})))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(result.first_text(), Some("5"));
    let calls = server.requested(method::TOOLS_CALL);
    assert_eq!(calls[0].as_ref().unwrap()["arguments"]["a"], 2);

    conn.close().await;
    assert!(factory.last().is_closed());
    assert!(matches!(
        conn.call_tool("add", None).await,
        Err(ClientError::NotConnected)
    ));
}
