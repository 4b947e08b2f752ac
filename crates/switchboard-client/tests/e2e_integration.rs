//! Real client against the real server over loopback HTTP.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Value, json};
use switchboard_client::{
    CallToolRequest, ClientError, ClientManager, ConnectOptions, ConnectionState,
    ElicitationHandler, TransportMode,
};
use switchboard_server::{McpServer, ServerOptions, ToolRouter};
use switchboard_transport::{BoxFuture, TransportKind};
use switchboard_types::{
    CallToolResult, ElicitAction, ElicitRequestParams, ElicitResult, Implementation, Tool,
    ToolContext, ToolDefinition, ToolError,
};

struct Add;

impl Tool for Add {
    fn name(&self) -> &str {
        "add"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "add".into(),
            description: "Add two integers".into(),
            input_schema: json!({"type": "object"}),
        }
    }

    fn execute(
        &self,
        input: Value,
        _ctx: ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<CallToolResult, ToolError>> + Send + '_>> {
        Box::pin(async move {
            let a = input["a"].as_i64().unwrap_or_default();
            let b = input["b"].as_i64().unwrap_or_default();
            Ok(CallToolResult::text((a + b).to_string()))
        })
    }
}

struct Greet;

impl Tool for Greet {
    fn name(&self) -> &str {
        "greet"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "greet".into(),
            description: "Greet the caller by name".into(),
            input_schema: json!({"type": "object"}),
        }
    }

    fn execute(
        &self,
        _input: Value,
        ctx: ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<CallToolResult, ToolError>> + Send + '_>> {
        Box::pin(async move {
            let answer = ctx.elicit("Name?", json!({"type": "object"})).await?;
            match (answer.action, answer.content) {
                (ElicitAction::Accept, Some(content)) => Ok(CallToolResult::text(format!(
                    "Hello, {}!",
                    content["name"].as_str().unwrap_or("?")
                ))),
                _ => Ok(CallToolResult::text("cancelled")),
            }
        })
    }
}

struct AnswerAda;

impl ElicitationHandler for AnswerAda {
    fn elicit(&self, params: ElicitRequestParams) -> BoxFuture<'_, Result<ElicitResult, ClientError>> {
        Box::pin(async move {
            assert_eq!(params.message, "Name?");
            Ok(ElicitResult::accept(json!({"name": "Ada"})))
        })
    }
}

async fn start_server() -> String {
    let router = ToolRouter::new(Implementation::new("e2e", "1.0.0"));
    router.register(Arc::new(Add));
    router.register(Arc::new(Greet));
    let server = McpServer::new(Arc::new(router), ServerOptions::default());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("http://{addr}")
}

fn options(mode: TransportMode) -> ConnectOptions {
    ConnectOptions {
        transport: mode,
        ..ConnectOptions::default()
    }
}

async fn add_two_and_three(manager: &ClientManager, server_id: &str) -> CallToolResult {
    manager
        .call_tool(CallToolRequest {
            server_id: server_id.to_string(),
            name: "add".to_string(),
            arguments: Some(json!({"a": 2, "b": 3})),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn streamable_http_round_trip() {
    let base = start_server().await;
    let manager = ClientManager::new();

    let result = manager
        .connect(&format!("{base}/mcp"), options(TransportMode::Auto))
        .await
        .unwrap();
    assert!(result.auth_url.is_none());

    let connection = manager.connection(&result.id).unwrap();
    assert_eq!(connection.state(), ConnectionState::Ready);
    assert_eq!(
        connection.connected_transport(),
        Some(TransportKind::StreamableHttp)
    );
    assert_eq!(connection.server_info().unwrap().name, "e2e");

    let names: Vec<_> = manager.list_tools().into_iter().map(|t| t.item.name).collect();
    assert_eq!(names, vec!["add", "greet"]);

    let sum = add_two_and_three(&manager, &result.id).await;
    assert!(!sum.is_error);
    assert_eq!(sum.first_text(), Some("5"));

    manager.close_all_connections().await;
}

#[tokio::test]
async fn legacy_sse_round_trip() {
    let base = start_server().await;
    let manager = ClientManager::new();

    let result = manager
        .connect(&format!("{base}/sse"), options(TransportMode::Sse))
        .await
        .unwrap();
    let connection = manager.connection(&result.id).unwrap();
    assert_eq!(connection.state(), ConnectionState::Ready);
    assert_eq!(connection.connected_transport(), Some(TransportKind::Sse));

    let sum = add_two_and_three(&manager, &result.id).await;
    assert_eq!(sum.first_text(), Some("5"));
}

#[tokio::test]
async fn auto_mode_falls_back_to_sse() {
    let base = start_server().await;
    let manager = ClientManager::new();

    // POST /sse is not routed, so the Streamable HTTP attempt gets a 405.
    let result = manager
        .connect(&format!("{base}/sse"), options(TransportMode::Auto))
        .await
        .unwrap();
    let connection = manager.connection(&result.id).unwrap();
    assert_eq!(connection.state(), ConnectionState::Ready);
    assert_eq!(connection.connected_transport(), Some(TransportKind::Sse));
}

#[tokio::test]
async fn tool_elicitation_reaches_client_handler() {
    let base = start_server().await;
    let manager = ClientManager::new();

    let opts = ConnectOptions {
        elicitation_handler: Some(Arc::new(AnswerAda)),
        ..options(TransportMode::StreamableHttp)
    };
    let result = manager.connect(&format!("{base}/mcp"), opts).await.unwrap();

    let greeting = manager
        .call_tool(CallToolRequest {
            server_id: result.id.clone(),
            name: "greet".to_string(),
            arguments: None,
        })
        .await
        .unwrap();
    assert_eq!(greeting.first_text(), Some("Hello, Ada!"));
}
