//! A [`MessageHandler`] serving a set of [`Tool`]s over MCP.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use switchboard_transport::BoxFuture;
use switchboard_types::{
    CallToolParams, CallToolResult, INTERNAL_ERROR, INVALID_PARAMS, Implementation,
    InitializeResult, JsonRpcMessage, JsonRpcRequest, LATEST_PROTOCOL_VERSION,
    ListChangedCapability, METHOD_NOT_FOUND, SUPPORTED_PROTOCOL_VERSIONS, ServerCapabilities,
    Tool, ToolError, ToolInfo, method,
};
use tracing::{debug, warn};

use crate::handler::{MessageHandler, RequestContext};

pub struct ToolRouter {
    server_info: Implementation,
    instructions: Option<String>,
    tools: RwLock<BTreeMap<String, Arc<dyn Tool>>>,
}

impl ToolRouter {
    pub fn new(server_info: Implementation) -> Self {
        Self {
            server_info,
            instructions: None,
            tools: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tool.name().to_string(), tool);
    }

    /// Replace the whole tool set.
    /// Replace every tool. Returns whether the advertised definitions changed.
    pub fn set_tools(&self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> bool {
        let tools: BTreeMap<String, Arc<dyn Tool>> = tools
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect();
        let mut current = self.tools.write().unwrap_or_else(|e| e.into_inner());
        let changed = current.len() != tools.len()
            || current
                .iter()
                .zip(tools.iter())
                .any(|((a, old), (b, new))| a != b || old.definition() != new.definition());
        *current = tools;
        changed
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn initialize(&self, params: Option<&Value>) -> InitializeResult {
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let protocol_version = match requested {
            Some(v) if SUPPORTED_PROTOCOL_VERSIONS.contains(&v) => v.to_string(),
            _ => LATEST_PROTOCOL_VERSION.to_string(),
        };
        InitializeResult {
            protocol_version,
            capabilities: ServerCapabilities {
                tools: Some(ListChangedCapability { list_changed: true }),
                ..ServerCapabilities::default()
            },
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        }
    }

    fn list_tools(&self) -> Vec<ToolInfo> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|tool| {
                let def = tool.definition();
                ToolInfo {
                    name: def.name,
                    title: None,
                    description: Some(def.description),
                    input_schema: def.input_schema,
                    output_schema: None,
                    annotations: None,
                }
            })
            .collect()
    }

    async fn call_tool(
        &self,
        params: CallToolParams,
        ctx: &RequestContext,
    ) -> Result<CallToolResult, (i64, String)> {
        let tool = self.tool(&params.name).ok_or_else(|| {
            (
                INVALID_PARAMS,
                ToolError::UnknownTool {
                    name: params.name.clone(),
                }
                .to_string(),
            )
        })?;
        let input = params.arguments.unwrap_or(Value::Null);
        match tool.execute(input, ctx.tool_context()).await {
            Ok(result) => Ok(result),
            Err(ToolError::InvalidInput { tool, message }) => Err((
                INVALID_PARAMS,
                ToolError::InvalidInput { tool, message }.to_string(),
            )),
            Err(e) => {
                warn!(tool = %params.name, error = %e, "tool failed");
                Ok(CallToolResult::error(e.to_string()))
            }
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, (i64, String)> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| (INVALID_PARAMS, format!("Invalid params: {e}")))
}

fn to_result<T: serde::Serialize>(value: &T) -> Result<Value, (i64, String)> {
    serde_json::to_value(value).map_err(|e| (INTERNAL_ERROR, e.to_string()))
}

impl MessageHandler for ToolRouter {
    fn handle_request(
        &self,
        request: JsonRpcRequest,
        ctx: RequestContext,
    ) -> BoxFuture<'_, JsonRpcMessage> {
        Box::pin(async move {
            debug!(method = %request.method, session = %ctx.session_id(), "request");
            let outcome = match request.method.as_str() {
                method::INITIALIZE => to_result(&self.initialize(request.params.as_ref())),
                method::PING => Ok(json!({})),
                method::TOOLS_LIST => Ok(json!({ "tools": self.list_tools() })),
                method::TOOLS_CALL => match parse_params::<CallToolParams>(request.params) {
                    Ok(params) => match self.call_tool(params, &ctx).await {
                        Ok(result) => to_result(&result),
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                },
                other => Err((METHOD_NOT_FOUND, format!("Method not found: {other}"))),
            };
            match outcome {
                Ok(result) => JsonRpcMessage::response(request.id, result),
                Err((code, message)) => JsonRpcMessage::error(Some(request.id), code, message),
            }
        })
    }
}
