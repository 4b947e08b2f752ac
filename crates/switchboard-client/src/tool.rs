//! McpTool: wraps an upstream server tool as a switchboard_types::Tool.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use switchboard_types::{CallToolResult, ToolContext, ToolDefinition, ToolError, ToolInfo};

use crate::connection::ClientConnection;

/// Name under which an upstream tool is exposed: `tool_{server_id}_{name}`.
pub fn namespaced_tool_name(server_id: &str, tool_name: &str) -> String {
    format!("tool_{server_id}_{tool_name}")
}

/// A tool backed by an upstream MCP server.
pub struct McpTool {
    namespaced_name: String,
    server_id: String,
    info: ToolInfo,
    connection: Arc<ClientConnection>,
}

impl McpTool {
    pub fn new(server_id: &str, info: ToolInfo, connection: Arc<ClientConnection>) -> Self {
        Self {
            namespaced_name: namespaced_tool_name(server_id, &info.name),
            server_id: server_id.to_string(),
            info,
            connection,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// The tool's name on its own server.
    pub fn upstream_name(&self) -> &str {
        &self.info.name
    }
}

impl switchboard_types::Tool for McpTool {
    fn name(&self) -> &str {
        &self.namespaced_name
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.namespaced_name.clone(),
            description: self.info.description.clone().unwrap_or_default(),
            input_schema: self.info.input_schema.clone(),
        }
    }

    fn execute(
        &self,
        input: Value,
        _ctx: ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<CallToolResult, ToolError>> + Send + '_>> {
        Box::pin(async move {
            let arguments = match input {
                Value::Null => None,
                other => Some(other),
            };
            let result = self
                .connection
                .call_tool(&self.info.name, arguments)
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

            if result.is_error {
                let message = result
                    .first_text()
                    .unwrap_or("tool reported an error")
                    .to_string();
                return Err(ToolError::ExecutionFailed(message));
            }
            Ok(result)
        })
    }
}
