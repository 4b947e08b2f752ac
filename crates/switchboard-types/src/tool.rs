//! Tool trait and the context handed to tools during execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::ToolError;
use crate::mcp::{CallToolResult, ElicitResult};

/// Name, description and input schema advertised for a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Asks whoever invoked the current tool for structured input.
pub trait Elicitor: Send + Sync {
    fn elicit(
        &self,
        message: String,
        requested_schema: Value,
    ) -> Pin<Box<dyn Future<Output = Result<ElicitResult, ToolError>> + Send + '_>>;
}

/// Context provided to tools during execution.
#[derive(Clone, Default)]
pub struct ToolContext {
    elicitor: Option<Arc<dyn Elicitor>>,
}

impl ToolContext {
    pub fn with_elicitor(elicitor: Arc<dyn Elicitor>) -> Self {
        Self {
            elicitor: Some(elicitor),
        }
    }

    pub fn can_elicit(&self) -> bool {
        self.elicitor.is_some()
    }

    /// Request user input from the caller mid-execution.
    pub async fn elicit(
        &self,
        message: impl Into<String>,
        requested_schema: Value,
    ) -> Result<ElicitResult, ToolError> {
        let elicitor = self
            .elicitor
            .as_ref()
            .ok_or(ToolError::ElicitationUnavailable)?;
        elicitor.elicit(message.into(), requested_schema).await
    }
}

impl fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolContext")
            .field("can_elicit", &self.can_elicit())
            .finish()
    }
}

/// Trait that all tools must implement.
///
/// A tool is either local to a server built on this workspace or a proxy for a
/// tool living on an upstream MCP server.
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given JSON input and context.
    ///
    /// The context is passed by value to avoid lifetime issues with dyn dispatch.
    fn execute(
        &self,
        input: Value,
        ctx: ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<CallToolResult, ToolError>> + Send + '_>>;
}
