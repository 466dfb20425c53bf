//! Merges tool listings from every live connection into one namespace.

use crate::api::{ChatToolDefinition, ChatToolFunction};
use crate::mcp::error::TransportError;
use crate::mcp::pool::ConnectionPool;
use crate::mcp::protocol::serialize_mcp_result;
use crate::mcp::transport::{list_all_tools, McpConnection};
use crate::utils::url::log_host;
use futures_util::future::join_all;
use rust_mcp_schema::{CallToolResult, ContentBlock, Tool};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

pub const DEFAULT_TOOL_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AggregatedTool {
    pub server_id: String,
    pub tool: Tool,
    pub client: Arc<dyn McpConnection>,
}

impl fmt::Debug for AggregatedTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatedTool")
            .field("server_id", &self.server_id)
            .field("tool", &self.tool.name)
            .field("transport", &self.client.kind())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ToolCallError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
    #[error("Tool reported an error: {0}")]
    ToolFailed(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Flat tool namespace handed to the model for one chat turn.
#[derive(Debug, Clone)]
pub struct ToolSet {
    tools: BTreeMap<String, AggregatedTool>,
    call_timeout: Duration,
}

impl Default for ToolSet {
    fn default() -> Self {
        Self {
            tools: BTreeMap::new(),
            call_timeout: DEFAULT_TOOL_CALL_TIMEOUT,
        }
    }
}

impl ToolSet {
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Later inserts replace earlier ones; returns the server that lost.
    pub fn insert(&mut self, server_id: &str, tool: Tool, client: Arc<dyn McpConnection>) -> Option<String> {
        let name = tool.name.clone();
        self.tools
            .insert(
                name,
                AggregatedTool {
                    server_id: server_id.to_string(),
                    tool,
                    client,
                },
            )
            .map(|previous| previous.server_id)
    }

    pub fn get(&self, name: &str) -> Option<&AggregatedTool> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Function-tool definitions in the chat completions format.
    pub fn definitions(&self) -> Vec<ChatToolDefinition> {
        self.tools
            .values()
            .map(|entry| ChatToolDefinition {
                kind: "function".to_string(),
                function: ChatToolFunction {
                    name: entry.tool.name.clone(),
                    description: entry.tool.description.clone(),
                    parameters: serde_json::to_value(&entry.tool.input_schema)
                        .unwrap_or_else(|_| json!({"type": "object", "properties": {}})),
                },
            })
            .collect()
    }

    /// Invokes `name` on the server that owns it; `raw_arguments` is the
    /// JSON string produced by the model.
    pub async fn call(&self, name: &str, raw_arguments: &str) -> Result<String, ToolCallError> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| ToolCallError::UnknownTool(name.to_string()))?;
        let arguments = parse_tool_arguments(raw_arguments).map_err(ToolCallError::InvalidArguments)?;

        debug!(server_id = %entry.server_id, tool = name, "Calling MCP tool");
        let result = timeout(self.call_timeout, entry.client.call_tool(name, arguments)).await??;
        let text = flatten_tool_result(&result);
        if result.is_error.unwrap_or(false) {
            return Err(ToolCallError::ToolFailed(text));
        }
        Ok(text)
    }
}

impl From<tokio::time::error::Elapsed> for ToolCallError {
    fn from(elapsed: tokio::time::error::Elapsed) -> Self {
        ToolCallError::Transport(elapsed.into())
    }
}

fn parse_tool_arguments(raw: &str) -> Result<Option<Map<String, Value>>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(trimmed).map_err(|err| err.to_string())?;
    match value {
        Value::Object(map) => Ok(Some(map)),
        _ => Err("Tool arguments must be a JSON object.".to_string()),
    }
}

/// Text-only results are joined; anything richer goes to the model as JSON.
fn flatten_tool_result(result: &CallToolResult) -> String {
    let mut texts = Vec::with_capacity(result.content.len());
    for block in &result.content {
        match block {
            ContentBlock::TextContent(text) => texts.push(text.text.as_str()),
            _ => return serialize_mcp_result(result),
        }
    }
    if texts.is_empty() {
        return serialize_mcp_result(result);
    }
    texts.join("\n")
}

/// Fetches every live connection's tools concurrently and merges them in
/// pool order, last write wins. A connection that fails contributes nothing.
pub async fn aggregate(pool: &ConnectionPool, fetch_timeout: Duration, max_tools: usize) -> ToolSet {
    let fetches = pool.live().iter().map(|attempt| async move {
        let result = match timeout(fetch_timeout, list_all_tools(attempt.client.as_ref(), max_tools)).await {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };
        match result {
            Ok(list) => list.tools,
            Err(err) if err.is_auth_error() => {
                warn!(
                    server_id = %attempt.server_id,
                    host = %log_host(&attempt.canonical_url),
                    auth = %attempt.auth_label,
                    status = ?err.status,
                    "MCP server rejected credentials while listing tools"
                );
                Vec::new()
            }
            Err(err) => {
                warn!(
                    server_id = %attempt.server_id,
                    host = %log_host(&attempt.canonical_url),
                    kind = err.kind.as_str(),
                    error = %err,
                    "Failed to fetch MCP tools"
                );
                Vec::new()
            }
        }
    });
    let listings = join_all(fetches).await;

    let mut tool_set = ToolSet::default();
    for (attempt, tools) in pool.live().iter().zip(listings) {
        for tool in tools {
            let name = tool.name.clone();
            if let Some(previous) = tool_set.insert(&attempt.server_id, tool, attempt.client.clone()) {
                warn!(
                    tool = %name,
                    shadowed = %previous,
                    winner = %attempt.server_id,
                    "MCP tool name collision; later server wins"
                );
            }
        }
    }
    tool_set
}
