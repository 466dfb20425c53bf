//! Shared MCP transport abstractions.
//!
//! Both wire transports (streamable HTTP and the legacy event-stream
//! transport) expose the same [`McpConnection`] surface so the negotiator,
//! pool and aggregator never branch on the transport in use.

use crate::mcp::error::TransportError;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Url;
use rust_mcp_schema::{CallToolResult, ListToolsResult};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod http;
pub mod sse;
pub mod streamable_http;

/// Upper bound on tools collected from a single server across pages.
pub const MCP_MAX_TOOL_LIST: usize = 100;

/// Supported MCP transport backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McpTransportKind {
    StreamableHttp,
    Sse,
}

impl McpTransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpTransportKind::StreamableHttp => "streamable-http",
            McpTransportKind::Sse => "sse",
        }
    }
}

impl fmt::Display for McpTransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live, initialized MCP session.
#[async_trait]
pub trait McpConnection: Send + Sync {
    fn kind(&self) -> McpTransportKind;

    /// One page of `tools/list`; `Ok(None)` when the server lacks the method.
    async fn list_tools(
        &self,
        cursor: Option<String>,
    ) -> Result<Option<ListToolsResult>, TransportError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens connections; the production implementation speaks HTTP.
#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(
        &self,
        kind: McpTransportKind,
        url: &Url,
        headers: HeaderMap,
    ) -> Result<Arc<dyn McpConnection>, TransportError>;
}

/// Connector backed by a shared `reqwest::Client`.
#[derive(Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
    endpoint_timeout: Duration,
}

impl HttpConnector {
    pub fn new(endpoint_timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            client: http::build_mcp_http_client()?,
            endpoint_timeout,
        })
    }

    pub fn with_client(client: reqwest::Client, endpoint_timeout: Duration) -> Self {
        Self {
            client,
            endpoint_timeout,
        }
    }
}

#[async_trait]
impl McpConnector for HttpConnector {
    async fn connect(
        &self,
        kind: McpTransportKind,
        url: &Url,
        headers: HeaderMap,
    ) -> Result<Arc<dyn McpConnection>, TransportError> {
        match kind {
            McpTransportKind::StreamableHttp => {
                let connection = streamable_http::StreamableHttpConnection::connect(
                    self.client.clone(),
                    url.clone(),
                    headers,
                )
                .await?;
                Ok(Arc::new(connection))
            }
            McpTransportKind::Sse => {
                let connection = sse::SseConnection::connect(
                    self.client.clone(),
                    url.clone(),
                    headers,
                    self.endpoint_timeout,
                )
                .await?;
                Ok(Arc::new(connection))
            }
        }
    }
}

/// Follows `nextCursor` until exhausted, truncating at `max_tools`.
pub async fn list_all_tools(
    connection: &dyn McpConnection,
    max_tools: usize,
) -> Result<ListToolsResult, TransportError> {
    let Some(mut list) = connection.list_tools(None).await? else {
        return Ok(empty_list_tools());
    };

    let meta = list.meta.take();
    let mut tools = std::mem::take(&mut list.tools);
    let mut next_cursor = list.next_cursor.take();

    if tools.len() >= max_tools {
        tools.truncate(max_tools);
    } else {
        while let Some(cursor) = next_cursor.clone() {
            match connection.list_tools(Some(cursor)).await? {
                Some(next_list) => {
                    tools.extend(next_list.tools);
                    next_cursor = next_list.next_cursor;
                    if tools.len() >= max_tools {
                        tools.truncate(max_tools);
                        break;
                    }
                }
                None => {
                    next_cursor = None;
                    break;
                }
            }
        }
    }

    Ok(ListToolsResult {
        meta,
        next_cursor,
        tools,
    })
}

pub fn empty_list_tools() -> ListToolsResult {
    ListToolsResult {
        meta: None,
        next_cursor: None,
        tools: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::FakeConnection;
    use crate::utils::test_utils::sample_tool;

    #[tokio::test]
    async fn list_all_tools_follows_cursors() {
        let connection = FakeConnection::new(McpTransportKind::StreamableHttp).with_pages(vec![
            vec![sample_tool("a"), sample_tool("b")],
            vec![sample_tool("c")],
        ]);
        let list = list_all_tools(&connection, MCP_MAX_TOOL_LIST)
            .await
            .expect("list");
        let names: Vec<_> = list.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(list.next_cursor.is_none());
    }

    #[tokio::test]
    async fn list_all_tools_truncates_at_limit() {
        let connection = FakeConnection::new(McpTransportKind::Sse).with_pages(vec![
            vec![sample_tool("a"), sample_tool("b")],
            vec![sample_tool("c"), sample_tool("d")],
            vec![sample_tool("e")],
        ]);
        let list = list_all_tools(&connection, 3).await.expect("list");
        assert_eq!(list.tools.len(), 3);
        assert_eq!(list.next_cursor.as_deref(), Some("page-2"));
    }

    #[tokio::test]
    async fn list_all_tools_treats_missing_method_as_empty() {
        let connection = FakeConnection::new(McpTransportKind::StreamableHttp).without_tools_method();
        let list = list_all_tools(&connection, MCP_MAX_TOOL_LIST)
            .await
            .expect("list");
        assert!(list.tools.is_empty());
    }
}
