//! One chat turn from validated input to streamed output.
//!
//! `prepare` does everything that can fail with a client-visible status
//! before any MCP server is contacted. `execute` negotiates, aggregates,
//! streams, and closes the request's connection pool on every exit path.

use crate::core::chat_request::ChatTurnRequest;
use crate::core::chat_stream::{CompletionRequest, CompletionStreamer, StreamMessage};
use crate::core::config::McpConfig;
use crate::core::credentials::{resolve_api_key, CredentialDecryptor};
use crate::core::error::ChatError;
use crate::mcp::transport::McpConnector;
use crate::mcp::{aggregate, ConnectionPool, NegotiationOutcome, Negotiator};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A validated turn with its provider credential resolved.
pub struct PreparedTurn {
    pub request: ChatTurnRequest,
    api_key: String,
}

impl fmt::Debug for PreparedTurn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedTurn")
            .field("request", &self.request)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

pub struct ChatOrchestrator {
    negotiator: Negotiator,
    streamer: Arc<dyn CompletionStreamer>,
    decryptor: Arc<dyn CredentialDecryptor>,
    secret: Option<String>,
    close_timeout: Duration,
    tool_fetch_timeout: Duration,
    tool_call_timeout: Duration,
    max_tools_per_server: usize,
}

impl ChatOrchestrator {
    pub fn new(
        mcp: &McpConfig,
        connector: Arc<dyn McpConnector>,
        streamer: Arc<dyn CompletionStreamer>,
        decryptor: Arc<dyn CredentialDecryptor>,
        secret: Option<String>,
    ) -> Self {
        let negotiator = Negotiator::new(connector)
            .with_attempt_timeout(mcp.connect_timeout())
            .with_close_timeout(mcp.close_timeout())
            .with_max_concurrency(mcp.max_concurrent_connects);
        Self {
            negotiator,
            streamer,
            decryptor,
            secret,
            close_timeout: mcp.close_timeout(),
            tool_fetch_timeout: mcp.tool_fetch_timeout(),
            tool_call_timeout: mcp.tool_call_timeout(),
            max_tools_per_server: mcp.max_tools_per_server.max(1),
        }
    }

    /// Validates the body, then resolves the credential. No MCP work.
    pub fn prepare(&self, body: &[u8], cookie: Option<&str>) -> Result<PreparedTurn, ChatError> {
        let request = ChatTurnRequest::from_slice(body)?;
        let api_key = resolve_api_key(self.decryptor.as_ref(), cookie, self.secret.as_deref())?;
        Ok(PreparedTurn { request, api_key })
    }

    pub async fn execute(
        &self,
        prepared: PreparedTurn,
        sink: mpsc::Sender<StreamMessage>,
        cancel: CancellationToken,
    ) -> Result<(), ChatError> {
        let PreparedTurn { request, api_key } = prepared;
        let mut pool = ConnectionPool::new(self.close_timeout);

        let outcomes = self.negotiator.negotiate_all(&request.mcp_servers).await;
        let mut failed = 0usize;
        for outcome in outcomes {
            match outcome {
                NegotiationOutcome::Connected(attempt) => pool.register(attempt),
                NegotiationOutcome::Failed(_) => failed += 1,
                NegotiationOutcome::Skipped(reason) => {
                    debug!(?reason, "MCP server skipped");
                }
            }
        }

        let tools = aggregate(&pool, self.tool_fetch_timeout, self.max_tools_per_server)
            .await
            .with_call_timeout(self.tool_call_timeout);
        info!(
            model = %request.model,
            servers = request.mcp_servers.len(),
            connected = pool.len(),
            failed,
            tools = tools.len(),
            "Starting chat completion"
        );

        let completion = CompletionRequest {
            api_key,
            model: request.model.clone(),
            messages: request.chat_messages(),
            reasoning: request.reasoning,
        };
        let result = self
            .streamer
            .stream(completion, Arc::new(tools), sink, cancel)
            .await;

        pool.close_all().await;

        result.map_err(|err| {
            warn!(error = %err, "Chat completion stream failed");
            ChatError::StreamFailure(err.to_string())
        })
    }
}
