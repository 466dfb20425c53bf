//! Per-entry transport negotiation: streamable HTTP first, legacy SSE on a
//! missing-endpoint signature, nothing else.

use crate::core::chat_request::McpServerEntry;
use crate::mcp::auth::{select_auth, AuthLabel};
use crate::mcp::error::TransportError;
use crate::mcp::transport::{McpConnection, McpConnector, McpTransportKind};
use crate::utils::url::{log_host, parse_mcp_url};
use futures_util::stream::{self, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::Url;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONCURRENT_CONNECTS: usize = 8;

/// A server that negotiated successfully.
pub struct ConnectionAttempt {
    pub server_id: String,
    pub canonical_url: Url,
    pub transport_kind: McpTransportKind,
    pub auth_label: AuthLabel,
    pub client: Arc<dyn McpConnection>,
}

impl fmt::Debug for ConnectionAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionAttempt")
            .field("server_id", &self.server_id)
            .field("host", &log_host(&self.canonical_url))
            .field("transport_kind", &self.transport_kind)
            .field("auth_label", &self.auth_label)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    InvalidUrl,
    InsecureScheme,
}

#[derive(Debug)]
pub enum NegotiationOutcome {
    Skipped(SkipReason),
    Connected(ConnectionAttempt),
    Failed(TransportError),
}

impl NegotiationOutcome {
    pub fn into_connected(self) -> Option<ConnectionAttempt> {
        match self {
            NegotiationOutcome::Connected(attempt) => Some(attempt),
            _ => None,
        }
    }
}

/// Remote hosts must use TLS; plain HTTP is only accepted on loopback.
pub fn is_allowed_endpoint(url: &Url) -> bool {
    match url.scheme() {
        "https" => true,
        "http" => matches!(url.host_str(), Some("localhost" | "127.0.0.1")),
        _ => false,
    }
}

#[derive(Clone)]
pub struct Negotiator {
    connector: Arc<dyn McpConnector>,
    attempt_timeout: Duration,
    close_timeout: Duration,
    max_concurrency: usize,
}

impl Negotiator {
    pub fn new(connector: Arc<dyn McpConnector>) -> Self {
        Self {
            connector,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            max_concurrency: DEFAULT_MAX_CONCURRENT_CONNECTS,
        }
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Negotiates every entry concurrently; the result order matches `entries`.
    pub async fn negotiate_all(&self, entries: &[McpServerEntry]) -> Vec<NegotiationOutcome> {
        let attempts: Vec<_> = entries.iter().map(|entry| self.negotiate(entry)).collect();
        stream::iter(attempts)
            .buffered(self.max_concurrency)
            .collect()
            .await
    }

    pub async fn negotiate(&self, entry: &McpServerEntry) -> NegotiationOutcome {
        if !entry.enabled {
            debug!(server_id = %entry.id, "MCP server disabled; skipping");
            return NegotiationOutcome::Skipped(SkipReason::Disabled);
        }

        let Some(url) = parse_mcp_url(&entry.url) else {
            warn!(server_id = %entry.id, "MCP server URL is not a valid absolute URL; skipping");
            return NegotiationOutcome::Skipped(SkipReason::InvalidUrl);
        };

        let host = log_host(&url);
        if !is_allowed_endpoint(&url) {
            warn!(
                server_id = %entry.id,
                host = %host,
                scheme = url.scheme(),
                "MCP server must use https unless it is local; skipping"
            );
            return NegotiationOutcome::Skipped(SkipReason::InsecureScheme);
        }

        let auth = select_auth(entry);
        let kind = McpTransportKind::StreamableHttp;
        let result = match self.attempt(kind, &url, auth.streamable_headers()).await {
            Ok(client) => Ok((kind, client)),
            Err(err) if err.allows_legacy_fallback() => {
                info!(
                    server_id = %entry.id,
                    host = %host,
                    status = ?err.status,
                    "Streamable HTTP endpoint missing; trying legacy SSE"
                );
                let kind = McpTransportKind::Sse;
                self.attempt(kind, &url, auth.sse_headers())
                    .await
                    .map(|client| (kind, client))
            }
            Err(err) => Err(err),
        };

        match result {
            Ok((transport_kind, client)) => {
                info!(
                    server_id = %entry.id,
                    host = %host,
                    transport = %transport_kind,
                    auth = %auth.label,
                    "MCP server connected"
                );
                NegotiationOutcome::Connected(ConnectionAttempt {
                    server_id: entry.id.clone(),
                    canonical_url: url,
                    transport_kind,
                    auth_label: auth.label,
                    client,
                })
            }
            Err(err) => {
                log_connect_failure(&entry.id, &host, auth.label, &err);
                NegotiationOutcome::Failed(err)
            }
        }
    }

    /// Connect and probe under one deadline. A client whose probe fails is
    /// closed before returning.
    async fn attempt(
        &self,
        kind: McpTransportKind,
        url: &Url,
        headers: HeaderMap,
    ) -> Result<Arc<dyn McpConnection>, TransportError> {
        let deadline = Instant::now() + self.attempt_timeout;
        let client = timeout_at(deadline, self.connector.connect(kind, url, headers)).await??;

        let probe = match timeout_at(deadline, client.list_tools(None)).await {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };

        match probe {
            Ok(list) => {
                if list.map_or(true, |list| list.tools.is_empty()) {
                    warn!(
                        host = %log_host(url),
                        transport = %kind,
                        "MCP server advertises no tools"
                    );
                }
                Ok(client)
            }
            Err(err) => {
                match timeout(self.close_timeout, client.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(close_err)) => {
                        debug!(host = %log_host(url), error = %close_err, "Closing failed probe client failed");
                    }
                    Err(_) => {
                        debug!(host = %log_host(url), "Closing failed probe client timed out");
                    }
                }
                Err(err)
            }
        }
    }
}

fn log_connect_failure(server_id: &str, host: &str, auth: AuthLabel, err: &TransportError) {
    if err.mentions_session_rejection() {
        warn!(
            server_id = %server_id,
            host = %host,
            "MCP server rejected the session id during initialize; it may not support sessions"
        );
    }

    if err.is_auth_error() {
        warn!(
            server_id = %server_id,
            host = %host,
            auth = %auth,
            status = ?err.status,
            "MCP server rejected credentials"
        );
    } else {
        warn!(
            server_id = %server_id,
            host = %host,
            auth = %auth,
            kind = err.kind.as_str(),
            status = ?err.status,
            error = %err,
            "MCP server connection failed"
        );
    }
}
