use crate::mcp::error::TransportError;
use reqwest::header::{HeaderMap, HeaderName, CONTENT_TYPE};
use std::time::Duration;

pub const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub const MCP_SSE_ACCEPT: &str = "text/event-stream";
pub const MCP_PROTOCOL_VERSION_HEADER: HeaderName =
    HeaderName::from_static("mcp-protocol-version");
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
/// Fixed protocol revision announced on every request.
pub const MCP_PROTOCOL_VERSION: &str = rust_mcp_schema::LATEST_PROTOCOL_VERSION;

const MCP_HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Shared client for MCP traffic.
///
/// No overall request timeout is set: the legacy transport keeps a GET open
/// for the whole turn. Individual operations are bounded by the negotiator
/// and aggregator instead.
pub fn build_mcp_http_client() -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(MCP_HTTP_CONNECT_TIMEOUT_SECONDS))
        .pool_idle_timeout(Duration::from_secs(MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(TransportError::from)
}

/// Attaches the attempt's header set plus the JSON content type used by POSTs.
pub fn apply_post_headers(
    request: reqwest::RequestBuilder,
    headers: &HeaderMap,
) -> reqwest::RequestBuilder {
    request
        .headers(headers.clone())
        .header(CONTENT_TYPE, MCP_JSON_CONTENT_TYPE)
}

/// Turns a non-success response into a structured error carrying its status.
pub async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::from_status(status, &body))
}

pub fn header_str<'a>(response: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}
