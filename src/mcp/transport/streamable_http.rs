use super::http::{apply_post_headers, ensure_success, header_str, MCP_SESSION_ID_HEADER};
use super::{McpConnection, McpTransportKind};
use crate::mcp::error::TransportError;
use crate::mcp::protocol::{
    client_details, initialized_notification, paginated_params, parse_call_tool,
    parse_initialize_result, parse_list_tools, request_message,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{StatusCode, Url};
use rust_mcp_schema::schema_utils::{ClientMessage, RequestFromClient, ServerMessage};
use rust_mcp_schema::{CallToolRequestParams, CallToolResult, ListToolsResult};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use tracing::debug;

#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.buffer[search_index..].iter().position(|b| *b == b'\n')
        {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            let line_bytes = &self.buffer[search_index..line_end];
            if let Ok(text) = std::str::from_utf8(line_bytes) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }

            search_index = newline_index + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

pub fn sse_event_name(line: &str) -> Option<&str> {
    line.strip_prefix("event:").map(str::trim)
}

/// Reads an event-stream POST response until the first response or error.
pub async fn next_sse_server_message(
    response: reqwest::Response,
) -> Result<ServerMessage, TransportError> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(TransportError::from)?;
        for line in buffer.push(&chunk) {
            if let Some(message) = decode_sse_line(&line)? {
                if is_reply(&message) {
                    return Ok(message);
                }
            }
        }
    }

    for line in buffer.finish() {
        if let Some(message) = decode_sse_line(&line)? {
            if is_reply(&message) {
                return Ok(message);
            }
        }
    }

    Err(TransportError::other("Empty event-stream response."))
}

fn is_reply(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Response(_) | ServerMessage::Error(_)
    )
}

fn decode_sse_line(line: &str) -> Result<Option<ServerMessage>, TransportError> {
    let Some(payload) = sse_data_payload(line) else {
        return Ok(None);
    };

    if payload.is_empty() {
        return Ok(None);
    }

    serde_json::from_str::<ServerMessage>(payload)
        .map(Some)
        .map_err(|err| TransportError::other(err.to_string()))
}

/// Streamable-HTTP session: every JSON-RPC message is its own POST.
pub struct StreamableHttpConnection {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    session_id: Mutex<Option<String>>,
    next_request_id: AtomicI64,
    closed: AtomicBool,
}

impl StreamableHttpConnection {
    /// Sends `initialize` and `notifications/initialized`.
    pub async fn connect(
        client: reqwest::Client,
        url: Url,
        headers: HeaderMap,
    ) -> Result<Self, TransportError> {
        let connection = Self {
            client,
            url,
            headers,
            session_id: Mutex::new(None),
            next_request_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
        };

        match connection.handshake().await {
            Ok(()) => Ok(connection),
            Err(err) => {
                // The server may already have issued a session.
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Failed to end half-open MCP session");
                }
                Err(err)
            }
        }
    }

    async fn handshake(&self) -> Result<(), TransportError> {
        let response = self
            .send_request(RequestFromClient::InitializeRequest(client_details()))
            .await?;
        let initialize = parse_initialize_result(response)?;
        debug!(
            url = %self.url,
            protocol_version = %initialize.protocol_version,
            has_session = self.session_id().is_some(),
            "MCP streamable-http session initialized"
        );

        self.send_notification(initialized_notification()?).await
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .ok()
            .and_then(|session| session.clone())
    }

    fn remember_session(&self, response: &reqwest::Response) {
        if let Some(session_id) = header_str(response, MCP_SESSION_ID_HEADER) {
            if let Ok(mut guard) = self.session_id.lock() {
                *guard = Some(session_id.to_string());
            }
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::other("MCP connection is closed."));
        }
        Ok(())
    }

    fn post(&self, message: &ClientMessage) -> Result<reqwest::RequestBuilder, TransportError> {
        let payload =
            serde_json::to_string(message).map_err(|err| TransportError::other(err.to_string()))?;
        let mut request =
            apply_post_headers(self.client.post(self.url.clone()), &self.headers).body(payload);
        if let Some(session_id) = self.session_id() {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }
        Ok(request)
    }

    async fn send_request(
        &self,
        request: RequestFromClient,
    ) -> Result<ServerMessage, TransportError> {
        self.ensure_open()?;
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let message = request_message(id, request)?;

        let response = self.post(&message)?.send().await?;
        let response = ensure_success(response).await?;
        self.remember_session(&response);

        let content_type = header_str(&response, reqwest::header::CONTENT_TYPE.as_str())
            .unwrap_or("")
            .to_string();
        if is_event_stream_content_type(&content_type) {
            next_sse_server_message(response).await
        } else {
            let body = response.bytes().await?;
            serde_json::from_slice::<ServerMessage>(&body)
                .map_err(|err| TransportError::other(err.to_string()))
        }
    }

    async fn send_notification(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.ensure_open()?;
        let response = self.post(&message)?.send().await?;
        let response = ensure_success(response).await?;
        self.remember_session(&response);
        Ok(())
    }
}

impl Drop for StreamableHttpConnection {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(session_id) = self.session_id() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("Dropping MCP session outside a runtime; it will not be terminated");
            return;
        };
        let request = self
            .client
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(MCP_SESSION_ID_HEADER, session_id);
        handle.spawn(async move {
            if let Err(err) = request.send().await {
                debug!(error = %err.without_url(), "Failed to terminate dropped MCP session");
            }
        });
    }
}

#[async_trait]
impl McpConnection for StreamableHttpConnection {
    fn kind(&self) -> McpTransportKind {
        McpTransportKind::StreamableHttp
    }

    async fn list_tools(
        &self,
        cursor: Option<String>,
    ) -> Result<Option<ListToolsResult>, TransportError> {
        let response = self
            .send_request(RequestFromClient::ListToolsRequest(paginated_params(cursor)))
            .await?;
        parse_list_tools(response)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, TransportError> {
        let mut params = CallToolRequestParams::new(name);
        if let Some(arguments) = arguments {
            params = params.with_arguments(arguments);
        }
        let response = self
            .send_request(RequestFromClient::CallToolRequest(params))
            .await?;
        parse_call_tool(response)
    }

    /// Terminates the server-side session when one was issued.
    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(session_id) = self.session_id() else {
            return Ok(());
        };

        let response = self
            .client
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(MCP_SESSION_ID_HEADER, session_id)
            .send()
            .await?;
        // Servers may refuse client-initiated termination.
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(());
        }
        ensure_success(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::error::TransportErrorKind;
    use crate::mcp::transport::http::MCP_PROTOCOL_VERSION;
    use crate::utils::test_utils::{
        initialize_result_body, should_skip_httpmock, tools_list_body,
    };
    use httpmock::Method::{DELETE, POST};
    use httpmock::MockServer;

    #[test]
    fn sse_buffer_handles_partial_lines() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: one").is_empty());
        assert_eq!(buffer.push(b"\n\n"), vec!["data: one"]);
        assert!(buffer.finish().is_empty());
    }

    #[test]
    fn sse_buffer_flushes_trailing_line() {
        let mut buffer = SseLineBuffer::default();
        assert_eq!(
            buffer.push(b"event: endpoint\r\ndata: /messages"),
            vec!["event: endpoint"]
        );
        assert_eq!(buffer.finish(), vec!["data: /messages"]);
    }

    #[test]
    fn detects_event_stream_content_type() {
        assert!(is_event_stream_content_type(
            "text/event-stream; charset=utf-8"
        ));
        assert!(!is_event_stream_content_type("application/json"));
    }

    #[test]
    fn extracts_sse_fields() {
        assert_eq!(sse_data_payload("data: {\"id\":1}"), Some("{\"id\":1}"));
        assert_eq!(sse_data_payload("event: ping"), None);
        assert_eq!(sse_event_name("event: endpoint"), Some("endpoint"));
    }

    fn headers() -> HeaderMap {
        crate::mcp::auth::AuthSelection {
            header: Some(crate::mcp::auth::AuthHeader {
                name: crate::mcp::auth::X_API_KEY_HEADER,
                value: "k".to_string(),
            }),
            label: crate::mcp::auth::AuthLabel::XApiKey,
        }
        .streamable_headers()
    }

    #[tokio::test]
    async fn handshake_lists_tools_and_closes_session() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        let init = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/mcp")
                    .header("x-api-key", "k")
                    .header("mcp-protocol-version", MCP_PROTOCOL_VERSION)
                    .header("accept", "application/json, text/event-stream")
                    .body_includes("\"method\":\"initialize\"");
                then.status(200)
                    .header("content-type", "application/json")
                    .header("mcp-session-id", "sess-1")
                    .body(initialize_result_body(1).to_string());
            })
            .await;
        let initialized = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/mcp")
                    .header("mcp-session-id", "sess-1")
                    .body_includes("notifications/initialized");
                then.status(202);
            })
            .await;
        let list = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/mcp")
                    .header("mcp-session-id", "sess-1")
                    .body_includes("\"method\":\"tools/list\"");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(format!(
                        "event: message\ndata: {}\n\n",
                        tools_list_body(2, &["echo"])
                    ));
            })
            .await;
        let delete = server
            .mock_async(|when, then| {
                when.method(DELETE)
                    .path("/mcp")
                    .header("mcp-session-id", "sess-1");
                then.status(200);
            })
            .await;

        let url = Url::parse(&server.url("/mcp")).expect("url");
        let connection = StreamableHttpConnection::connect(reqwest::Client::new(), url, headers())
            .await
            .expect("connect");
        assert_eq!(connection.session_id().as_deref(), Some("sess-1"));

        let tools = connection
            .list_tools(None)
            .await
            .expect("list")
            .expect("tools");
        assert_eq!(tools.tools[0].name, "echo");

        connection.close().await.expect("close");
        connection.close().await.expect("second close is a no-op");

        init.assert_async().await;
        initialized.assert_async().await;
        list.assert_async().await;
        delete.assert_calls(1);
    }

    #[tokio::test]
    async fn failed_handshake_ends_the_issued_session() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/mcp")
                    .body_includes("\"method\":\"initialize\"");
                then.status(200)
                    .header("content-type", "application/json")
                    .header("mcp-session-id", "half-open")
                    .body(initialize_result_body(1).to_string());
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/mcp")
                    .body_includes("notifications/initialized");
                then.status(500).body("boom");
            })
            .await;
        let delete = server
            .mock_async(|when, then| {
                when.method(DELETE)
                    .path("/mcp")
                    .header("mcp-session-id", "half-open");
                then.status(200);
            })
            .await;

        let url = Url::parse(&server.url("/mcp")).expect("url");
        let result =
            StreamableHttpConnection::connect(reqwest::Client::new(), url, headers()).await;
        assert!(result.is_err());
        delete.assert_calls(1);
    }

    #[tokio::test]
    async fn dropping_an_open_session_terminates_it() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/mcp")
                    .body_includes("\"method\":\"initialize\"");
                then.status(200)
                    .header("content-type", "application/json")
                    .header("mcp-session-id", "dropped")
                    .body(initialize_result_body(1).to_string());
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/mcp")
                    .body_includes("notifications/initialized");
                then.status(202);
            })
            .await;
        let delete = server
            .mock_async(|when, then| {
                when.method(DELETE)
                    .path("/mcp")
                    .header("mcp-session-id", "dropped");
                then.status(200);
            })
            .await;

        let url = Url::parse(&server.url("/mcp")).expect("url");
        let connection = StreamableHttpConnection::connect(reqwest::Client::new(), url, headers())
            .await
            .expect("connect");
        drop(connection);

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        delete.assert_calls(1);
    }

    #[tokio::test]
    async fn missing_endpoint_reports_not_found() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/mcp");
                then.status(404).body("Not Found");
            })
            .await;

        let url = Url::parse(&server.url("/mcp")).expect("url");
        let err = match StreamableHttpConnection::connect(reqwest::Client::new(), url, headers())
            .await
        {
            Ok(_) => panic!("expected failure"),
            Err(err) => err,
        };
        assert_eq!(err.kind, TransportErrorKind::NotFound);
        assert!(err.allows_legacy_fallback());
    }

    #[tokio::test]
    async fn unauthorized_does_not_allow_fallback() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/mcp");
                then.status(401).body("Unauthorized");
            })
            .await;

        let url = Url::parse(&server.url("/mcp")).expect("url");
        let err = match StreamableHttpConnection::connect(reqwest::Client::new(), url, headers())
            .await
        {
            Ok(_) => panic!("expected failure"),
            Err(err) => err,
        };
        assert_eq!(err.kind, TransportErrorKind::AuthError);
        assert_eq!(err.status, Some(401));
        assert!(!err.allows_legacy_fallback());
    }
}
