//! Legacy HTTP+SSE transport.
//!
//! The client holds a GET event stream open; the server announces a POST
//! endpoint via an `endpoint` event and delivers every JSON-RPC reply as a
//! `message` event on the stream. Replies are routed back to callers by id.

use super::http::{apply_post_headers, ensure_success, header_str};
use super::streamable_http::{
    is_event_stream_content_type, sse_data_payload, sse_event_name, SseLineBuffer,
};
use super::{McpConnection, McpTransportKind};
use crate::mcp::error::TransportError;
use crate::mcp::protocol::{
    client_details, initialized_notification, paginated_params, parse_call_tool,
    parse_initialize_result, parse_list_tools, request_message,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::Url;
use rust_mcp_schema::schema_utils::{ClientMessage, RequestFromClient, ServerMessage};
use rust_mcp_schema::{CallToolRequestParams, CallToolResult, ListToolsResult};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

type PendingReply = oneshot::Sender<Result<ServerMessage, TransportError>>;

#[derive(Default)]
struct PendingRequests {
    waiting: HashMap<i64, PendingReply>,
    closed: bool,
}

impl PendingRequests {
    fn fail_all(&mut self, reason: &str) {
        self.closed = true;
        for (_, reply) in self.waiting.drain() {
            let _ = reply.send(Err(TransportError::network(reason)));
        }
    }
}

/// Holds a request's place in the pending table; dropping it (reply
/// received, POST failed or caller gave up) removes the entry.
struct PendingSlot<'a> {
    pending: &'a Mutex<PendingRequests>,
    id: i64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.waiting.remove(&self.id);
        }
    }
}

fn register_pending(
    pending: &Mutex<PendingRequests>,
    id: i64,
) -> Result<
    (
        PendingSlot<'_>,
        oneshot::Receiver<Result<ServerMessage, TransportError>>,
    ),
    TransportError,
> {
    let mut table = pending
        .lock()
        .map_err(|_| TransportError::other("SSE request table poisoned"))?;
    if table.closed {
        return Err(TransportError::network("SSE connection closed"));
    }
    let (reply_tx, reply_rx) = oneshot::channel();
    table.waiting.insert(id, reply_tx);
    Ok((PendingSlot { pending, id }, reply_rx))
}

pub struct SseConnection {
    client: reqwest::Client,
    headers: HeaderMap,
    endpoint: Url,
    pending: Arc<Mutex<PendingRequests>>,
    next_request_id: AtomicI64,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SseConnection {
    /// Opens the event stream, waits for the endpoint and runs the handshake.
    pub async fn connect(
        client: reqwest::Client,
        url: Url,
        headers: HeaderMap,
        endpoint_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let response = client
            .get(url.clone())
            .headers(headers.clone())
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let content_type = header_str(&response, CONTENT_TYPE.as_str()).unwrap_or("");
        if !is_event_stream_content_type(content_type) {
            return Err(TransportError::other(format!(
                "Expected an event stream, got content type {content_type:?}"
            )));
        }

        let pending = Arc::new(Mutex::new(PendingRequests::default()));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(read_event_stream(
            response,
            url.clone(),
            Arc::clone(&pending),
            endpoint_tx,
        ));

        let endpoint = match tokio::time::timeout(endpoint_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader.abort();
                return Err(TransportError::network(
                    "Event stream closed before announcing an endpoint",
                ));
            }
            Err(_) => {
                reader.abort();
                return Err(TransportError::timeout(
                    "Timed out waiting for the event-stream endpoint",
                ));
            }
        };

        if endpoint.origin() != url.origin() {
            reader.abort();
            return Err(TransportError::other(
                "Event-stream endpoint points at a different origin",
            ));
        }

        let connection = Self {
            client,
            headers,
            endpoint,
            pending,
            next_request_id: AtomicI64::new(1),
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        };

        let response = connection
            .send_request(RequestFromClient::InitializeRequest(client_details()))
            .await?;
        let initialize = parse_initialize_result(response)?;
        debug!(
            endpoint = %connection.endpoint.path(),
            protocol_version = %initialize.protocol_version,
            "MCP sse session initialized"
        );
        connection.post(&initialized_notification()?).await?;

        Ok(connection)
    }

    async fn post(&self, message: &ClientMessage) -> Result<(), TransportError> {
        let payload =
            serde_json::to_string(message).map_err(|err| TransportError::other(err.to_string()))?;
        let response = apply_post_headers(self.client.post(self.endpoint.clone()), &self.headers)
            .body(payload)
            .send()
            .await?;
        ensure_success(response).await.map(|_| ())
    }

    async fn send_request(
        &self,
        request: RequestFromClient,
    ) -> Result<ServerMessage, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::other("MCP connection is closed."));
        }
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let message = request_message(id, request)?;

        let (_slot, reply_rx) = register_pending(&self.pending, id)?;
        self.post(&message).await?;

        match reply_rx.await {
            Ok(reply) => reply,
            Err(_) => Err(TransportError::network("SSE connection closed")),
        }
    }

    fn shutdown(&self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.fail_all("SSE connection closed");
        }
    }
}

impl Drop for SseConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl McpConnection for SseConnection {
    fn kind(&self) -> McpTransportKind {
        McpTransportKind::Sse
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

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown();
        Ok(())
    }
}

async fn read_event_stream(
    response: reqwest::Response,
    stream_url: Url,
    pending: Arc<Mutex<PendingRequests>>,
    endpoint_tx: oneshot::Sender<Url>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();
    let mut event: Option<String> = None;

    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else {
            break;
        };
        for line in buffer.push(&chunk) {
            handle_line(&line, &mut event, &stream_url, &pending, &mut endpoint_tx);
        }
    }
    for line in buffer.finish() {
        handle_line(&line, &mut event, &stream_url, &pending, &mut endpoint_tx);
    }

    if let Ok(mut pending) = pending.lock() {
        pending.fail_all("SSE connection closed");
    }
}

fn handle_line(
    line: &str,
    event: &mut Option<String>,
    stream_url: &Url,
    pending: &Mutex<PendingRequests>,
    endpoint_tx: &mut Option<oneshot::Sender<Url>>,
) {
    if line.starts_with(':') {
        return;
    }
    if let Some(name) = sse_event_name(line) {
        *event = Some(name.to_string());
        return;
    }
    let Some(data) = sse_data_payload(line) else {
        return;
    };
    let name = event.take().unwrap_or_else(|| "message".to_string());

    if name.eq_ignore_ascii_case("endpoint") {
        match resolve_endpoint(stream_url, data) {
            Some(endpoint) => {
                if let Some(tx) = endpoint_tx.take() {
                    let _ = tx.send(endpoint);
                }
            }
            None => debug!("Ignoring unparseable SSE endpoint event"),
        }
        return;
    }
    if !name.eq_ignore_ascii_case("message") || data.is_empty() {
        return;
    }

    let Ok(value) = serde_json::from_str::<Value>(data) else {
        debug!("Ignoring non-JSON SSE message");
        return;
    };
    let Some(id) = value.get("id").and_then(Value::as_i64) else {
        return;
    };
    let Ok(message) = serde_json::from_value::<ServerMessage>(value) else {
        return;
    };
    if !matches!(
        message,
        ServerMessage::Response(_) | ServerMessage::Error(_)
    ) {
        return;
    }

    let reply = pending
        .lock()
        .ok()
        .and_then(|mut pending| pending.waiting.remove(&id));
    match reply {
        Some(reply) => {
            let _ = reply.send(Ok(message));
        }
        None => debug!(id, "SSE reply for unknown request id"),
    }
}

/// Endpoint data may be absolute, path-relative, or a JSON `{"endpoint": ..}`.
pub fn resolve_endpoint(stream_url: &Url, data: &str) -> Option<Url> {
    let data = data.trim();
    if data.starts_with('{') {
        let value: Value = serde_json::from_str(data).ok()?;
        let endpoint = value.get("endpoint")?.as_str()?;
        return resolve_endpoint(stream_url, endpoint);
    }
    if data.is_empty() {
        return None;
    }
    stream_url.join(data).ok()
}
