use async_trait::async_trait;
use futures_util::StreamExt;
use memchr::memchr;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{
    ChatMessage, ChatRequest, ChatResponse, ChatToolCall, ChatToolCallFunction, ReasoningOptions,
    ROLE_ASSISTANT,
};
use crate::core::config::ProviderConfig;
use crate::mcp::ToolSet;
use crate::utils::url::construct_api_url;

const PROVIDER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Events forwarded to the browser, one JSON object per SSE frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamMessage {
    Chunk(String),
    Reasoning(String),
    ToolCall(ToolCallEvent),
    ToolResult(ToolResultEvent),
    Error(String),
    End,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolCallEvent {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolResultEvent {
    pub id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StreamFailure(pub String);

impl StreamFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub struct CompletionRequest {
    pub api_key: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub reasoning: bool,
}

impl fmt::Debug for CompletionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionRequest")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("messages", &self.messages.len())
            .field("reasoning", &self.reasoning)
            .finish()
    }
}

/// Streams one chat turn, including any tool round-trips, into `sink`.
#[async_trait]
pub trait CompletionStreamer: Send + Sync {
    async fn stream(
        &self,
        request: CompletionRequest,
        tools: Arc<ToolSet>,
        sink: mpsc::Sender<StreamMessage>,
        cancel: CancellationToken,
    ) -> Result<(), StreamFailure>;
}

#[derive(Debug, Default, Clone, PartialEq)]
struct PendingToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// What one completion round produced.
#[derive(Debug, Default)]
struct RoundState {
    content: String,
    tool_calls: BTreeMap<u32, PendingToolCall>,
    done: bool,
}

impl RoundState {
    fn into_tool_calls(self) -> (String, Vec<ChatToolCall>) {
        let calls = self
            .tool_calls
            .into_iter()
            .map(|(index, call)| ChatToolCall {
                id: call.id.unwrap_or_else(|| format!("tool-call-{index}")),
                kind: "function".to_string(),
                function: ChatToolCallFunction {
                    name: call.name.unwrap_or_else(|| "unknown".to_string()),
                    arguments: call.arguments.trim().to_string(),
                },
            })
            .collect();
        (self.content, calls)
    }
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

fn handle_data_payload(
    payload: &str,
    state: &mut RoundState,
) -> Result<Vec<StreamMessage>, StreamFailure> {
    if payload == "[DONE]" {
        state.done = true;
        return Ok(Vec::new());
    }
    if payload.trim().is_empty() {
        return Ok(Vec::new());
    }

    let response = match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => response,
        Err(_) => {
            warn!(summary = %summarize_api_error(payload), "Provider reported a stream error");
            return Err(StreamFailure::new("completion provider stream error"));
        }
    };

    let mut events = Vec::new();
    let Some(choice) = response.choices.into_iter().next() else {
        return Ok(events);
    };

    if let Some(reasoning) = choice.delta.reasoning.filter(|text| !text.is_empty()) {
        events.push(StreamMessage::Reasoning(reasoning));
    }
    if let Some(content) = choice.delta.content.filter(|text| !text.is_empty()) {
        state.content.push_str(&content);
        events.push(StreamMessage::Chunk(content));
    }
    for delta in choice.delta.tool_calls.unwrap_or_default() {
        let entry = state
            .tool_calls
            .entry(delta.index.unwrap_or(0))
            .or_default();
        if delta.id.is_some() {
            entry.id = delta.id;
        }
        if let Some(function) = delta.function {
            if function.name.is_some() {
                entry.name = function.name;
            }
            if let Some(arguments) = function.arguments {
                entry.arguments.push_str(&arguments);
            }
        }
    }
    Ok(events)
}

fn process_sse_line(
    line: &str,
    state: &mut RoundState,
) -> Result<Vec<StreamMessage>, StreamFailure> {
    match extract_data_payload(line) {
        Some(payload) => handle_data_payload(payload, state),
        None => Ok(Vec::new()),
    }
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                serde_json::Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

/// One-line description of an upstream error body, for logs only.
fn summarize_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&json_value).filter(|s| !s.is_empty()) {
            return summary;
        }
    }

    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > 200 {
        let mut short: String = collapsed.chars().take(200).collect();
        short.push('…');
        return short;
    }
    collapsed
}

async fn emit(
    sink: &mpsc::Sender<StreamMessage>,
    message: StreamMessage,
) -> Result<(), StreamFailure> {
    sink.send(message)
        .await
        .map_err(|_| StreamFailure::new("response stream closed"))
}

/// OpenRouter-compatible chat completions client.
#[derive(Clone)]
pub struct OpenRouterStreamer {
    client: reqwest::Client,
    base_url: String,
    app_name: String,
    referer: Option<String>,
    max_tool_steps: usize,
}

impl OpenRouterStreamer {
    pub fn new(config: &ProviderConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(PROVIDER_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: &ProviderConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.clone(),
            app_name: config.app_name.clone(),
            referer: config.referer.clone(),
            max_tool_steps: config.max_tool_steps,
        }
    }

    async fn run(
        &self,
        request: CompletionRequest,
        tools: &ToolSet,
        sink: &mpsc::Sender<StreamMessage>,
    ) -> Result<(), StreamFailure> {
        let definitions = tools.definitions();
        let reasoning = request
            .reasoning
            .then_some(ReasoningOptions { enabled: true });
        let mut messages = request.messages;
        let mut step = 0;

        loop {
            let offer_tools = !definitions.is_empty() && step < self.max_tool_steps;
            let body = ChatRequest {
                model: request.model.clone(),
                messages: messages.clone(),
                stream: true,
                tools: offer_tools.then(|| definitions.clone()),
                reasoning: reasoning.clone(),
            };

            let (content, calls) = self
                .stream_round(&request.api_key, &body, sink)
                .await?
                .into_tool_calls();

            if calls.is_empty() {
                break;
            }
            if !offer_tools {
                warn!(
                    model = %request.model,
                    steps = step,
                    "Tool step limit reached; ignoring further tool calls"
                );
                break;
            }
            step += 1;

            let mut assistant = ChatMessage::new(ROLE_ASSISTANT, content);
            assistant.tool_calls = Some(calls.clone());
            messages.push(assistant);

            for call in calls {
                let name = call.function.name.clone();
                emit(
                    sink,
                    StreamMessage::ToolCall(ToolCallEvent {
                        id: call.id.clone(),
                        name: name.clone(),
                        arguments: call.function.arguments.clone(),
                    }),
                )
                .await?;

                let (model_content, client_content, is_error) =
                    match tools.call(&name, &call.function.arguments).await {
                        Ok(text) => (text.clone(), text, false),
                        Err(err) => {
                            warn!(tool = %name, error = %err, "Tool call failed");
                            (
                                format!("Tool call failed: {err}"),
                                "Tool call failed.".to_string(),
                                true,
                            )
                        }
                    };

                emit(
                    sink,
                    StreamMessage::ToolResult(ToolResultEvent {
                        id: call.id.clone(),
                        name: name.clone(),
                        content: client_content,
                        is_error,
                    }),
                )
                .await?;
                messages.push(ChatMessage::tool_result(&call.id, &name, model_content));
            }
        }

        emit(sink, StreamMessage::End).await
    }

    async fn stream_round(
        &self,
        api_key: &str,
        body: &ChatRequest,
        sink: &mpsc::Sender<StreamMessage>,
    ) -> Result<RoundState, StreamFailure> {
        let chat_url = construct_api_url(&self.base_url, "chat/completions");
        let mut http_request = self
            .client
            .post(chat_url)
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(api_key)
            .header("X-Title", &self.app_name);
        if let Some(referer) = &self.referer {
            http_request = http_request.header("HTTP-Referer", referer);
        }

        let response = http_request.json(body).send().await.map_err(|err| {
            warn!(error = %err.without_url(), "Completion request failed");
            StreamFailure::new("completion request failed")
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            warn!(
                status = status.as_u16(),
                summary = %summarize_api_error(&error_text),
                "Completion provider rejected the request"
            );
            return Err(StreamFailure::new(format!(
                "completion provider returned {}",
                status.as_u16()
            )));
        }

        let mut state = RoundState::default();
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk_bytes = chunk.map_err(|err| {
                warn!(error = %err.without_url(), "Completion stream interrupted");
                StreamFailure::new("completion stream interrupted")
            })?;
            buffer.extend_from_slice(&chunk_bytes);

            while let Some(newline_pos) = memchr(b'\n', &buffer) {
                let events = match std::str::from_utf8(&buffer[..newline_pos]) {
                    Ok(line) => process_sse_line(line.trim(), &mut state)?,
                    Err(err) => {
                        debug!(error = %err, "Invalid UTF-8 in completion stream");
                        Vec::new()
                    }
                };
                buffer.drain(..=newline_pos);
                for event in events {
                    emit(sink, event).await?;
                }
                if state.done {
                    return Ok(state);
                }
            }
        }

        if let Ok(line) = std::str::from_utf8(&buffer) {
            for event in process_sse_line(line.trim(), &mut state)? {
                emit(sink, event).await?;
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl CompletionStreamer for OpenRouterStreamer {
    async fn stream(
        &self,
        request: CompletionRequest,
        tools: Arc<ToolSet>,
        sink: mpsc::Sender<StreamMessage>,
        cancel: CancellationToken,
    ) -> Result<(), StreamFailure> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Completion stream cancelled");
                Ok(())
            }
            result = self.run(request, &tools, &sink) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::FakeConnection;
    use crate::mcp::transport::McpTransportKind;
    use crate::utils::test_utils::{sample_tool, should_skip_httpmock};
    use httpmock::Method::POST;
    use httpmock::MockServer;

    fn provider(base_url: &str, max_tool_steps: usize) -> OpenRouterStreamer {
        OpenRouterStreamer::with_client(
            reqwest::Client::new(),
            &ProviderConfig {
                base_url: base_url.to_string(),
                app_name: "Chatwire Test".to_string(),
                referer: Some("https://chat.example".to_string()),
                max_tool_steps,
            },
        )
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            api_key: "sk-test".to_string(),
            model: "test/model".to_string(),
            messages: vec![ChatMessage::new("user", "hi")],
            reasoning: false,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<StreamMessage>) -> Vec<StreamMessage> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn process_sse_line_handles_spacing_variants() {
        for (line, expected) in [
            (r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#, "Hello"),
            (r#"data:{"choices":[{"delta":{"content":"World"}}]}"#, "World"),
        ] {
            let mut state = RoundState::default();
            let events = process_sse_line(line, &mut state).expect("events");
            assert_eq!(events, vec![StreamMessage::Chunk(expected.to_string())]);
            assert_eq!(state.content, expected);
        }

        for done in ["data: [DONE]", "data:[DONE]"] {
            let mut state = RoundState::default();
            assert!(process_sse_line(done, &mut state).expect("done").is_empty());
            assert!(state.done);
        }

        let mut state = RoundState::default();
        assert!(process_sse_line(": OPENROUTER PROCESSING", &mut state)
            .expect("comment")
            .is_empty());
    }

    #[test]
    fn process_sse_line_routes_stream_errors() {
        let mut state = RoundState::default();
        let err = process_sse_line(
            r#"data: {"error":{"message":"internal server error"}}"#,
            &mut state,
        )
        .expect_err("error payload");
        assert!(!err.to_string().contains("internal server error"));
    }

    #[test]
    fn tool_call_deltas_accumulate_by_index() {
        let mut state = RoundState::default();
        for line in [
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"echo","arguments":"{\"te"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_2","function":{"name":"search","arguments":""}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"xt\":\"hi\"}"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ] {
            process_sse_line(line, &mut state).expect("delta");
        }

        let (_, calls) = state.into_tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "echo");
        assert_eq!(calls[0].function.arguments, r#"{"text":"hi"}"#);
        assert_eq!(calls[1].function.name, "search");
    }

    #[test]
    fn summarize_api_error_prefers_message() {
        assert_eq!(
            summarize_api_error(r#"{"error":{"message":"model   overloaded","type":"x"}}"#),
            "model overloaded"
        );
        assert_eq!(summarize_api_error(r#"{"error":"quota"}"#), "quota");
        assert_eq!(summarize_api_error("  "), "<empty>");
        assert_eq!(summarize_api_error("api failure"), "api failure");
    }

    #[test]
    fn stream_messages_serialize_with_type_tag() {
        let value = serde_json::to_value(StreamMessage::Chunk("hi".to_string())).expect("json");
        assert_eq!(value, serde_json::json!({"type": "chunk", "data": "hi"}));
        let value = serde_json::to_value(StreamMessage::End).expect("json");
        assert_eq!(value, serde_json::json!({"type": "end"}));
    }

    #[tokio::test]
    async fn streams_text_until_done() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v1/chat/completions")
                    .header("authorization", "Bearer sk-test")
                    .header("x-title", "Chatwire Test")
                    .body_includes("\"stream\":true");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(concat!(
                        ": OPENROUTER PROCESSING\n\n",
                        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
                        "data: [DONE]\n\n"
                    ));
            })
            .await;

        let (tx, rx) = mpsc::channel(16);
        provider(&server.url("/api/v1"), 4)
            .stream(request(), Arc::new(ToolSet::default()), tx, CancellationToken::new())
            .await
            .expect("stream");

        mock.assert_async().await;
        assert_eq!(
            drain(rx).await,
            vec![
                StreamMessage::Chunk("Hel".to_string()),
                StreamMessage::Chunk("lo".to_string()),
                StreamMessage::End,
            ]
        );
    }

    #[tokio::test]
    async fn upstream_rejection_is_a_generic_failure() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(402)
                    .header("content-type", "application/json")
                    .body(r#"{"error":{"message":"insufficient credits for key sk-test"}}"#);
            })
            .await;

        let (tx, rx) = mpsc::channel(16);
        let err = provider(&server.url("/v1"), 4)
            .stream(request(), Arc::new(ToolSet::default()), tx, CancellationToken::new())
            .await
            .expect_err("should fail");
        assert!(!err.to_string().contains("sk-test"));
        assert!(drain(rx).await.is_empty());
    }

    #[tokio::test]
    async fn executes_tool_calls_and_continues() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        let first = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .body_includes("\"tools\":[")
                    .body_excludes("\"role\":\"tool\"");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(concat!(
                        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"echo\",\"arguments\":\"{}\"}}]}}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
                        "data: [DONE]\n\n"
                    ));
            })
            .await;
        let second = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .body_includes("\"role\":\"tool\"")
                    .body_includes("srv:echo");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body("data: {\"choices\":[{\"delta\":{\"content\":\"done\"}}]}\n\ndata: [DONE]\n\n");
            })
            .await;

        let connection = Arc::new(
            FakeConnection::new(McpTransportKind::StreamableHttp)
                .labelled("srv")
                .with_tools(vec![sample_tool("echo")]),
        );
        let mut tools = ToolSet::default();
        tools.insert("srv", sample_tool("echo"), connection.clone());

        let (tx, rx) = mpsc::channel(16);
        provider(&server.url("/v1"), 4)
            .stream(request(), Arc::new(tools), tx, CancellationToken::new())
            .await
            .expect("stream");

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(connection.call_names(), vec!["echo"]);

        let events = drain(rx).await;
        assert!(matches!(&events[0], StreamMessage::ToolCall(call) if call.name == "echo"));
        assert!(matches!(
            &events[1],
            StreamMessage::ToolResult(result) if result.content == "srv:echo" && !result.is_error
        ));
        assert_eq!(events[2], StreamMessage::Chunk("done".to_string()));
        assert_eq!(events[3], StreamMessage::End);
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::channel(1);
        let result = provider("http://127.0.0.1:9", 1)
            .stream(request(), Arc::new(ToolSet::default()), tx, cancel)
            .await;
        assert!(result.is_ok());
    }
}
