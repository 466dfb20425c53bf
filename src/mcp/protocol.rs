//! JSON-RPC message construction and result parsing shared by both transports.

use crate::mcp::error::TransportError;
use crate::mcp::transport::http::MCP_PROTOCOL_VERSION;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{
    CallToolResult, ClientCapabilities, Implementation, InitializeRequestParams, InitializeResult,
    ListToolsResult, PaginatedRequestParams, RequestId, RpcError,
};
use serde::Serialize;
use serde_json::Value;

/// JSON-RPC code used by servers to indicate an unsupported method.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

pub fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "chatwire".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Chatwire MCP Client".to_string()),
            description: Some("Chatwire chat backend tool bridge".to_string()),
            icons: Vec::new(),
            website_url: Some("https://github.com/permacommons/chatwire".to_string()),
        },
        meta: None,
        protocol_version: MCP_PROTOCOL_VERSION.to_string(),
    }
}

pub fn request_message(id: i64, request: RequestFromClient) -> Result<ClientMessage, TransportError> {
    ClientMessage::from_message(
        MessageFromClient::RequestFromClient(request),
        Some(RequestId::Integer(id)),
    )
    .map_err(|err| TransportError::other(err.to_string()))
}

pub fn initialized_notification() -> Result<ClientMessage, TransportError> {
    ClientMessage::from_message(
        MessageFromClient::NotificationFromClient(NotificationFromClient::InitializedNotification(
            None,
        )),
        None,
    )
    .map_err(|err| TransportError::other(err.to_string()))
}

pub fn paginated_params(cursor: Option<String>) -> Option<PaginatedRequestParams> {
    cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    })
}

pub fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, TransportError> {
    let value = parse_response_value(message)?;
    let result = serde_json::from_value::<InitializeResult>(value)
        .map_err(|err| TransportError::other(err.to_string()))?;
    if result.protocol_version.trim().is_empty() {
        return Err(TransportError::other("Unexpected initialize response."));
    }
    Ok(result)
}

/// `Ok(None)` means the server does not implement `tools/list`.
pub fn parse_list_tools(message: ServerMessage) -> Result<Option<ListToolsResult>, TransportError> {
    if is_method_not_found(&message) {
        return Ok(None);
    }
    parse_response(message).map(Some)
}

pub fn parse_call_tool(message: ServerMessage) -> Result<CallToolResult, TransportError> {
    parse_response(message)
}

fn parse_response<T: serde::de::DeserializeOwned>(
    message: ServerMessage,
) -> Result<T, TransportError> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<T>(value).map_err(|err| TransportError::other(err.to_string()))
}

pub fn parse_response_value(message: ServerMessage) -> Result<Value, TransportError> {
    match message {
        ServerMessage::Response(response) => serde_json::to_value(&response.result)
            .map_err(|err| TransportError::other(err.to_string())),
        ServerMessage::Error(error) => Err(TransportError::other(format_rpc_error(&error.error))),
        other => Err(TransportError::other(format!(
            "Unexpected MCP server message: {other:?}"
        ))),
    }
}

pub fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error(error) if error.error.code == MCP_METHOD_NOT_FOUND
    )
}

pub fn format_rpc_error(error: &RpcError) -> String {
    let mut output = format!("MCP error {}: {}", error.code, error.message);
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string(data).ok());

        if let Some(details) = details {
            if !details.is_empty() {
                output.push('\n');
                output.push_str(&details);
            }
        }
    }
    output
}

/// Tool results are handed to the model as pretty-printed JSON.
pub fn serialize_mcp_result<T: Serialize>(result: &T) -> String {
    serde_json::to_string_pretty(result)
        .unwrap_or_else(|_| "Unable to serialize MCP result.".to_string())
}
