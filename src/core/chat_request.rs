//! Inbound chat-turn payload and its validation.

use crate::api::{ChatMessage, ROLE_ASSISTANT, ROLE_SYSTEM, ROLE_TOOL, ROLE_USER};
use crate::core::error::ChatError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

/// Raw request body; fields stay loosely typed so each one can be validated
/// into the matching error instead of a blanket deserialization failure.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurnBody {
    #[serde(default)]
    pub messages: Value,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub reasoning: Option<bool>,
    #[serde(default)]
    pub mcp_servers: Option<Value>,
}

/// How a static API key is transmitted to an MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeaderScheme {
    AuthorizationBearer,
    XApiKey,
}

/// Credential family to prefer when an entry carries both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthPreference {
    Oauth,
    ApiKey,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_scheme: Option<HeaderScheme>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_preference: Option<AuthPreference>,
}

impl McpServerEntry {
    pub fn access_token(&self) -> Option<&str> {
        non_blank(self.access_token.as_deref())
    }

    pub fn api_key(&self) -> Option<&str> {
        non_blank(self.api_key.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

impl fmt::Debug for McpServerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpServerEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("enabled", &self.enabled)
            .field("access_token", &self.access_token().map(|_| "<redacted>"))
            .field("api_key", &self.api_key().map(|_| "<redacted>"))
            .field("header_scheme", &self.header_scheme)
            .field("auth_preference", &self.auth_preference)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
    Tool,
}

impl TurnRole {
    fn as_str(self) -> &'static str {
        match self {
            TurnRole::System => ROLE_SYSTEM,
            TurnRole::User => ROLE_USER,
            TurnRole::Assistant => ROLE_ASSISTANT,
            TurnRole::Tool => ROLE_TOOL,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text {
        text: String,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl TurnContent {
    pub fn text(&self) -> String {
        match self {
            TurnContent::Text(text) => text.clone(),
            TurnContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Unsupported => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMessage {
    pub role: TurnRole,
    #[serde(alias = "parts")]
    pub content: TurnContent,
    #[serde(default, alias = "tool_call_id")]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl TurnMessage {
    pub fn to_chat_message(&self) -> ChatMessage {
        let mut message = ChatMessage::new(self.role.as_str(), self.content.text());
        message.name = self.name.clone();
        if self.role == TurnRole::Tool {
            message.tool_call_id = self.tool_call_id.clone();
        }
        message
    }
}

/// A chat turn whose input has passed validation.
#[derive(Debug, Clone)]
pub struct ChatTurnRequest {
    pub model: String,
    pub messages: Vec<TurnMessage>,
    pub reasoning: bool,
    pub mcp_servers: Vec<McpServerEntry>,
}

impl ChatTurnRequest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ChatError> {
        let body: ChatTurnBody =
            serde_json::from_slice(bytes).map_err(|err| ChatError::InvalidBody(err.to_string()))?;
        Self::validate(body)
    }

    pub fn validate(body: ChatTurnBody) -> Result<Self, ChatError> {
        let model = body
            .model
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty())
            .ok_or(ChatError::MissingModel)?;

        let messages = parse_messages(body.messages)?;
        let mcp_servers = parse_server_entries(body.mcp_servers);

        Ok(Self {
            model,
            messages,
            reasoning: body.reasoning.unwrap_or(false),
            mcp_servers,
        })
    }

    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(TurnMessage::to_chat_message).collect()
    }
}

fn parse_messages(value: Value) -> Result<Vec<TurnMessage>, ChatError> {
    if !value.is_array() {
        return Err(ChatError::InvalidMessages(
            "messages must be an array".to_string(),
        ));
    }
    let messages: Vec<TurnMessage> = serde_json::from_value(value)
        .map_err(|err| ChatError::InvalidMessages(err.to_string()))?;
    if messages.is_empty() {
        return Err(ChatError::InvalidMessages(
            "messages must not be empty".to_string(),
        ));
    }
    Ok(messages)
}

/// Entries are parsed one at a time; a malformed entry is dropped with a
/// warning and never fails the turn.
fn parse_server_entries(value: Option<Value>) -> Vec<McpServerEntry> {
    let items = match value {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => {
            warn!("Ignoring mcpServers: expected an array");
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<McpServerEntry>(item) {
            Ok(entry) => {
                if !seen.insert(entry.id.clone()) {
                    warn!(server_id = %entry.id, "Duplicate MCP server id in request");
                }
                entries.push(entry);
            }
            Err(err) => {
                warn!(index, error = %err, "Skipping malformed MCP server entry");
            }
        }
    }
    entries
}
