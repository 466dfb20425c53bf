//! Per-attempt authentication header selection for MCP servers.

use crate::core::chat_request::{AuthPreference, HeaderScheme, McpServerEntry};
use crate::mcp::transport::http::{
    MCP_JSON_AND_SSE_ACCEPT, MCP_PROTOCOL_VERSION, MCP_PROTOCOL_VERSION_HEADER, MCP_SSE_ACCEPT,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use std::fmt;
use tracing::warn;

pub const X_API_KEY_HEADER: HeaderName = HeaderName::from_static("x-api-key");

/// Scheme actually used for a connection attempt. Safe to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLabel {
    Bearer,
    XApiKey,
    None,
}

impl AuthLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthLabel::Bearer => "bearer",
            AuthLabel::XApiKey => "x-api-key",
            AuthLabel::None => "none",
        }
    }
}

impl fmt::Display for AuthLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AuthHeader {
    pub name: HeaderName,
    pub value: String,
}

impl fmt::Debug for AuthHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthHeader")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// At most one auth header, plus the label describing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSelection {
    pub header: Option<AuthHeader>,
    pub label: AuthLabel,
}

impl AuthSelection {
    fn none() -> Self {
        Self {
            header: None,
            label: AuthLabel::None,
        }
    }

    fn bearer(token: &str) -> Self {
        Self {
            header: Some(AuthHeader {
                name: AUTHORIZATION,
                value: format!("Bearer {token}"),
            }),
            label: AuthLabel::Bearer,
        }
    }

    fn api_key(key: &str, scheme: Option<HeaderScheme>) -> Self {
        match scheme {
            Some(HeaderScheme::XApiKey) => Self {
                header: Some(AuthHeader {
                    name: X_API_KEY_HEADER,
                    value: key.to_string(),
                }),
                label: AuthLabel::XApiKey,
            },
            _ => Self::bearer(key),
        }
    }

    /// Headers for the streamable-HTTP transport.
    pub fn streamable_headers(&self) -> HeaderMap {
        self.headers_with_accept(MCP_JSON_AND_SSE_ACCEPT)
    }

    /// Headers for the legacy event-stream transport.
    pub fn sse_headers(&self) -> HeaderMap {
        self.headers_with_accept(MCP_SSE_ACCEPT)
    }

    fn headers_with_accept(&self, accept: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(accept));
        headers.insert(
            MCP_PROTOCOL_VERSION_HEADER,
            HeaderValue::from_static(MCP_PROTOCOL_VERSION),
        );

        if let Some(header) = &self.header {
            // select_auth only hands out values that are valid header values.
            if let Ok(mut value) = HeaderValue::from_str(&header.value) {
                value.set_sensitive(true);
                headers.insert(header.name.clone(), value);
            }
        }
        headers
    }
}

/// Picks the single auth header for an entry, in fixed precedence order.
pub fn select_auth(entry: &McpServerEntry) -> AuthSelection {
    let token = entry.access_token();
    let key = entry.api_key();

    let selection = match (entry.auth_preference, token, key) {
        (Some(AuthPreference::Oauth), Some(token), _) => AuthSelection::bearer(token),
        (Some(AuthPreference::ApiKey), _, Some(key)) => {
            AuthSelection::api_key(key, entry.header_scheme)
        }
        (_, Some(token), _) => AuthSelection::bearer(token),
        (_, None, Some(key)) => AuthSelection::api_key(key, entry.header_scheme),
        (_, None, None) => AuthSelection::none(),
    };

    let sendable = selection
        .header
        .as_ref()
        .map_or(true, |header| HeaderValue::from_str(&header.value).is_ok());
    if sendable {
        return selection;
    }
    warn!(
        server_id = %entry.id,
        auth = %selection.label,
        "MCP credential is not a valid header value; connecting without auth"
    );
    AuthSelection::none()
}
