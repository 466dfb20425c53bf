//! Structured failures raised by MCP transports.
//!
//! The negotiator decides whether to fall back to the legacy event-stream
//! transport by looking at [`TransportErrorKind`], which is filled in where
//! the HTTP status is first observed.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    NotFound,
    MethodNotAllowed,
    AuthError,
    NetworkError,
    Timeout,
    Other,
}

impl TransportErrorKind {
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::NOT_FOUND => Self::NotFound,
            StatusCode::METHOD_NOT_ALLOWED => Self::MethodNotAllowed,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::AuthError,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not-found",
            Self::MethodNotAllowed => "method-not-allowed",
            Self::AuthError => "auth-error",
            Self::NetworkError => "network-error",
            Self::Timeout => "timeout",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /// Builds an error from a non-success HTTP response status and body excerpt.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let reason = status.canonical_reason().unwrap_or("Unknown status");
        let excerpt = body.trim();
        let message = if excerpt.is_empty() {
            format!("HTTP error: {} {reason}", status.as_u16())
        } else {
            format!(
                "HTTP error: {} {reason}: {}",
                status.as_u16(),
                truncate(excerpt, 200)
            )
        };
        Self {
            kind: TransportErrorKind::from_status(status),
            status: Some(status.as_u16()),
            message,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NetworkError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }

    /// True when the failure signature says the streamable endpoint does not exist.
    pub fn allows_legacy_fallback(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::NotFound | TransportErrorKind::MethodNotAllowed
        )
    }

    pub fn is_auth_error(&self) -> bool {
        self.kind == TransportErrorKind::AuthError
    }

    /// Some servers answer an initialize that carries a session id with a 400
    /// mentioning the session; this only feeds a log hint.
    pub fn mentions_session_rejection(&self) -> bool {
        self.status == Some(StatusCode::BAD_REQUEST.as_u16())
            && self.message.to_ascii_lowercase().contains("session")
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        // Request URLs may carry credentials in the query string.
        let err = err.without_url();
        if let Some(status) = err.status() {
            return Self {
                kind: TransportErrorKind::from_status(status),
                status: Some(status.as_u16()),
                message: err.to_string(),
            };
        }
        if err.is_timeout() {
            return Self::timeout(err.to_string());
        }
        if err.is_connect() || err.is_request() || err.is_body() {
            return Self::network(err.to_string());
        }
        Self::other(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TransportError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("MCP operation timed out")
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
