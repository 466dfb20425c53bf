use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Failures a chat turn can surface to the caller.
///
/// `Display` is for logs; the body sent to clients always comes from
/// [`ChatError::public_message`], which never includes upstream detail.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request body is not valid JSON: {0}")]
    InvalidBody(String),
    #[error("model is missing or empty")]
    MissingModel,
    #[error("messages are malformed: {0}")]
    InvalidMessages(String),
    #[error("no provider credential available")]
    Unauthenticated,
    #[error("server misconfigured: {0}")]
    ServerMisconfigured(String),
    #[error("stream failed: {0}")]
    StreamFailure(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ChatError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::InvalidBody(_) | ChatError::MissingModel | ChatError::InvalidMessages(_) => {
                StatusCode::BAD_REQUEST
            }
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::ServerMisconfigured(_) | ChatError::StreamFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn public_message(&self) -> &'static str {
        match self {
            ChatError::InvalidBody(_) => "Invalid request body",
            ChatError::MissingModel => "Model is required",
            ChatError::InvalidMessages(_) => "Messages are invalid",
            ChatError::Unauthenticated => "Not connected to OpenRouter",
            ChatError::ServerMisconfigured(_) => "Server is misconfigured",
            ChatError::StreamFailure(_) => "Failed to generate a response",
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.public_message().to_string(),
        }
    }
}
