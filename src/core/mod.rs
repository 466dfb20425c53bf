pub mod chat_request;
pub mod chat_stream;
pub mod config;
pub mod credentials;
pub mod error;
pub mod orchestrator;
