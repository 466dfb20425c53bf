//! Chatwire is a chat backend that streams OpenRouter completions and lets
//! the model call tools served by remote MCP servers.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] negotiates a transport per MCP server, owns the request's
//!   connection pool, and merges every server's tools into one catalogue.
//! - [`core`] validates chat turns, resolves the sealed provider credential,
//!   and drives the streaming completion with its tool-call loop.
//! - [`server`] exposes the turn over HTTP as server-sent events.
//! - [`api`] defines the chat payloads exchanged with the provider.
//!
//! The binary routes through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod mcp;
pub mod server;
pub mod utils;
