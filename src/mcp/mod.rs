//! MCP tool servers: transport negotiation, per-request connection
//! ownership and tool aggregation.

pub mod aggregator;
pub mod auth;
pub mod error;
pub mod negotiator;
pub mod pool;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::{aggregate, ToolCallError, ToolSet};
pub use negotiator::{ConnectionAttempt, NegotiationOutcome, Negotiator, SkipReason};
pub use pool::ConnectionPool;
