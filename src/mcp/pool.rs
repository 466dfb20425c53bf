//! Request-scoped ownership of live MCP connections.

use crate::mcp::negotiator::ConnectionAttempt;
use crate::utils::url::log_host;
use futures_util::future::join_all;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Connections opened for one chat turn. Every registered connection is
/// closed exactly once, by [`ConnectionPool::close_all`] or on drop.
#[derive(Debug)]
pub struct ConnectionPool {
    attempts: Vec<ConnectionAttempt>,
    close_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(close_timeout: Duration) -> Self {
        Self {
            attempts: Vec::new(),
            close_timeout,
        }
    }

    pub fn register(&mut self, attempt: ConnectionAttempt) {
        debug!(
            server_id = %attempt.server_id,
            transport = %attempt.transport_kind,
            "Registered MCP connection"
        );
        self.attempts.push(attempt);
    }

    /// Live connections in registration order.
    pub fn live(&self) -> &[ConnectionAttempt] {
        &self.attempts
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Closes and removes every connection. Failures are logged and never
    /// stop the remaining closes.
    pub async fn close_all(&mut self) {
        let attempts = std::mem::take(&mut self.attempts);
        if attempts.is_empty() {
            return;
        }
        close_attempts(attempts, self.close_timeout).await;
    }
}

async fn close_attempts(attempts: Vec<ConnectionAttempt>, close_timeout: Duration) {
    let closes = attempts.iter().map(|attempt| async move {
        match timeout(close_timeout, attempt.client.close()).await {
            Ok(Ok(())) => {
                debug!(server_id = %attempt.server_id, "Closed MCP connection");
            }
            Ok(Err(err)) => {
                warn!(
                    server_id = %attempt.server_id,
                    host = %log_host(&attempt.canonical_url),
                    error = %err,
                    "Failed to close MCP connection"
                );
            }
            Err(_) => {
                warn!(
                    server_id = %attempt.server_id,
                    host = %log_host(&attempt.canonical_url),
                    "Timed out closing MCP connection"
                );
            }
        }
    });
    join_all(closes).await;
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if self.attempts.is_empty() {
            return;
        }
        let attempts = std::mem::take(&mut self.attempts);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_attempts(attempts, self.close_timeout));
            }
            Err(_) => {
                warn!(
                    count = attempts.len(),
                    "Dropping MCP connections outside a runtime; they will not be closed"
                );
            }
        }
    }
}
