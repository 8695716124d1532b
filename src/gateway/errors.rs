//! Gateway error types.

use std::fmt;

use thiserror::Error;

use crate::mcp_client::{InvalidEntry, McpError};

/// Which step of a connect was running when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    Connecting,
    Initializing,
    Listing,
}

impl fmt::Display for ConnectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectPhase::Connecting => "connecting",
            ConnectPhase::Initializing => "initializing",
            ConnectPhase::Listing => "listing",
        })
    }
}

/// Errors surfaced by gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Downstream unreachable, refused, or timed out during a connect phase.
    #[error("failed to connect to server '{server_id}' while {phase}: {reason}")]
    Connection {
        server_id: String,
        phase: ConnectPhase,
        reason: String,
    },

    /// Missing or invalid entry fields, unsupported transport kind, bad arguments.
    #[error("{0}")]
    Validation(String),

    /// Wrong or missing admin token while a secret is configured.
    #[error("unauthorized")]
    Unauthorized,

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    /// The routing table points at a server with no live session.
    #[error("no session for server '{0}'")]
    NoSession(String),

    /// The downstream call itself failed; carries the downstream's own text.
    #[error("{0}")]
    UpstreamTool(String),

    #[error("server '{0}' not found")]
    ServerNotFound(String),

    /// Reading or writing the durable registry file failed.
    #[error("registry error: {0}")]
    Registry(String),
}

impl From<InvalidEntry> for GatewayError {
    fn from(e: InvalidEntry) -> Self {
        GatewayError::Validation(e.reason)
    }
}

impl GatewayError {
    /// Wrap a failed downstream tool call.
    pub fn upstream(err: McpError) -> Self {
        match err {
            // A JSON-RPC error from the peer is reported in its own words.
            McpError::ServerError { message, .. } => GatewayError::UpstreamTool(message),
            other => GatewayError::UpstreamTool(other.to_string()),
        }
    }
}

// ─── Teardown ────────────────────────────────────────────────────────────────

/// A session that failed to close cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to close server '{server_id}': {reason}")]
pub struct CloseError {
    pub server_id: String,
    pub reason: String,
}

/// Outcome of closing a set of sessions. Never fatal.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub closed: Vec<String>,
    pub failures: Vec<CloseError>,
}

impl ShutdownReport {
    pub fn record(&mut self, server_id: &str, result: Result<(), CloseError>) {
        match result {
            Ok(()) => self.closed.push(server_id.to_string()),
            Err(e) => self.failures.push(e),
        }
    }

    pub fn merge(&mut self, other: ShutdownReport) {
        self.closed.extend(other.closed);
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_names_server_and_phase() {
        let err = GatewayError::Connection {
            server_id: "calc".into(),
            phase: ConnectPhase::Initializing,
            reason: "timed out after 10s".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to connect to server 'calc' while initializing: timed out after 10s"
        );
    }

    #[test]
    fn test_upstream_keeps_downstream_text() {
        let err = GatewayError::upstream(McpError::ServerError {
            code: -32000,
            message: "division by zero".into(),
            data: None,
        });
        assert_eq!(err.to_string(), "division by zero");
    }

    #[test]
    fn test_shutdown_report_aggregates() {
        let mut report = ShutdownReport::default();
        report.record("a", Ok(()));
        report.record(
            "b",
            Err(CloseError {
                server_id: "b".into(),
                reason: "broken pipe".into(),
            }),
        );
        assert_eq!(report.closed, vec!["a".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.is_clean());
    }
}
