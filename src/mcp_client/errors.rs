//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur while talking to a downstream MCP server.
#[derive(Debug, Error)]
pub enum McpError {
    /// A pipe server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// A network transport could not be opened (refused, bad status, no endpoint).
    #[error("failed to connect to server '{server}': {reason}")]
    ConnectFailed {
        server: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A response arrived but its payload did not have the expected shape.
    #[error("invalid response from server '{server}': {reason}")]
    InvalidResponse {
        server: String,
        reason: String,
    },

    /// The transport was closed (explicitly or because the peer went away).
    #[error("transport for server '{server}' is closed")]
    Closed {
        server: String,
    },
}

impl McpError {
    /// Whether this error means the underlying connection is no longer usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            McpError::TransportError { .. } | McpError::Closed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_server_name() {
        let err = McpError::SpawnFailed {
            name: "calc".into(),
            reason: "No such file or directory".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to spawn server 'calc': No such file or directory"
        );
    }

    #[test]
    fn test_is_fatal() {
        assert!(McpError::Closed { server: "a".into() }.is_fatal());
        assert!(!McpError::ServerError {
            code: -32601,
            message: "nope".into(),
            data: None,
        }
        .is_fatal());
    }
}
