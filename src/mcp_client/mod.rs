//! MCP Client: sessions with downstream MCP servers.
//!
//! This module handles:
//! - JSON-RPC 2.0 message types and the MCP payloads the gateway uses
//! - Server entries: the typed, validated description of one downstream
//! - Three transports: stdio pipe, SSE push-stream, streamable HTTP
//! - The `Session` / `TransportFactory` seam the gateway connects through

pub mod entry;
pub mod errors;
pub mod http;
pub mod lifecycle;
pub mod session;
pub mod sse;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use entry::{InvalidEntry, ServerEntry, ServerEntryRecord, TransportKind, TransportSpec};
pub use errors::McpError;
pub use session::{McpSession, McpTransportFactory, Session, Transport, TransportFactory};
pub use types::{CallToolResult, Tool};
