//! MCP sessions over any of the three transports.
//!
//! [`Session`] is the capability the gateway consumes: handshake, tool
//! listing, tool invocation, teardown. [`TransportFactory`] turns a
//! [`ServerEntry`] into a live session; [`McpTransportFactory`] is the real
//! one, tests plug in their own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::entry::{ServerEntry, TransportKind, TransportSpec};
use super::errors::McpError;
use super::http::HttpTransport;
use super::lifecycle::{format_stderr_suffix, spawn_pipe};
use super::sse::SseTransport;
use super::transport::{extract_result, StdioTransport};
use super::types::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcResponse,
    ListToolsParams, ListToolsResult, Tool,
};

/// Upper bound on `tools/list` pages, against servers that loop their cursor.
const MAX_LIST_PAGES: usize = 64;

// ─── Traits ──────────────────────────────────────────────────────────────────

/// A protocol session with one downstream server.
#[async_trait]
pub trait Session: Send + Sync {
    /// Id of the server this session talks to.
    fn server_id(&self) -> &str;

    /// Run the `initialize` handshake and send `notifications/initialized`.
    async fn initialize(&self) -> Result<InitializeResult, McpError>;

    /// All tools the server advertises, following pagination.
    async fn list_tools(&self) -> Result<Vec<Tool>, McpError>;

    /// Invoke a tool by its downstream (un-namespaced) name.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError>;

    /// Release the transport. Safe to call more than once.
    async fn close(&self) -> Result<(), McpError>;
}

/// Opens sessions for server entries.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Establish the transport for `entry`. The session is not yet initialized.
    async fn open(&self, entry: &ServerEntry) -> Result<Arc<dyn Session>, McpError>;
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// The three transport kinds a session can run over.
pub enum Transport {
    Pipe(StdioTransport),
    PushStream(SseTransport),
    HttpStream(HttpTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Pipe(_) => TransportKind::Pipe,
            Transport::PushStream(_) => TransportKind::PushStream,
            Transport::HttpStream(_) => TransportKind::HttpStream,
        }
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        match self {
            Transport::Pipe(t) => t.request(method, params).await,
            Transport::PushStream(t) => t.request(method, params).await,
            Transport::HttpStream(t) => t.request(method, params).await,
        }
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        match self {
            Transport::Pipe(t) => t.notify(method, params).await,
            Transport::PushStream(t) => t.notify(method, params).await,
            Transport::HttpStream(t) => t.notify(method, params).await,
        }
    }

    async fn close(&self, grace: Duration) -> Result<(), McpError> {
        match self {
            Transport::Pipe(t) => t.close(grace).await,
            Transport::PushStream(t) => {
                t.close();
                Ok(())
            }
            Transport::HttpStream(t) => t.close().await,
        }
    }
}

// ─── McpSession ──────────────────────────────────────────────────────────────

/// [`Session`] implementation speaking MCP over a [`Transport`].
pub struct McpSession {
    server_id: String,
    transport: Transport,
    shutdown_grace: Duration,
}

impl McpSession {
    pub fn new(server_id: &str, transport: Transport, shutdown_grace: Duration) -> Self {
        Self {
            server_id: server_id.to_string(),
            transport,
            shutdown_grace,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, McpError> {
        let resp = self.transport.request(method, Some(params)).await;
        let value = match resp {
            Ok(resp) => extract_result(resp)?,
            Err(e) => return Err(self.with_stderr_context(e).await),
        };
        serde_json::from_value(value).map_err(|e| McpError::InvalidResponse {
            server: self.server_id.clone(),
            reason: format!("unexpected {method} result: {e}"),
        })
    }

    /// A pipe server that died usually said why on stderr.
    async fn with_stderr_context(&self, err: McpError) -> McpError {
        match (&self.transport, err) {
            (Transport::Pipe(pipe), McpError::TransportError { server, reason }) => {
                let tail = pipe.stderr_tail().await;
                McpError::TransportError {
                    server,
                    reason: format!("{reason}{}", format_stderr_suffix(&tail)),
                }
            }
            (_, err) => err,
        }
    }
}

#[async_trait]
impl Session for McpSession {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn initialize(&self) -> Result<InitializeResult, McpError> {
        let params = serde_json::to_value(InitializeParams::for_this_client()).map_err(|e| {
            McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("failed to serialize initialize params: {e}"),
            }
        })?;
        let result: InitializeResult = self.call("initialize", params).await?;

        if let Transport::HttpStream(http) = &self.transport {
            if !result.protocol_version.is_empty() {
                http.set_protocol_version(&result.protocol_version);
            }
        }

        self.transport
            .notify("notifications/initialized", None)
            .await?;

        tracing::debug!(
            server = %self.server_id,
            protocol = %result.protocol_version,
            peer = ?result.server_info.as_ref().map(|i| &i.name),
            "session initialized"
        );
        Ok(result)
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = serde_json::to_value(ListToolsParams {
                cursor: cursor.clone(),
            })
            .unwrap_or_else(|_| serde_json::json!({}));
            let page: ListToolsResult = self.call("tools/list", params).await?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => return Ok(tools),
            }
        }

        tracing::warn!(server = %self.server_id, pages = MAX_LIST_PAGES, "tools/list pagination truncated");
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        let params = serde_json::to_value(params).map_err(|e| McpError::TransportError {
            server: self.server_id.clone(),
            reason: format!("failed to serialize tool arguments: {e}"),
        })?;
        self.call("tools/call", params).await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.transport.close(self.shutdown_grace).await
    }
}

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Opens real transports: spawns pipe servers, dials network servers.
#[derive(Debug, Clone)]
pub struct McpTransportFactory {
    shutdown_grace: Duration,
}

impl McpTransportFactory {
    pub fn new(shutdown_grace: Duration) -> Self {
        Self { shutdown_grace }
    }
}

#[async_trait]
impl TransportFactory for McpTransportFactory {
    async fn open(&self, entry: &ServerEntry) -> Result<Arc<dyn Session>, McpError> {
        let transport = match &entry.transport {
            TransportSpec::Pipe { command, args, env } => {
                Transport::Pipe(spawn_pipe(&entry.id, command, args, env)?)
            }
            TransportSpec::PushStream { url, headers } => {
                Transport::PushStream(SseTransport::connect(&entry.id, url, headers).await?)
            }
            TransportSpec::HttpStream { url, headers } => {
                Transport::HttpStream(HttpTransport::new(&entry.id, url, headers)?)
            }
        };

        tracing::debug!(server = %entry.id, kind = %transport.kind(), "transport opened");
        Ok(Arc::new(McpSession::new(
            &entry.id,
            transport,
            self.shutdown_grace,
        )))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
