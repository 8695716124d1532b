//! Admin tools: token-gated registry mutation.
//!
//! `admin.register_server`, `admin.unregister_server`, and
//! `admin.list_servers` are served next to the aggregated tools. Every call
//! returns a structured JSON result; nothing here raises to the caller.
//!
//! Register and unregister run under the gateway's admin lock, so the
//! read → mutate → rebuild → persist sequence never interleaves with another
//! admin call.

use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use super::errors::GatewayError;
use super::Gateway;
use crate::mcp_client::{CallToolResult, ServerEntry, ServerEntryRecord, Tool};

pub const LIST_SERVERS: &str = "admin.list_servers";
pub const REGISTER_SERVER: &str = "admin.register_server";
pub const UNREGISTER_SERVER: &str = "admin.unregister_server";

const TOKEN_FIELD: &str = "admin_token";

pub fn is_admin_tool(name: &str) -> bool {
    matches!(name, LIST_SERVERS | REGISTER_SERVER | UNREGISTER_SERVER)
}

/// Tool definitions for the three admin operations.
pub fn admin_tools() -> Vec<Tool> {
    let token = json!({"type": "string", "description": "Admin secret, if one is configured"});
    let string_map = json!({"type": "object", "additionalProperties": {"type": "string"}});

    vec![
        Tool {
            name: LIST_SERVERS.into(),
            description: Some("List registered servers on the gateway".into()),
            input_schema: json!({
                "type": "object",
                "properties": {TOKEN_FIELD: token},
            }),
            meta: None,
        },
        Tool {
            name: REGISTER_SERVER.into(),
            description: Some("Register or update a downstream MCP server".into()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    TOKEN_FIELD: token,
                    "id": {"type": "string", "description": "Unique server id"},
                    "type": {
                        "type": "string",
                        "enum": ["stdio", "sse", "streamable-http"],
                        "default": "stdio"
                    },
                    "command": {"type": "string", "description": "Command for stdio servers"},
                    "args": {"type": "array", "items": {"type": "string"}, "description": "Args for stdio command"},
                    "env": string_map,
                    "url": {"type": "string", "description": "URL for sse/streamable-http"},
                    "headers": string_map,
                },
                "required": ["id"],
            }),
            meta: None,
        },
        Tool {
            name: UNREGISTER_SERVER.into(),
            description: Some("Unregister a downstream MCP server".into()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    TOKEN_FIELD: token,
                    "id": {"type": "string", "description": "Server id to remove"},
                },
                "required": ["id"],
            }),
            meta: None,
        },
    ]
}

// ─── Authorization ───────────────────────────────────────────────────────────

/// Shared-secret gate. Open when no secret is configured.
///
/// Only a SHA-256 digest of the secret is kept; tokens are compared by digest.
#[derive(Clone)]
pub struct AdminGate {
    digest: Option<[u8; 32]>,
}

impl AdminGate {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            digest: secret.filter(|s| !s.is_empty()).map(digest),
        }
    }

    pub fn is_open(&self) -> bool {
        self.digest.is_none()
    }

    pub fn check(&self, token: Option<&str>) -> Result<(), GatewayError> {
        let Some(expected) = &self.digest else {
            return Ok(());
        };
        match token {
            Some(token) if digest(token) == *expected => Ok(()),
            _ => Err(GatewayError::Unauthorized),
        }
    }
}

impl std::fmt::Debug for AdminGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminGate")
            .field("open", &self.is_open())
            .finish()
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

/// Pull the token out of the arguments and drop null-valued fields.
///
/// An absent, null, or empty token is "no token", not a type error.
fn split_token(args: Value) -> Result<(Option<String>, Map<String, Value>), GatewayError> {
    let mut map = match args {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        _ => {
            return Err(GatewayError::Validation(
                "arguments must be an object".into(),
            ))
        }
    };

    let token = match map.remove(TOKEN_FIELD) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            return Err(GatewayError::Validation(format!(
                "'{TOKEN_FIELD}' must be a string"
            )))
        }
    };

    map.retain(|_, v| !v.is_null());
    Ok((token, map))
}

// ─── Results ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminStatus {
    Ok,
    Error,
}

/// `{status, message}` returned by register and unregister.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminResult {
    pub status: AdminStatus,
    pub message: String,
}

impl AdminResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: AdminStatus::Ok,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AdminStatus::Error,
            message: message.into(),
        }
    }

    pub fn into_call_result(self) -> CallToolResult {
        let is_error = self.status == AdminStatus::Error;
        json_result(&self, is_error)
    }
}

impl From<Result<String, GatewayError>> for AdminResult {
    fn from(result: Result<String, GatewayError>) -> Self {
        match result {
            Ok(message) => AdminResult::ok(message),
            Err(e) => AdminResult::error(e.to_string()),
        }
    }
}

fn json_result<T: Serialize>(value: &T, is_error: bool) -> CallToolResult {
    let text = serde_json::to_string(value).unwrap_or_else(|e| {
        format!(r#"{{"status":"error","message":"failed to encode result: {e}"}}"#)
    });
    if is_error {
        CallToolResult::error_text(text)
    } else {
        CallToolResult::text(text)
    }
}

// ─── Operations ──────────────────────────────────────────────────────────────

impl Gateway {
    /// Serve one admin tool call.
    pub async fn call_admin(&self, name: &str, args: Value) -> CallToolResult {
        let (token, args) = match split_token(args) {
            Ok(split) => split,
            Err(e) => return AdminResult::error(e.to_string()).into_call_result(),
        };

        if let Err(e) = self.gate.check(token.as_deref()) {
            tracing::warn!(tool = name, "rejected admin call with bad token");
            return AdminResult::error(e.to_string()).into_call_result();
        }

        match name {
            LIST_SERVERS => json_result(&json!({"servers": self.list_servers().await}), false),
            REGISTER_SERVER => {
                let result = match serde_json::from_value::<ServerEntryRecord>(Value::Object(args)) {
                    Ok(record) => self.register(record).await,
                    Err(e) => Err(GatewayError::Validation(format!("invalid arguments: {e}"))),
                };
                AdminResult::from(result).into_call_result()
            }
            UNREGISTER_SERVER => {
                let result = match args.get("id").and_then(Value::as_str) {
                    Some(id) if !id.trim().is_empty() => self.unregister(id.trim()).await,
                    _ => Err(GatewayError::Validation("missing required field 'id'".into())),
                };
                AdminResult::from(result).into_call_result()
            }
            other => AdminResult::error(format!("unknown admin tool '{other}'")).into_call_result(),
        }
    }

    /// Current registry as flat records.
    pub async fn list_servers(&self) -> Vec<ServerEntryRecord> {
        self.registry.read().await.to_records()
    }

    /// Register or replace a server.
    ///
    /// Validation happens before any connection attempt. An existing
    /// connection for the id is torn down first. The durable registry is
    /// written only after the new connection is verified, and the new tools
    /// are published only after that write succeeds. On any failure the
    /// in-memory registry returns to what the file says.
    pub async fn register(&self, record: ServerEntryRecord) -> Result<String, GatewayError> {
        let entry = ServerEntry::try_from(record)?;
        let id = entry.id.clone();

        let _admin = self.admin_lock.lock().await;
        tracing::info!(server = %id, kind = %entry.kind(), "registering server");

        if let Some(old) = self.connections.detach(&id).await {
            self.rebuild_catalog().await;
            tracing::info!(server = %id, "replacing existing connection");
            let _ = old.close().await;
        }

        let previous = self.registry.write().await.upsert(entry.clone());

        let conn = match self
            .connections
            .connect_within(&entry, Some(self.register_timeout))
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(server = %id, error = %e, "registration failed, rolling back");
                self.restore_entry(&id, previous).await;
                return Err(e);
            }
        };

        let tool_count = conn.tools.len();
        self.connections.attach(conn).await;

        let snapshot = self.registry.read().await.clone();
        if let Err(e) = self.store.persist(&snapshot) {
            tracing::error!(server = %id, error = %e, "failed to persist registry, rolling back");
            if let Some(conn) = self.connections.detach(&id).await {
                let _ = conn.close().await;
            }
            self.restore_entry(&id, previous).await;
            return Err(e);
        }

        self.rebuild_catalog().await;
        tracing::info!(server = %id, tools = tool_count, "server registered");
        Ok(format!("Registered {id} with {tool_count} tools"))
    }

    /// Put back the entry `id` had before a failed registration (or drop it).
    async fn restore_entry(&self, id: &str, previous: Option<ServerEntry>) {
        {
            let mut registry = self.registry.write().await;
            match previous {
                Some(previous) => {
                    registry.upsert(previous);
                }
                None => {
                    registry.remove(id);
                }
            }
        }
        self.rebuild_catalog().await;
    }

    /// Remove a server from the registry and disconnect it.
    ///
    /// The durable registry is written first; memory changes only if that
    /// write succeeds.
    pub async fn unregister(&self, id: &str) -> Result<String, GatewayError> {
        let _admin = self.admin_lock.lock().await;

        let remaining = {
            let registry = self.registry.read().await;
            if !registry.contains(id) {
                return Err(GatewayError::ServerNotFound(id.to_string()));
            }
            registry.without(id)
        };

        self.store.persist(&remaining)?;

        let conn = self.connections.detach(id).await;
        *self.registry.write().await = remaining;
        self.rebuild_catalog().await;

        if let Some(conn) = conn {
            let _ = conn.close().await;
        }

        tracing::info!(server = id, "server unregistered");
        Ok(format!("Unregistered {id}"))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
