//! Downstream server entries: the typed form used to open transports and the
//! flat record form stored in the registry file.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server ids that would collide with the gateway's own tool names.
const RESERVED_IDS: &[&str] = &["admin"];

// ─── Transport Kind ──────────────────────────────────────────────────────────

/// The three downstream transport kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Subprocess speaking newline-delimited JSON-RPC over stdin/stdout.
    #[serde(rename = "stdio", alias = "pipe")]
    Pipe,
    /// Server-push event stream with a POST endpoint (legacy SSE transport).
    #[serde(rename = "sse", alias = "push-stream")]
    PushStream,
    /// Bidirectional HTTP stream (MCP streamable HTTP).
    #[serde(rename = "streamable-http", alias = "http-stream")]
    HttpStream,
}

impl TransportKind {
    /// Wire name used in the registry file and in tool metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Pipe => "stdio",
            TransportKind::PushStream => "sse",
            TransportKind::HttpStream => "streamable-http",
        }
    }

    /// Parse a wire name or one of its aliases.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stdio" | "pipe" => Some(TransportKind::Pipe),
            "sse" | "push-stream" => Some(TransportKind::PushStream),
            "streamable-http" | "http-stream" => Some(TransportKind::HttpStream),
            _ => None,
        }
    }

    /// Whether peers of this kind have a network address a client could reach.
    pub fn is_network(self) -> bool {
        match self {
            TransportKind::Pipe => false,
            TransportKind::PushStream | TransportKind::HttpStream => true,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Typed Entry ─────────────────────────────────────────────────────────────

/// Transport-specific parameters of a server entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSpec {
    Pipe {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    PushStream {
        url: String,
        headers: BTreeMap<String, String>,
    },
    HttpStream {
        url: String,
        headers: BTreeMap<String, String>,
    },
}

/// A validated downstream server entry. Replaced wholesale on re-registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub id: String,
    pub transport: TransportSpec,
}

impl ServerEntry {
    pub fn kind(&self) -> TransportKind {
        match self.transport {
            TransportSpec::Pipe { .. } => TransportKind::Pipe,
            TransportSpec::PushStream { .. } => TransportKind::PushStream,
            TransportSpec::HttpStream { .. } => TransportKind::HttpStream,
        }
    }

    /// Network address of the peer, for stream kinds.
    pub fn url(&self) -> Option<&str> {
        match &self.transport {
            TransportSpec::Pipe { .. } => None,
            TransportSpec::PushStream { url, .. } | TransportSpec::HttpStream { url, .. } => {
                Some(url)
            }
        }
    }

    /// Resolve relative pipe paths against `base_dir`.
    ///
    /// The command and each argument are rewritten only when `base_dir/<path>`
    /// exists on disk, so bare command tokens (`python3`, `-m`) pass through.
    pub fn resolved_against(&self, base_dir: &Path) -> ServerEntry {
        let TransportSpec::Pipe { command, args, env } = &self.transport else {
            return self.clone();
        };

        ServerEntry {
            id: self.id.clone(),
            transport: TransportSpec::Pipe {
                command: resolve_path_arg(command, base_dir),
                args: args.iter().map(|a| resolve_path_arg(a, base_dir)).collect(),
                env: env.clone(),
            },
        }
    }
}

fn resolve_path_arg(arg: &str, base_dir: &Path) -> String {
    let path = Path::new(arg);
    if arg.is_empty() || path.is_absolute() {
        return arg.to_string();
    }
    let candidate = base_dir.join(path);
    if !candidate.exists() {
        return arg.to_string();
    }
    candidate
        .canonicalize()
        .unwrap_or(candidate)
        .to_string_lossy()
        .into_owned()
}

// ─── Flat Record ─────────────────────────────────────────────────────────────

/// Validation failure for a server entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct InvalidEntry {
    pub reason: String,
}

impl InvalidEntry {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

fn default_type() -> String {
    TransportKind::Pipe.as_str().to_string()
}

/// Flat, serializable form of a server entry, as stored in the registry file
/// and accepted by `admin.register_server`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntryRecord {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl TryFrom<ServerEntryRecord> for ServerEntry {
    type Error = InvalidEntry;

    fn try_from(record: ServerEntryRecord) -> Result<Self, Self::Error> {
        let id = record.id.trim().to_string();
        if id.is_empty() {
            return Err(InvalidEntry::new("missing required field 'id'"));
        }
        if id.contains('.') {
            return Err(InvalidEntry::new(format!(
                "server id '{id}' must not contain '.' (used as the namespace separator)"
            )));
        }
        if RESERVED_IDS.contains(&id.as_str()) {
            return Err(InvalidEntry::new(format!("server id '{id}' is reserved")));
        }

        let kind = TransportKind::parse(record.kind.trim()).ok_or_else(|| {
            InvalidEntry::new(format!("unsupported server type: '{}'", record.kind))
        })?;

        let transport = match kind {
            TransportKind::Pipe => {
                let command = record
                    .command
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| InvalidEntry::new("'command' is required for stdio servers"))?;
                TransportSpec::Pipe {
                    command,
                    args: record.args,
                    env: record.env,
                }
            }
            TransportKind::PushStream | TransportKind::HttpStream => {
                let url = validate_url(&id, kind, record.url)?;
                if kind == TransportKind::PushStream {
                    TransportSpec::PushStream {
                        url,
                        headers: record.headers,
                    }
                } else {
                    TransportSpec::HttpStream {
                        url,
                        headers: record.headers,
                    }
                }
            }
        };

        Ok(ServerEntry { id, transport })
    }
}

fn validate_url(id: &str, kind: TransportKind, url: Option<String>) -> Result<String, InvalidEntry> {
    let missing = || InvalidEntry::new(format!("server '{id}' missing valid 'url' for {kind}"));
    let url = url.map(|u| u.trim().to_string()).ok_or_else(missing)?;
    if !url.starts_with("http") {
        return Err(missing());
    }
    reqwest::Url::parse(&url)
        .map_err(|e| InvalidEntry::new(format!("server '{id}' has invalid url '{url}': {e}")))?;
    Ok(url)
}

impl From<&ServerEntry> for ServerEntryRecord {
    fn from(entry: &ServerEntry) -> Self {
        let mut record = ServerEntryRecord {
            id: entry.id.clone(),
            kind: entry.kind().as_str().to_string(),
            ..Default::default()
        };
        match &entry.transport {
            TransportSpec::Pipe { command, args, env } => {
                record.command = Some(command.clone());
                record.args = args.clone();
                record.env = env.clone();
            }
            TransportSpec::PushStream { url, headers } | TransportSpec::HttpStream { url, headers } => {
                record.url = Some(url.clone());
                record.headers = headers.clone();
            }
        }
        record
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
