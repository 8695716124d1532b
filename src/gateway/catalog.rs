//! Tool aggregation: namespaced descriptors and the merged catalog.
//!
//! Every downstream tool is exposed as `"<server_id>.<tool>"` with a
//! [`RoutingMeta`] block attached under `_meta`. The catalog is rebuilt from
//! scratch in registry order whenever membership changes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::mcp_client::{ServerEntry, Tool, TransportKind};

/// Separator between server id and tool name.
pub const NAMESPACE_SEPARATOR: char = '.';

pub fn namespaced_name(server_id: &str, tool: &str) -> String {
    format!("{server_id}{NAMESPACE_SEPARATOR}{tool}")
}

// ─── Routing Metadata ────────────────────────────────────────────────────────

/// Routing contract attached to each aggregated tool.
///
/// Field names are part of the wire contract with routing clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingMeta {
    pub server_id: String,
    pub server_type: TransportKind,
    pub original_name: String,
    pub direct_call_allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
}

impl RoutingMeta {
    /// Metadata for `original_name` served by `entry`.
    ///
    /// Direct calls are allowed only for network kinds with a URL.
    pub fn for_entry(entry: &ServerEntry, original_name: &str) -> Self {
        let kind = entry.kind();
        let server_url = entry.url().map(str::to_string);
        Self {
            server_id: entry.id.clone(),
            server_type: kind,
            original_name: original_name.to_string(),
            direct_call_allowed: kind.is_network() && server_url.is_some(),
            server_url,
        }
    }

    /// Parse the `_meta` block of a listed tool. `None` when absent or not ours.
    pub fn from_tool(tool: &Tool) -> Option<Self> {
        let meta = tool.meta.as_ref()?;
        serde_json::from_value(meta.clone()).ok()
    }
}

// ─── Tool Descriptor ─────────────────────────────────────────────────────────

/// One aggregated tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub namespaced_name: String,
    pub original_name: String,
    pub server_id: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
    pub routing: RoutingMeta,
}

impl ToolDescriptor {
    pub fn namespace(entry: &ServerEntry, tool: Tool) -> Self {
        Self {
            namespaced_name: namespaced_name(&entry.id, &tool.name),
            routing: RoutingMeta::for_entry(entry, &tool.name),
            server_id: entry.id.clone(),
            original_name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
        }
    }

    /// The tool as served to gateway callers, metadata under `_meta`.
    pub fn to_tool(&self) -> Tool {
        Tool {
            name: self.namespaced_name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
            meta: serde_json::to_value(&self.routing).ok(),
        }
    }
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

/// Merged catalog plus the routing table `namespaced_name → descriptor`.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tools: Vec<ToolDescriptor>,
    routes: HashMap<String, usize>,
}

impl Catalog {
    /// Concatenate per-server descriptor lists in the order given.
    ///
    /// Deterministic for the same input. If a server lists the same tool
    /// twice, the first one wins.
    pub fn rebuild<'a>(groups: impl IntoIterator<Item = &'a [ToolDescriptor]>) -> Self {
        let mut catalog = Catalog::default();
        for group in groups {
            for descriptor in group {
                if catalog.routes.contains_key(&descriptor.namespaced_name) {
                    tracing::warn!(tool = %descriptor.namespaced_name, "duplicate tool name, keeping first");
                    continue;
                }
                catalog
                    .routes
                    .insert(descriptor.namespaced_name.clone(), catalog.tools.len());
                catalog.tools.push(descriptor.clone());
            }
        }
        catalog
    }

    /// Look up a namespaced tool.
    pub fn route(&self, name: &str) -> Option<&ToolDescriptor> {
        self.routes.get(name).map(|&i| &self.tools[i])
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.namespaced_name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Number of catalog entries owned by `server_id`.
    pub fn tools_for_server(&self, server_id: &str) -> usize {
        self.tools.iter().filter(|t| t.server_id == server_id).count()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
