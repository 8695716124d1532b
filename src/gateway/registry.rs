//! Registry of downstream servers: the ordered in-memory form and the
//! durable JSON file it is loaded from and persisted to.
//!
//! File shape: `{"servers": [ {id, type, command?, args?, env?, url?, headers?}, … ]}`.
//! Order in the file is insertion order, which is also catalog order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::errors::GatewayError;
use crate::mcp_client::{ServerEntry, ServerEntryRecord};

// ─── In-memory Registry ──────────────────────────────────────────────────────

/// Ordered mapping `id → ServerEntry`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    entries: Vec<ServerEntry>,
}

impl Registry {
    /// Build a registry, rejecting duplicate ids.
    pub fn from_entries(entries: Vec<ServerEntry>) -> Result<Self, GatewayError> {
        let mut registry = Registry::default();
        for entry in entries {
            if registry.contains(&entry.id) {
                return Err(GatewayError::Registry(format!(
                    "duplicate server id '{}'",
                    entry.id
                )));
            }
            registry.entries.push(entry);
        }
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<&ServerEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Insert or replace. A replaced id keeps its position; a new id is appended.
    /// Returns the previous entry, if any.
    pub fn upsert(&mut self, entry: ServerEntry) -> Option<ServerEntry> {
        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(slot) => Some(std::mem::replace(slot, entry)),
            None => {
                self.entries.push(entry);
                None
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<ServerEntry> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Copy of this registry without `id`.
    pub fn without(&self, id: &str) -> Registry {
        Registry {
            entries: self.entries.iter().filter(|e| e.id != id).cloned().collect(),
        }
    }

    pub fn entries(&self) -> &[ServerEntry] {
        &self.entries
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flat records in registry order, as persisted and as listed to admins.
    pub fn to_records(&self) -> Vec<ServerEntryRecord> {
        self.entries.iter().map(ServerEntryRecord::from).collect()
    }
}

// ─── Durable Store ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    servers: Vec<ServerEntryRecord>,
}

/// Loads and atomically rewrites the registry file.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory relative pipe paths are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Load the registry. A missing file is an empty registry; a malformed
    /// file or an invalid entry is an error.
    pub fn load(&self) -> Result<Registry, GatewayError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "registry file not found, starting empty");
                return Ok(Registry::default());
            }
            Err(e) => {
                return Err(GatewayError::Registry(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };

        let file: RegistryFile = serde_json::from_str(&raw).map_err(|e| {
            GatewayError::Registry(format!("failed to parse {}: {e}", self.path.display()))
        })?;

        let entries = file
            .servers
            .into_iter()
            .map(|record| {
                ServerEntry::try_from(record).map_err(|e| {
                    GatewayError::Registry(format!("invalid entry in {}: {e}", self.path.display()))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let registry = Registry::from_entries(entries)?;
        tracing::debug!(path = %self.path.display(), servers = registry.len(), "registry loaded");
        Ok(registry)
    }

    /// Rewrite the whole file: write a sibling temp file, then rename over the
    /// target. On failure the previous file is left untouched.
    pub fn persist(&self, registry: &Registry) -> Result<(), GatewayError> {
        let file = RegistryFile {
            servers: registry.to_records(),
        };
        let mut json = serde_json::to_string_pretty(&file)
            .map_err(|e| GatewayError::Registry(format!("failed to serialize registry: {e}")))?;
        json.push('\n');

        let dir = self.base_dir();
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "registry.json".into());
        let tmp_path = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        if let Err(e) = std::fs::write(&tmp_path, json) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(GatewayError::Registry(format!(
                "failed to write {}: {e}",
                tmp_path.display()
            )));
        }
        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(GatewayError::Registry(format!(
                "failed to replace {}: {e}",
                self.path.display()
            )));
        }

        tracing::debug!(path = %self.path.display(), servers = registry.len(), "registry persisted");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
