//! Gateway: one merged, namespaced tool catalog over many downstream servers.
//!
//! A [`Gateway`] is constructed explicitly from a [`GatewayConfig`] and a
//! [`TransportFactory`], then handed by reference to whatever serves it.
//! It holds:
//! - the in-memory [`Registry`] and its durable [`RegistryStore`]
//! - the [`ConnectionManager`] with one live session per connected server
//! - the merged [`Catalog`] and routing table
//!
//! Admin mutations (register / unregister) are serialized by `admin_lock`.
//! Tool calls take only short read locks and never wait on an admin call's
//! downstream I/O.

pub mod admin;
pub mod catalog;
pub mod connection;
pub mod dispatch;
pub mod errors;
pub mod registry;
pub mod routing;


use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::config::GatewayConfig;
use crate::mcp_client::{Tool, TransportFactory};

pub use admin::{AdminGate, AdminResult, AdminStatus};
pub use catalog::{Catalog, RoutingMeta, ToolDescriptor};
pub use connection::{ActiveConnection, ConnectionManager};
pub use errors::{CloseError, ConnectPhase, GatewayError, ShutdownReport};
pub use registry::{Registry, RegistryStore};
pub use routing::{Route, RoutingClient, RoutingDecider};

/// Outcome of the startup connect pass.
#[derive(Debug, Default)]
pub struct BulkConnectReport {
    pub connected: Vec<String>,
    pub failed: Vec<(String, GatewayError)>,
}

impl BulkConnectReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Gateway {
    store: RegistryStore,
    registry: RwLock<Registry>,
    connections: ConnectionManager,
    catalog: RwLock<Catalog>,
    admin_lock: Mutex<()>,
    gate: AdminGate,
    register_timeout: Duration,
    call_timeout: Duration,
}

impl Gateway {
    /// Load the registry file and prepare (but do not connect) the gateway.
    ///
    /// A malformed registry file is an error; a missing one is an empty registry.
    pub fn new(
        config: &GatewayConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, GatewayError> {
        let store = RegistryStore::new(&config.registry_path);
        let registry = store.load()?;
        let connections =
            ConnectionManager::new(factory, store.base_dir(), config.timeouts.connect());

        Ok(Self {
            store,
            registry: RwLock::new(registry),
            connections,
            catalog: RwLock::new(Catalog::default()),
            admin_lock: Mutex::new(()),
            gate: AdminGate::new(config.admin_token.as_deref()),
            register_timeout: config.timeouts.register(),
            call_timeout: config.timeouts.call(),
        })
    }

    /// Connect every registry entry, one at a time, then build the catalog.
    ///
    /// A failing server is logged and skipped; its entry stays in the
    /// registry but contributes no tools.
    pub async fn start(&self) -> BulkConnectReport {
        let _admin = self.admin_lock.lock().await;
        let entries = self.registry.read().await.entries().to_vec();

        let mut report = BulkConnectReport::default();
        for entry in &entries {
            match self.connections.connect(entry).await {
                Ok(conn) => {
                    self.connections.attach(conn).await;
                    report.connected.push(entry.id.clone());
                }
                Err(e) => {
                    tracing::error!(server = %entry.id, error = %e, "failed to connect server at startup");
                    report.failed.push((entry.id.clone(), e));
                }
            }
        }

        self.rebuild_catalog().await;
        tracing::info!(
            servers = report.connected.len(),
            failed = report.failed.len(),
            tools = self.catalog.read().await.len(),
            "gateway started"
        );
        report
    }

    /// Rebuild the catalog from live connections in registry order.
    async fn rebuild_catalog(&self) {
        let order = self.registry.read().await.ids();
        let groups = self.connections.tools_in_order(&order).await;
        let catalog = Catalog::rebuild(groups.iter().map(Vec::as_slice));
        tracing::debug!(tools = catalog.len(), "catalog rebuilt");
        *self.catalog.write().await = catalog;
    }

    /// Snapshot of the merged catalog.
    pub async fn catalog(&self) -> Catalog {
        self.catalog.read().await.clone()
    }

    /// Everything the gateway serves: aggregated tools, then the admin tools.
    pub async fn list_tools(&self) -> Vec<Tool> {
        let catalog = self.catalog.read().await;
        let mut tools: Vec<Tool> = catalog.tools().iter().map(ToolDescriptor::to_tool).collect();
        if let Some(sample) = catalog.tools().first() {
            tracing::debug!(tool = %sample.namespaced_name, meta = ?sample.routing, "catalog metadata sample");
        }
        tools.extend(admin::admin_tools());
        tools
    }

    /// Current in-memory registry.
    pub async fn registry(&self) -> Registry {
        self.registry.read().await.clone()
    }

    pub fn registry_path(&self) -> &std::path::Path {
        self.store.path()
    }

    /// Close every downstream session. Failures are collected, not raised.
    pub async fn shutdown(&self) -> ShutdownReport {
        let _admin = self.admin_lock.lock().await;
        let report = self.connections.shutdown_all().await;
        *self.catalog.write().await = Catalog::default();
        for failure in &report.failures {
            tracing::warn!(server = %failure.server_id, reason = %failure.reason, "close failed during shutdown");
        }
        report
    }
}
