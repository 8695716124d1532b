//! Connection manager: owns the live session for each connected server.
//!
//! `connect` drives one server through open → initialize → list, each phase
//! bounded by the connect timeout. A connect that fails after the transport
//! was opened closes it before returning; a connect that is cancelled drops
//! it, which kills pipe children and aborts stream readers.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use super::catalog::ToolDescriptor;
use super::errors::{CloseError, ConnectPhase, GatewayError, ShutdownReport};
use crate::mcp_client::{McpError, ServerEntry, Session, TransportFactory, TransportKind};

// ─── ActiveConnection ────────────────────────────────────────────────────────

/// A server that completed its handshake and tool listing.
pub struct ActiveConnection {
    pub server_id: String,
    pub kind: TransportKind,
    pub session: Arc<dyn Session>,
    pub tools: Vec<ToolDescriptor>,
}

impl ActiveConnection {
    /// Close the session, reporting (not raising) a failure.
    pub async fn close(self) -> Result<(), CloseError> {
        let result = self.session.close().await.map_err(|e| CloseError {
            server_id: self.server_id.clone(),
            reason: e.to_string(),
        });
        match &result {
            Ok(()) => tracing::debug!(server = %self.server_id, "session closed"),
            Err(e) => tracing::warn!(server = %self.server_id, error = %e, "session close failed"),
        }
        result
    }
}

impl std::fmt::Debug for ActiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveConnection")
            .field("server_id", &self.server_id)
            .field("kind", &self.kind)
            .field("tools", &self.tools.len())
            .finish()
    }
}

// ─── ConnectionManager ───────────────────────────────────────────────────────

pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    /// Relative pipe paths resolve against this (the registry file's directory).
    base_dir: PathBuf,
    connect_timeout: Duration,
    active: RwLock<HashMap<String, ActiveConnection>>,
}

impl ConnectionManager {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        base_dir: PathBuf,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            base_dir,
            connect_timeout,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Open, initialize, and list one server. The result is not yet attached.
    pub async fn connect(&self, entry: &ServerEntry) -> Result<ActiveConnection, GatewayError> {
        self.connect_within(entry, None).await
    }

    /// Like [`connect`](Self::connect), with every phase also bounded by an
    /// overall `budget` for the whole sequence.
    pub async fn connect_within(
        &self,
        entry: &ServerEntry,
        budget: Option<Duration>,
    ) -> Result<ActiveConnection, GatewayError> {
        let deadline = budget.map(|b| Instant::now() + b);
        let resolved = entry.resolved_against(&self.base_dir);
        tracing::info!(server = %entry.id, kind = %entry.kind(), "connecting to server");

        let session = self
            .bounded(
                &entry.id,
                ConnectPhase::Connecting,
                deadline,
                self.factory.open(&resolved),
            )
            .await?;

        let listed = async {
            self.bounded(
                &entry.id,
                ConnectPhase::Initializing,
                deadline,
                session.initialize(),
            )
            .await?;
            self.bounded(&entry.id, ConnectPhase::Listing, deadline, session.list_tools())
                .await
        }
        .await;

        let tools = match listed {
            Ok(tools) => tools,
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    tracing::debug!(server = %entry.id, error = %close_err, "close after failed connect");
                }
                return Err(e);
            }
        };

        let tools: Vec<ToolDescriptor> = tools
            .into_iter()
            .map(|tool| ToolDescriptor::namespace(entry, tool))
            .collect();

        for tool in &tools {
            tracing::debug!(
                tool = %tool.namespaced_name,
                server_type = %tool.routing.server_type,
                direct_call_allowed = tool.routing.direct_call_allowed,
                server_url = tool.routing.server_url.as_deref().unwrap_or(""),
                "routing metadata"
            );
        }
        tracing::info!(server = %entry.id, tools = tools.len(), "server connected");

        Ok(ActiveConnection {
            server_id: entry.id.clone(),
            kind: entry.kind(),
            session,
            tools,
        })
    }

    /// Run one phase under the connect timeout, shortened to the deadline.
    async fn bounded<T>(
        &self,
        server_id: &str,
        phase: ConnectPhase,
        deadline: Option<Instant>,
        fut: impl Future<Output = Result<T, McpError>>,
    ) -> Result<T, GatewayError> {
        let limit = match deadline {
            Some(deadline) => self
                .connect_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.connect_timeout,
        };

        match tokio::time::timeout(limit, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(GatewayError::Connection {
                server_id: server_id.to_string(),
                phase,
                reason: e.to_string(),
            }),
            Err(_) => Err(GatewayError::Connection {
                server_id: server_id.to_string(),
                phase,
                reason: format!("timed out after {:.1}s", limit.as_secs_f32()),
            }),
        }
    }

    /// Make a connection live. Returns the connection it replaced, if any.
    pub async fn attach(&self, conn: ActiveConnection) -> Option<ActiveConnection> {
        self.active.write().await.insert(conn.server_id.clone(), conn)
    }

    /// Take a connection out of service without closing it.
    pub async fn detach(&self, server_id: &str) -> Option<ActiveConnection> {
        self.active.write().await.remove(server_id)
    }

    /// Detach and close. Idempotent; a close failure is returned, never raised.
    pub async fn disconnect(&self, server_id: &str) -> Result<(), CloseError> {
        match self.detach(server_id).await {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }

    /// Live session for `server_id`, cloned out so no lock is held during a call.
    pub async fn session(&self, server_id: &str) -> Option<Arc<dyn Session>> {
        self.active
            .read()
            .await
            .get(server_id)
            .map(|c| Arc::clone(&c.session))
    }

    pub async fn is_active(&self, server_id: &str) -> bool {
        self.active.read().await.contains_key(server_id)
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.active.read().await.keys().cloned().collect()
    }

    /// Descriptor lists of the live servers among `order`, in that order.
    pub async fn tools_in_order(&self, order: &[String]) -> Vec<Vec<ToolDescriptor>> {
        let active = self.active.read().await;
        order
            .iter()
            .filter_map(|id| active.get(id).map(|c| c.tools.clone()))
            .collect()
    }

    /// Close every connection, continuing past failures.
    pub async fn shutdown_all(&self) -> ShutdownReport {
        let drained: Vec<ActiveConnection> = self.active.write().await.drain().map(|(_, c)| c).collect();

        let mut report = ShutdownReport::default();
        for conn in drained {
            let id = conn.server_id.clone();
            report.record(&id, conn.close().await);
        }
        tracing::info!(
            closed = report.closed.len(),
            failed = report.failures.len(),
            "all connections shut down"
        );
        report
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
