//! Client-side routing: call aggregated tools through the gateway, or
//! straight at the downstream server when its metadata allows it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use super::catalog::RoutingMeta;
use super::errors::{CloseError, ConnectPhase, GatewayError, ShutdownReport};
use crate::config::Timeouts;
use crate::mcp_client::{
    CallToolResult, McpError, ServerEntry, Session, Tool, TransportFactory, TransportKind,
    TransportSpec,
};

// ─── RoutingDecider ──────────────────────────────────────────────────────────

/// Where a call goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Forward the namespaced name through the gateway session.
    GatewayMediated,
    /// Call `original_name` on the downstream server at `url`.
    Direct {
        server_id: String,
        kind: TransportKind,
        url: String,
        original_name: String,
    },
}

/// Chooses between gateway-mediated and direct invocation.
#[derive(Debug, Clone, Copy)]
pub struct RoutingDecider {
    allow_direct: bool,
}

impl Default for RoutingDecider {
    fn default() -> Self {
        Self { allow_direct: true }
    }
}

impl RoutingDecider {
    /// A decider that always goes through the gateway.
    pub fn gateway_only() -> Self {
        Self {
            allow_direct: false,
        }
    }

    /// Direct iff allowed by metadata, the kind is a network kind, and a URL
    /// is present. Anything else, including no metadata, goes via the gateway.
    pub fn decide(&self, meta: Option<&RoutingMeta>) -> Route {
        let Some(meta) = meta else {
            return Route::GatewayMediated;
        };
        match (&meta.server_url, self.allow_direct) {
            (Some(url), true) if meta.direct_call_allowed && meta.server_type.is_network() => {
                Route::Direct {
                    server_id: meta.server_id.clone(),
                    kind: meta.server_type,
                    url: url.clone(),
                    original_name: meta.original_name.clone(),
                }
            }
            _ => Route::GatewayMediated,
        }
    }
}

// ─── RoutingClient ───────────────────────────────────────────────────────────

/// A gateway consumer that bypasses the gateway for network-addressable peers.
///
/// Direct sessions are opened lazily, one per server id, and cached.
pub struct RoutingClient {
    gateway: Arc<dyn Session>,
    factory: Arc<dyn TransportFactory>,
    decider: RoutingDecider,
    connect_timeout: Duration,
    call_timeout: Duration,
    tools: RwLock<Vec<Tool>>,
    meta: RwLock<HashMap<String, RoutingMeta>>,
    direct: Mutex<HashMap<String, Arc<dyn Session>>>,
}

impl RoutingClient {
    /// Initialize an opened gateway session and load its catalog.
    pub async fn connect(
        gateway: Arc<dyn Session>,
        factory: Arc<dyn TransportFactory>,
        decider: RoutingDecider,
        timeouts: &Timeouts,
    ) -> Result<Self, GatewayError> {
        let server_id = gateway.server_id().to_string();
        let connect_timeout = timeouts.connect();
        let client = Self {
            gateway,
            factory,
            decider,
            connect_timeout,
            call_timeout: timeouts.call(),
            tools: RwLock::new(Vec::new()),
            meta: RwLock::new(HashMap::new()),
            direct: Mutex::new(HashMap::new()),
        };

        let initialized = tokio::time::timeout(connect_timeout, client.gateway.initialize()).await;
        match initialized {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                let _ = client.gateway.close().await;
                return Err(connection_error(&server_id, ConnectPhase::Initializing, e.to_string()));
            }
            Err(_) => {
                let _ = client.gateway.close().await;
                return Err(connection_error(
                    &server_id,
                    ConnectPhase::Initializing,
                    format!("timed out after {}s", connect_timeout.as_secs()),
                ));
            }
        }

        if let Err(e) = client.refresh().await {
            let _ = client.gateway.close().await;
            return Err(e);
        }
        Ok(client)
    }

    /// Re-list the gateway catalog. Returns the number of tools.
    pub async fn refresh(&self) -> Result<usize, GatewayError> {
        let tools = self.gateway.list_tools().await.map_err(|e| {
            connection_error(self.gateway.server_id(), ConnectPhase::Listing, e.to_string())
        })?;

        let meta: HashMap<String, RoutingMeta> = tools
            .iter()
            .filter_map(|t| RoutingMeta::from_tool(t).map(|m| (t.name.clone(), m)))
            .collect();

        let count = tools.len();
        *self.meta.write().await = meta;
        *self.tools.write().await = tools;
        tracing::debug!(tools = count, "routing client catalog refreshed");
        Ok(count)
    }

    pub async fn tools(&self) -> Vec<Tool> {
        self.tools.read().await.clone()
    }

    pub async fn route(&self, name: &str) -> Route {
        self.decider.decide(self.meta.read().await.get(name))
    }

    /// Call a tool and return its first text block (empty if none).
    ///
    /// Both routes are bounded by the call timeout.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, GatewayError> {
        let result = match self.route(name).await {
            Route::GatewayMediated => {
                tracing::debug!(tool = name, "gateway-mediated call");
                match tokio::time::timeout(self.call_timeout, self.gateway.call_tool(name, arguments)).await {
                    Ok(result) => result.map_err(GatewayError::upstream)?,
                    Err(_) => return Err(self.call_timed_out(name)),
                }
            }
            Route::Direct {
                server_id,
                kind,
                url,
                original_name,
            } => {
                tracing::debug!(tool = name, server = %server_id, "direct call");
                let session = self.direct_session(&server_id, kind, &url).await?;
                let called =
                    tokio::time::timeout(self.call_timeout, session.call_tool(&original_name, arguments)).await;
                match called {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => {
                        if e.is_fatal() {
                            self.evict(&server_id).await;
                        }
                        return Err(GatewayError::upstream(e));
                    }
                    Err(_) => return Err(self.call_timed_out(name)),
                }
            }
        };
        text_of(result)
    }

    fn call_timed_out(&self, name: &str) -> GatewayError {
        GatewayError::UpstreamTool(format!(
            "tool '{name}' timed out after {}s",
            self.call_timeout.as_secs()
        ))
    }

    async fn direct_session(
        &self,
        server_id: &str,
        kind: TransportKind,
        url: &str,
    ) -> Result<Arc<dyn Session>, GatewayError> {
        if let Some(session) = self.direct.lock().await.get(server_id) {
            return Ok(Arc::clone(session));
        }

        let transport = match kind {
            TransportKind::PushStream => TransportSpec::PushStream {
                url: url.to_string(),
                headers: BTreeMap::new(),
            },
            TransportKind::HttpStream => TransportSpec::HttpStream {
                url: url.to_string(),
                headers: BTreeMap::new(),
            },
            TransportKind::Pipe => {
                return Err(GatewayError::Validation(format!(
                    "server '{server_id}' has no network address"
                )))
            }
        };
        let entry = ServerEntry {
            id: server_id.to_string(),
            transport,
        };

        let session = match tokio::time::timeout(self.connect_timeout, self.factory.open(&entry)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(connection_error(server_id, ConnectPhase::Connecting, e.to_string())),
            Err(_) => {
                return Err(connection_error(
                    server_id,
                    ConnectPhase::Connecting,
                    format!("timed out after {}s", self.connect_timeout.as_secs()),
                ))
            }
        };

        let reason = match tokio::time::timeout(self.connect_timeout, session.initialize()).await {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("timed out after {}s", self.connect_timeout.as_secs())),
        };
        if let Some(reason) = reason {
            let _ = session.close().await;
            return Err(connection_error(server_id, ConnectPhase::Initializing, reason));
        }

        // Connects run unlocked, so another call may have cached one first.
        let raced = {
            let mut direct = self.direct.lock().await;
            match direct.get(server_id) {
                Some(winner) => Some(Arc::clone(winner)),
                None => {
                    direct.insert(server_id.to_string(), Arc::clone(&session));
                    None
                }
            }
        };
        if let Some(winner) = raced {
            let _ = session.close().await;
            return Ok(winner);
        }
        tracing::info!(server = server_id, url, "direct session established");
        Ok(session)
    }

    async fn evict(&self, server_id: &str) {
        let evicted = self.direct.lock().await.remove(server_id);
        if let Some(session) = evicted {
            let _ = session.close().await;
        }
    }

    /// Number of cached direct sessions.
    pub async fn direct_sessions(&self) -> usize {
        self.direct.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn cached_direct(&self, server_id: &str) -> Option<Arc<dyn Session>> {
        self.direct.lock().await.get(server_id).cloned()
    }

    /// Close the gateway session and every direct session.
    pub async fn close(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        let direct: Vec<(String, Arc<dyn Session>)> = self.direct.lock().await.drain().collect();
        for (id, session) in direct {
            report.record(&id, close_session(&id, session.as_ref()).await);
        }

        let gateway_id = self.gateway.server_id().to_string();
        report.record(&gateway_id, close_session(&gateway_id, self.gateway.as_ref()).await);
        report
    }
}

async fn close_session(server_id: &str, session: &dyn Session) -> Result<(), CloseError> {
    session.close().await.map_err(|e: McpError| CloseError {
        server_id: server_id.to_string(),
        reason: e.to_string(),
    })
}

fn connection_error(server_id: &str, phase: ConnectPhase, reason: String) -> GatewayError {
    GatewayError::Connection {
        server_id: server_id.to_string(),
        phase,
        reason,
    }
}

/// First text block of a result; a flagged error becomes `UpstreamTool`.
fn text_of(result: CallToolResult) -> Result<String, GatewayError> {
    let text = result.first_text();
    if result.is_error() {
        Err(GatewayError::UpstreamTool(text))
    } else {
        Ok(text)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(kind: TransportKind, url: Option<&str>, allowed: bool) -> RoutingMeta {
        RoutingMeta {
            server_id: "ext".into(),
            server_type: kind,
            original_name: "now".into(),
            direct_call_allowed: allowed,
            server_url: url.map(str::to_string),
        }
    }

    #[test]
    fn test_direct_only_when_all_conditions_hold() {
        let decider = RoutingDecider::default();
        assert_eq!(
            decider.decide(Some(&meta(TransportKind::HttpStream, Some("http://h/mcp"), true))),
            Route::Direct {
                server_id: "ext".into(),
                kind: TransportKind::HttpStream,
                url: "http://h/mcp".into(),
                original_name: "now".into(),
            }
        );
        assert_eq!(
            decider.decide(Some(&meta(TransportKind::PushStream, Some("http://h/sse"), false))),
            Route::GatewayMediated
        );
        assert_eq!(
            decider.decide(Some(&meta(TransportKind::HttpStream, None, true))),
            Route::GatewayMediated
        );
        // Metadata claiming direct for a pipe server is not trusted.
        assert_eq!(
            decider.decide(Some(&meta(TransportKind::Pipe, Some("http://h"), true))),
            Route::GatewayMediated
        );
        assert_eq!(decider.decide(None), Route::GatewayMediated);
    }

    #[test]
    fn test_gateway_only_decider() {
        let decider = RoutingDecider::gateway_only();
        assert_eq!(
            decider.decide(Some(&meta(TransportKind::HttpStream, Some("http://h/mcp"), true))),
            Route::GatewayMediated
        );
    }

    #[test]
    fn test_text_of() {
        assert_eq!(text_of(CallToolResult::text("8")).unwrap(), "8");
        let empty: CallToolResult = serde_json::from_value(serde_json::json!({"content": []})).unwrap();
        assert_eq!(text_of(empty).unwrap(), "");
        let err = text_of(CallToolResult::error_text("Error: boom")).unwrap_err();
        assert_eq!(err.to_string(), "Error: boom");
    }
}
