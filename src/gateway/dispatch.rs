//! Invocation dispatch through the gateway's own sessions.

use serde_json::Value;

use super::admin;
use super::errors::GatewayError;
use super::Gateway;
use crate::mcp_client::CallToolResult;

impl Gateway {
    /// Serve a `tools/call`. Never fails: errors become `"Error: …"` text.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> CallToolResult {
        if admin::is_admin_tool(name) {
            return self.call_admin(name, arguments).await;
        }

        match self.dispatch(name, arguments).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "tool call failed");
                CallToolResult::error_text(format!("Error: {e}"))
            }
        }
    }

    /// Route a namespaced tool to its server's live session.
    ///
    /// The session is cloned out of the connection map, so a slow downstream
    /// holds no gateway lock.
    pub async fn dispatch(&self, name: &str, arguments: Value) -> Result<CallToolResult, GatewayError> {
        let (server_id, original_name) = {
            let catalog = self.catalog.read().await;
            let descriptor = catalog
                .route(name)
                .ok_or_else(|| GatewayError::UnknownTool(name.to_string()))?;
            (descriptor.server_id.clone(), descriptor.original_name.clone())
        };

        let session = self
            .connections
            .session(&server_id)
            .await
            .ok_or_else(|| GatewayError::NoSession(server_id.clone()))?;

        let arguments = match arguments {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        tracing::debug!(tool = name, server = %server_id, "dispatching tool call");
        match tokio::time::timeout(self.call_timeout, session.call_tool(&original_name, arguments)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(GatewayError::upstream(e)),
            Err(_) => Err(GatewayError::UpstreamTool(format!(
                "tool '{name}' timed out after {}s",
                self.call_timeout.as_secs()
            ))),
        }
    }
}
