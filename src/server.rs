//! The gateway's own MCP surface: newline-delimited JSON-RPC over stdio.
//!
//! [`McpConnection`] enforces the lifecycle (`initialize` →
//! `notifications/initialized` → tools) and routes methods to the
//! [`Gateway`]. [`serve`] drives it over a reader/writer pair; tool calls run
//! concurrently and a single writer task serializes responses.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::gateway::Gateway;
use crate::mcp_client::types::{
    error_codes, CallToolParams, Implementation, InitializeParams, InitializeResult, JsonRpcId,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    PROTOCOL_VERSION_LATEST, SUPPORTED_PROTOCOL_VERSIONS,
};

pub const SERVER_NAME: &str = "mcp-gateway";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ConnState {
    New,
    InitResponded,
    Ready,
}

/// What the serve loop does with one inbound message.
enum Dispatch {
    Reply(JsonRpcResponse),
    Call(JsonRpcId, CallToolParams),
    Silent,
}

/// Lifecycle state machine and method router for one client.
pub struct McpConnection {
    gateway: Arc<Gateway>,
    state: ConnState,
    protocol_version: Option<String>,
}

impl McpConnection {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            state: ConnState::New,
            protocol_version: None,
        }
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// Handle one message to completion, tool calls included.
    ///
    /// Returns `Some(response)` for requests, `None` for notifications.
    pub async fn handle_message(&mut self, msg: JsonRpcMessage) -> Option<JsonRpcResponse> {
        match self.dispatch(msg).await {
            Dispatch::Reply(resp) => Some(resp),
            Dispatch::Call(id, params) => Some(call_tool(&self.gateway, id, params).await),
            Dispatch::Silent => None,
        }
    }

    async fn dispatch(&mut self, msg: JsonRpcMessage) -> Dispatch {
        match msg {
            JsonRpcMessage::Request(req) => self.handle_request(req).await,
            JsonRpcMessage::Notification(n) => {
                self.handle_notification(n);
                Dispatch::Silent
            }
            JsonRpcMessage::Response(_) => Dispatch::Silent,
        }
    }

    async fn handle_request(&mut self, req: JsonRpcRequest) -> Dispatch {
        if req.jsonrpc != "2.0" {
            return Dispatch::Reply(JsonRpcResponse::err(
                req.id,
                error_codes::INVALID_REQUEST,
                "invalid jsonrpc version",
            ));
        }

        match req.method.as_str() {
            "initialize" => Dispatch::Reply(self.handle_initialize(req)),
            "ping" => Dispatch::Reply(JsonRpcResponse::ok(req.id, json!({}))),
            "tools/list" => {
                if self.state != ConnState::Ready {
                    return Dispatch::Reply(not_initialized(req.id));
                }
                let result = ListToolsResult {
                    tools: self.gateway.list_tools().await,
                    next_cursor: None,
                };
                Dispatch::Reply(JsonRpcResponse::ok(req.id, to_value(&result)))
            }
            "tools/call" => {
                if self.state != ConnState::Ready {
                    return Dispatch::Reply(not_initialized(req.id));
                }
                let Some(params) = req.params else {
                    return Dispatch::Reply(invalid_params(req.id, "missing params".into()));
                };
                match serde_json::from_value::<CallToolParams>(params) {
                    Ok(params) => Dispatch::Call(req.id, params),
                    Err(e) => Dispatch::Reply(invalid_params(req.id, e.to_string())),
                }
            }
            _ => Dispatch::Reply(JsonRpcResponse::err(
                req.id,
                error_codes::METHOD_NOT_FOUND,
                "method not found",
            )),
        }
    }

    fn handle_initialize(&mut self, req: JsonRpcRequest) -> JsonRpcResponse {
        if self.state != ConnState::New {
            return JsonRpcResponse::err(req.id, error_codes::INVALID_REQUEST, "already initialized");
        }
        let Some(params) = req.params else {
            return invalid_params(req.id, "missing params".into());
        };
        let init: InitializeParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return invalid_params(req.id, e.to_string()),
        };

        let negotiated = negotiate_protocol(&init.protocol_version);
        tracing::info!(
            client = %init.client_info.name,
            requested = %init.protocol_version,
            negotiated,
            "client initializing"
        );
        self.protocol_version = Some(negotiated.to_string());
        self.state = ConnState::InitResponded;

        let result = InitializeResult {
            protocol_version: negotiated.to_string(),
            capabilities: json!({"tools": {"listChanged": false}}),
            server_info: Some(Implementation {
                name: SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
            instructions: None,
        };
        JsonRpcResponse::ok(req.id, to_value(&result))
    }

    fn handle_notification(&mut self, n: JsonRpcNotification) {
        if n.jsonrpc != "2.0" {
            return;
        }
        if n.method == "notifications/initialized" && self.state == ConnState::InitResponded {
            self.state = ConnState::Ready;
            tracing::debug!("client ready");
        }
    }
}

/// Echo a supported version, otherwise answer with the latest.
fn negotiate_protocol(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|v| *v == requested)
        .unwrap_or(PROTOCOL_VERSION_LATEST)
}

async fn call_tool(gateway: &Gateway, id: JsonRpcId, params: CallToolParams) -> JsonRpcResponse {
    let arguments = params.arguments.unwrap_or(Value::Null);
    let result = gateway.call_tool(&params.name, arguments).await;
    JsonRpcResponse::ok(id, to_value(&result))
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn not_initialized(id: JsonRpcId) -> JsonRpcResponse {
    JsonRpcResponse::err(id, error_codes::NOT_INITIALIZED, "not initialized")
}

fn invalid_params(id: JsonRpcId, detail: String) -> JsonRpcResponse {
    let mut resp = JsonRpcResponse::err(id, error_codes::INVALID_PARAMS, "invalid params");
    if let Some(error) = resp.error.as_mut() {
        error.data = Some(json!({"detail": detail}));
    }
    resp
}

/// Decode one input line. `Err` is the response to send back.
fn parse_line(line: &str) -> Result<JsonRpcMessage, JsonRpcResponse> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        tracing::debug!(error = %e, "unparseable input line");
        JsonRpcResponse::err(JsonRpcId::Null, error_codes::PARSE_ERROR, "parse error")
    })?;
    if value.is_array() {
        return Err(JsonRpcResponse::err(
            JsonRpcId::Null,
            error_codes::INVALID_REQUEST,
            "batching not supported",
        ));
    }
    serde_json::from_value(value).map_err(|_| {
        JsonRpcResponse::err(JsonRpcId::Null, error_codes::INVALID_REQUEST, "invalid request")
    })
}

/// Decode one raw input line. `None` for blank lines.
fn decode_line(raw: &[u8]) -> Option<Result<JsonRpcMessage, JsonRpcResponse>> {
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line,
        Err(e) => {
            tracing::debug!(error = %e, "input line is not UTF-8");
            return Some(Err(JsonRpcResponse::err(
                JsonRpcId::Null,
                error_codes::PARSE_ERROR,
                "parse error",
            )));
        }
    };
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(parse_line(line))
}

/// Join calls that already finished. Returns how many are still running.
fn reap_finished(calls: &mut JoinSet<()>) -> usize {
    while let Some(joined) = calls.try_join_next() {
        if let Err(e) = joined {
            tracing::warn!(error = %e, "tool call task failed");
        }
    }
    calls.len()
}

// ─── Serve Loop ──────────────────────────────────────────────────────────────

/// Serve one client until `reader` reaches EOF, then wait for in-flight
/// tool calls and flush their responses.
pub async fn serve<R, W>(gateway: Arc<Gateway>, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
    let writer_task = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            write_jsonrpc(&mut writer, &resp).await?;
        }
        anyhow::Ok(())
    });

    let mut conn = McpConnection::new(Arc::clone(&gateway));
    let mut calls = JoinSet::new();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let dispatch = match decode_line(&buf) {
            Some(Ok(msg)) => conn.dispatch(msg).await,
            Some(Err(resp)) => Dispatch::Reply(resp),
            None => continue,
        };
        match dispatch {
            Dispatch::Reply(resp) => {
                if tx.send(resp).is_err() {
                    break;
                }
            }
            Dispatch::Call(id, params) => {
                let gateway = Arc::clone(&gateway);
                let tx = tx.clone();
                calls.spawn(async move {
                    let resp = call_tool(&gateway, id, params).await;
                    let _ = tx.send(resp);
                });
            }
            Dispatch::Silent => {}
        }
        reap_finished(&mut calls);
    }

    tracing::debug!(in_flight = calls.len(), "input closed");
    while calls.join_next().await.is_some() {}
    drop(tx);
    writer_task.await??;
    Ok(())
}

async fn write_jsonrpc<W: AsyncWrite + Unpin>(
    writer: &mut W,
    resp: &JsonRpcResponse,
) -> anyhow::Result<()> {
    let out = serde_json::to_string(resp)?;
    writer.write_all(out.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::GatewayConfig;
    use crate::mcp_client::{ServerEntryRecord, TransportFactory};
    use crate::testing::{MockFactory, MockServer};

    async fn gateway(dir: &tempfile::TempDir) -> Arc<Gateway> {
        let factory = Arc::new(MockFactory::default());
        factory.add("calc", MockServer::with_tools(&["add"]));
        factory.add("slow", MockServer::with_tools(&["wait"]).call_delay(Duration::from_millis(300)));
        let config = GatewayConfig {
            registry_path: dir.path().join("registry.json"),
            ..Default::default()
        };
        let gateway = Gateway::new(&config, factory as Arc<dyn TransportFactory>).unwrap();
        for id in ["calc", "slow"] {
            gateway
                .register(ServerEntryRecord {
                    id: id.into(),
                    kind: "stdio".into(),
                    command: Some("mock".into()),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        Arc::new(gateway)
    }

    fn request(id: u64, method: &str, params: Value) -> JsonRpcMessage {
        serde_json::from_value(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .unwrap()
    }

    fn initialized() -> JsonRpcMessage {
        serde_json::from_value(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .unwrap()
    }

    fn init_params(version: &str) -> Value {
        json!({"protocolVersion": version, "capabilities": {}, "clientInfo": {"name": "t", "version": "0"}})
    }

    #[tokio::test]
    async fn test_lifecycle_is_enforced() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut conn = McpConnection::new(gateway(&dir).await);

        let resp = conn.handle_message(request(1, "tools/list", json!({}))).await.unwrap();
        assert_eq!(resp.error.unwrap().code, error_codes::NOT_INITIALIZED);

        let resp = conn.handle_message(request(2, "ping", json!({}))).await.unwrap();
        assert_eq!(resp.result, Some(json!({})));

        let resp = conn
            .handle_message(request(3, "initialize", init_params("2024-11-05")))
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], SERVER_NAME);
        assert_eq!(conn.protocol_version(), Some("2024-11-05"));

        // Still not ready until the client confirms.
        let resp = conn
            .handle_message(request(4, "tools/call", json!({"name": "calc.add"})))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, error_codes::NOT_INITIALIZED);

        assert!(conn.handle_message(initialized()).await.is_none());
        let resp = conn.handle_message(request(5, "tools/list", json!({}))).await.unwrap();
        let tools = resp.result.unwrap()["tools"].as_array().unwrap().clone();
        assert_eq!(tools[0]["name"], "calc.add");
        assert_eq!(tools[0]["_meta"]["server_id"], "calc");

        let resp = conn
            .handle_message(request(6, "initialize", init_params("2025-06-18")))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_protocol_version_gets_latest() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut conn = McpConnection::new(gateway(&dir).await);
        let resp = conn
            .handle_message(request(1, "initialize", init_params("1999-01-01")))
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["protocolVersion"], PROTOCOL_VERSION_LATEST);
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut conn = McpConnection::new(gateway(&dir).await);
        conn.handle_message(request(1, "initialize", init_params("2025-06-18"))).await;
        conn.handle_message(initialized()).await;

        let resp = conn.handle_message(request(2, "resources/list", json!({}))).await.unwrap();
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);

        let resp = conn
            .handle_message(request(3, "tools/call", json!({"arguments": {}})))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);

        let err = parse_line("{oops").unwrap_err();
        assert_eq!(err.id, JsonRpcId::Null);
        assert_eq!(err.error.unwrap().code, error_codes::PARSE_ERROR);
        let err = parse_line("[]").unwrap_err();
        assert_eq!(err.error.unwrap().code, error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_tool_call_errors_are_results() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut conn = McpConnection::new(gateway(&dir).await);
        conn.handle_message(request(1, "initialize", init_params("2025-06-18"))).await;
        conn.handle_message(initialized()).await;

        let resp = conn
            .handle_message(request(2, "tools/call", json!({"name": "nope.x", "arguments": {}})))
            .await
            .unwrap();
        assert!(resp.error.is_none());
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "Error: unknown tool 'nope.x'");
    }

    #[tokio::test]
    async fn test_serve_over_streams() {
        let dir = tempfile::TempDir::new().unwrap();
        let gateway = gateway(&dir).await;

        let input = [
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": init_params("2025-06-18")}),
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "slow.wait"}}),
            json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {"name": "calc.add", "arguments": {"a": 1}}}),
        ]
        .iter()
        .map(|v| format!("{v}\n"))
        .collect::<String>()
            + "not json\n";

        let (client, server) = tokio::io::duplex(64 * 1024);
        serve(gateway, input.as_bytes(), server).await.unwrap();

        let mut out = String::new();
        let mut client = client;
        tokio::io::AsyncReadExt::read_to_string(&mut client, &mut out).await.unwrap();
        let responses: Vec<Value> = out.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(responses.len(), 4);

        assert_eq!(responses[0]["id"], 1);
        // The fast call overtakes the slow one.
        let ids: Vec<&Value> = responses.iter().map(|r| &r["id"]).collect();
        let fast = ids.iter().position(|id| **id == json!(3)).unwrap();
        let slow = ids.iter().position(|id| **id == json!(2)).unwrap();
        assert!(fast < slow);
        assert_eq!(responses[fast]["result"]["content"][0]["text"], r#"calc:add:{"a":1}"#);
        assert_eq!(responses[slow]["result"]["content"][0]["text"], "slow:wait:{}");

        let parse_error = responses.iter().find(|r| r["id"].is_null()).unwrap();
        assert_eq!(parse_error["error"]["code"], error_codes::PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_serve_survives_invalid_utf8() {
        let dir = tempfile::TempDir::new().unwrap();
        let gateway = gateway(&dir).await;

        let mut input = b"\xff\xfe garbage\n\n".to_vec();
        input.extend_from_slice(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n");

        let (client, server) = tokio::io::duplex(64 * 1024);
        serve(gateway, input.as_slice(), server).await.unwrap();

        let mut out = String::new();
        let mut client = client;
        tokio::io::AsyncReadExt::read_to_string(&mut client, &mut out).await.unwrap();
        let responses: Vec<Value> = out.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(responses.len(), 2);
        assert!(responses[0]["id"].is_null());
        assert_eq!(responses[0]["error"]["code"], error_codes::PARSE_ERROR);
        assert_eq!(responses[1]["id"], 1);
        assert_eq!(responses[1]["result"], json!({}));
    }

    #[tokio::test]
    async fn test_finished_calls_are_reaped() {
        let mut calls = JoinSet::new();
        for _ in 0..3 {
            calls.spawn(async {});
        }
        calls.spawn(async { tokio::time::sleep(Duration::from_secs(30)).await });
        tokio::time::timeout(Duration::from_secs(5), async {
            while reap_finished(&mut calls) > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(calls.len(), 1);
        calls.abort_all();
    }
}
