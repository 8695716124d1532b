//! Test doubles shared by the unit tests: a scriptable in-memory
//! `TransportFactory`, entry builders, and a shell-script MCP server.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::mcp_client::types::InitializeResult;
use crate::mcp_client::{
    CallToolResult, McpError, ServerEntry, Session, Tool, TransportFactory, TransportSpec,
};

/// A tiny MCP server in POSIX shell with one tool, `add`, summing `a` and `b`.
pub const ADD_SERVER_SCRIPT: &str = r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-06-18","capabilities":{},"serverInfo":{"name":"sh","version":"1"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"add","description":"Add two numbers","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      a=$(printf '%s' "$line" | sed -n 's/.*"a":\(-*[0-9][0-9]*\).*/\1/p')
      b=$(printf '%s' "$line" | sed -n 's/.*"b":\(-*[0-9][0-9]*\).*/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"%s"}]}}\n' "$id" "$((a + b))" ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id" ;;
  esac
done"#;

pub fn pipe_entry(id: &str) -> ServerEntry {
    ServerEntry {
        id: id.to_string(),
        transport: TransportSpec::Pipe {
            command: "mock".into(),
            args: vec![],
            env: BTreeMap::new(),
        },
    }
}

pub fn http_entry(id: &str, url: &str) -> ServerEntry {
    ServerEntry {
        id: id.to_string(),
        transport: TransportSpec::HttpStream {
            url: url.to_string(),
            headers: BTreeMap::new(),
        },
    }
}

// ─── Mock Server Behaviour ───────────────────────────────────────────────────

/// How a mock downstream behaves.
#[derive(Debug, Clone, Default)]
pub struct MockServer {
    tools: Vec<String>,
    fail_open: bool,
    fail_initialize: bool,
    hang_initialize: bool,
    fail_list: bool,
    close_fails: bool,
    call_error: Option<String>,
    call_delay: Option<Duration>,
}

impl MockServer {
    pub fn with_tools(tools: &[&str]) -> Self {
        Self {
            tools: tools.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Default::default()
        }
    }

    pub fn failing_initialize() -> Self {
        Self {
            fail_initialize: true,
            ..Default::default()
        }
    }

    pub fn hanging_initialize() -> Self {
        Self {
            hang_initialize: true,
            ..Default::default()
        }
    }

    pub fn failing_list() -> Self {
        Self {
            fail_list: true,
            ..Default::default()
        }
    }

    pub fn close_fails(mut self) -> Self {
        self.close_fails = true;
        self
    }

    pub fn call_error(mut self, message: &str) -> Self {
        self.call_error = Some(message.to_string());
        self
    }

    pub fn call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }
}

// ─── Mock Factory ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Stats {
    opened: AtomicUsize,
    released: AtomicUsize,
    close_calls: AtomicUsize,
    peak_open: AtomicUsize,
}

/// Factory handing out [`MockSession`]s by server id, with resource tracking.
#[derive(Default)]
pub struct MockFactory {
    servers: Mutex<HashMap<String, MockServer>>,
    stats: Arc<Stats>,
}

impl MockFactory {
    pub fn add(&self, id: &str, server: MockServer) {
        self.servers.lock().unwrap().insert(id.to_string(), server);
    }

    /// Sessions opened and neither closed nor dropped.
    pub fn open_sessions(&self) -> usize {
        self.stats.opened.load(Ordering::SeqCst) - self.stats.released.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.stats.opened.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.stats.close_calls.load(Ordering::SeqCst)
    }

    /// Most sessions ever open at the same time.
    pub fn peak_open(&self) -> usize {
        self.stats.peak_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn open(&self, entry: &ServerEntry) -> Result<Arc<dyn Session>, McpError> {
        let server = self
            .servers
            .lock()
            .unwrap()
            .get(&entry.id)
            .cloned()
            .ok_or_else(|| McpError::SpawnFailed {
                name: entry.id.clone(),
                reason: "No such file or directory".into(),
            })?;

        if server.fail_open {
            return Err(McpError::ConnectFailed {
                server: entry.id.clone(),
                reason: "connection refused".into(),
            });
        }

        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        self.stats.peak_open.fetch_max(self.open_sessions(), Ordering::SeqCst);
        Ok(Arc::new(MockSession {
            server_id: entry.id.clone(),
            server,
            released: AtomicBool::new(false),
            stats: Arc::clone(&self.stats),
        }))
    }
}

/// In-memory session. `call_tool` answers `"<server>:<tool>:<args>"`.
pub struct MockSession {
    server_id: String,
    server: MockServer,
    released: AtomicBool,
    stats: Arc<Stats>,
}

impl MockSession {
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.stats.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl Session for MockSession {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn initialize(&self) -> Result<InitializeResult, McpError> {
        if self.server.hang_initialize {
            std::future::pending::<()>().await;
        }
        if self.server.fail_initialize {
            return Err(McpError::TransportError {
                server: self.server_id.clone(),
                reason: "server stdout closed (process may have exited)".into(),
            });
        }
        Ok(serde_json::from_value(serde_json::json!({"protocolVersion": "2025-06-18"}))
            .unwrap())
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        if self.server.fail_list {
            return Err(McpError::ServerError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            });
        }
        Ok(self
            .server
            .tools
            .iter()
            .map(|name| Tool {
                name: name.clone(),
                description: Some(format!("{name} from {}", self.server_id)),
                input_schema: serde_json::json!({"type": "object"}),
                meta: None,
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        if let Some(delay) = self.server.call_delay {
            tokio::time::sleep(delay).await;
        }
        if self.released.load(Ordering::SeqCst) {
            return Err(McpError::Closed {
                server: self.server_id.clone(),
            });
        }
        if let Some(message) = &self.server.call_error {
            return Err(McpError::ServerError {
                code: -32000,
                message: message.clone(),
                data: None,
            });
        }
        Ok(CallToolResult::text(format!(
            "{}:{name}:{arguments}",
            self.server_id
        )))
    }

    async fn close(&self) -> Result<(), McpError> {
        self.stats.close_calls.fetch_add(1, Ordering::SeqCst);
        self.release();
        if self.server.close_fails {
            return Err(McpError::TransportError {
                server: self.server_id.clone(),
                reason: "broken pipe".into(),
            });
        }
        Ok(())
    }
}

// ─── Network Downstreams ─────────────────────────────────────────────────────

/// Answer one JSON-RPC message the way a small MCP server with an `echo`
/// tool would. `None` for notifications.
fn answer(body: &[u8]) -> Option<serde_json::Value> {
    let msg: serde_json::Value = serde_json::from_slice(body).ok()?;
    let id = msg.get("id")?.clone();
    let result = match msg["method"].as_str() {
        Some("initialize") => serde_json::json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "serverInfo": {"name": "net-test", "version": "1"}
        }),
        Some("tools/list") => serde_json::json!({
            "tools": [{"name": "echo", "description": "Echo text", "inputSchema": {"type": "object"}}]
        }),
        Some("tools/call") => serde_json::json!({
            "content": [{
                "type": "text",
                "text": format!("echo:{}", msg["params"]["arguments"]["text"].as_str().unwrap_or(""))
            }]
        }),
        _ => {
            return Some(serde_json::json!({
                "jsonrpc": "2.0", "id": id,
                "error": {"code": -32601, "message": "Method not found"}
            }))
        }
    };
    Some(serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

struct HttpRequest {
    method: String,
    body: Vec<u8>,
}

async fn read_request<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<HttpRequest>> {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(None);
    }
    let method = request_line
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0; content_length];
    reader.read_exact(&mut body).await?;
    Ok(Some(HttpRequest { method, body }))
}

/// Streamable HTTP downstream on 127.0.0.1. Answers `tools/call` as an SSE
/// body and everything else as JSON. Returns the endpoint URL and a counter
/// of `DELETE` requests.
pub async fn spawn_http_downstream() -> (String, Arc<AtomicUsize>) {
    use tokio::io::{AsyncWriteExt, BufReader};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/mcp", listener.local_addr().unwrap());
    let deletes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&deletes);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                while let Ok(Some(req)) = read_request(&mut reader).await {
                    let is_call = serde_json::from_slice::<serde_json::Value>(&req.body)
                        .map(|v| v["method"] == "tools/call")
                        .unwrap_or(false);
                    let (status, content_type, payload) = if req.method == "DELETE" {
                        counter.fetch_add(1, Ordering::SeqCst);
                        ("200 OK", "application/json", String::new())
                    } else {
                        match answer(&req.body) {
                            None => ("202 Accepted", "application/json", String::new()),
                            Some(resp) if is_call => (
                                "200 OK",
                                "text/event-stream",
                                format!(": ping\n\nevent: message\ndata: {resp}\n\n"),
                            ),
                            Some(resp) => ("200 OK", "application/json", resp.to_string()),
                        }
                    };
                    let head = format!(
                        "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\nmcp-session-id: test-session\r\ncontent-length: {}\r\n\r\n",
                        payload.len()
                    );
                    let stream = reader.get_mut();
                    if stream.write_all(head.as_bytes()).await.is_err()
                        || stream.write_all(payload.as_bytes()).await.is_err()
                    {
                        return;
                    }
                }
            });
        }
    });

    (url, deletes)
}

/// Legacy SSE downstream on 127.0.0.1: `GET /sse` streams events, `POST
/// /messages` accepts requests whose responses are pushed on the stream.
pub async fn spawn_sse_downstream() -> String {
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio::sync::mpsc;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/sse", listener.local_addr().unwrap());
    let push: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>> = Arc::default();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let push = Arc::clone(&push);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                while let Ok(Some(req)) = read_request(&mut reader).await {
                    if req.method == "GET" {
                        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                        *push.lock().unwrap() = Some(tx);
                        let stream = reader.get_mut();
                        let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\nconnection: close\r\n\r\nevent: endpoint\ndata: /messages?session_id=1\n\n";
                        if stream.write_all(head.as_bytes()).await.is_err() {
                            return;
                        }
                        while let Some(event) = rx.recv().await {
                            if stream.write_all(event.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                        return;
                    }

                    if let Some(resp) = answer(&req.body) {
                        let tx = push.lock().unwrap().clone();
                        if let Some(tx) = tx {
                            let _ = tx.send(format!("event: message\ndata: {resp}\n\n"));
                        }
                    }
                    let head = "HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\n\r\n";
                    if reader.get_mut().write_all(head.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    url
}
