//! Server-sent events: a small decoder shared by both network transports, and
//! the push-stream (`sse`) transport itself.
//!
//! The push-stream transport holds one long-lived `GET` whose events carry
//! server-to-client messages. The first `endpoint` event names the URL that
//! client-to-server messages are `POST`ed to. Responses come back on the
//! stream as `message` events and are routed to the waiting request by id.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::Url;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::http::build_client;
use super::transport::next_request_id;
use super::types::{JsonRpcId, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Decoder ─────────────────────────────────────────────────────────────────

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, if present (`None` means the default `message`).
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

impl SseEvent {
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// Incremental SSE decoder. Feed raw bytes, get complete events back.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Append a chunk and return every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        // CRLF line endings collapse to LF; boundaries are then always "\n\n".
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_event(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_event(&String::from_utf8_lossy(&rest))
    }
}

/// Decode a complete SSE body.
pub fn decode_sse_events(body: &str) -> Vec<SseEvent> {
    let mut decoder = SseDecoder::default();
    let mut events = decoder.push(body.as_bytes());
    events.extend(decoder.finish());
    events
}

fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        // Comments (keep-alives) start with ':'.
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}

// ─── Push-stream Transport ───────────────────────────────────────────────────

/// Upper bound for a single POST to the message endpoint.
const POST_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Aborts the wrapped task when dropped, so a cancelled connect or a dropped
/// transport never leaves a reader holding the socket open.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Removes a pending request slot if the request is cancelled mid-flight.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// JSON-RPC transport over an SSE stream plus a POST endpoint.
pub struct SseTransport {
    server_name: String,
    http: reqwest::Client,
    endpoint: Url,
    pending: PendingMap,
    reader: AbortOnDrop,
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its endpoint.
    ///
    /// The caller bounds this with the connect timeout.
    pub async fn connect(
        server_name: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Self, McpError> {
        let connect_failed = |reason: String| McpError::ConnectFailed {
            server: server_name.to_string(),
            reason,
        };

        let base_url = Url::parse(url).map_err(|e| connect_failed(format!("invalid url: {e}")))?;
        let http = build_client(server_name, headers)?;

        let response = http
            .get(base_url.clone())
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| connect_failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(connect_failed(format!("HTTP {}", response.status())));
        }

        let pending: PendingMap = Arc::default();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = AbortOnDrop(tokio::spawn(read_events(
            server_name.to_string(),
            base_url,
            response.bytes_stream(),
            Arc::clone(&pending),
            endpoint_tx,
        )));

        let endpoint = endpoint_rx
            .await
            .map_err(|_| connect_failed("stream ended before an endpoint event".into()))?
            .map_err(connect_failed)?;

        tracing::debug!(server = server_name, endpoint = %endpoint, "sse endpoint announced");

        Ok(Self {
            server_name: server_name.to_string(),
            http,
            endpoint,
            pending,
            reader,
        })
    }

    /// Send a JSON-RPC request and wait for its response on the stream.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        self.post(&JsonRpcRequest::new(id, method, params)).await?;

        rx.await.map_err(|_| McpError::Closed {
            server: self.server_name.clone(),
        })
    }

    /// Send a JSON-RPC notification.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.post(&JsonRpcNotification::new(method, params)).await
    }

    async fn post<T: serde::Serialize + ?Sized>(&self, body: &T) -> Result<(), McpError> {
        if self.reader.0.is_finished() {
            return Err(McpError::Closed {
                server: self.server_name.clone(),
            });
        }

        let response = self
            .http
            .post(self.endpoint.clone())
            .timeout(POST_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to post message: {e}"),
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("message endpoint returned HTTP {}", response.status()),
            })
        }
    }

    /// Stop the reader and fail every in-flight request.
    pub fn close(&self) {
        self.reader.0.abort();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

async fn read_events<B: AsRef<[u8]>>(
    server: String,
    base_url: Url,
    stream: impl Stream<Item = reqwest::Result<B>>,
    pending: PendingMap,
    endpoint_tx: oneshot::Sender<Result<Url, String>>,
) {
    let mut stream = std::pin::pin!(stream);
    let mut decoder = SseDecoder::default();
    let mut endpoint_tx = Some(endpoint_tx);

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "sse stream read error");
                break;
            }
        };

        for event in decoder.push(bytes.as_ref()) {
            if event.event.as_deref() == Some("endpoint") {
                if let Some(tx) = endpoint_tx.take() {
                    let resolved = base_url
                        .join(event.data.trim())
                        .map_err(|e| format!("invalid endpoint '{}': {e}", event.data));
                    let _ = tx.send(resolved);
                }
            } else if event.is_message() {
                deliver(&server, &pending, &event.data);
            }
        }
    }

    tracing::debug!(server = %server, "sse stream ended");
    // Dropping the senders wakes every waiter with a closed error.
    pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
}

fn deliver(server: &str, pending: &PendingMap, data: &str) {
    let response = match serde_json::from_str::<JsonRpcResponse>(data) {
        Ok(r) => r,
        Err(_) => {
            tracing::trace!(server, data, "ignoring non-response sse message");
            return;
        }
    };
    let JsonRpcId::Number(id) = response.id else {
        return;
    };
    let waiter = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
    if let Some(tx) = waiter {
        let _ = tx.send(response);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_single_event() {
        let events = decode_sse_events("event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("message".into()),
                data: "{\"jsonrpc\":\"2.0\"}".into(),
            }]
        );
        assert!(events[0].is_message());
    }

    #[test]
    fn test_joins_multiline_data_and_skips_comments() {
        let events = decode_sse_events(": keep-alive\n\ndata: a\ndata: b\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
        assert!(events[0].event.is_none());
    }

    #[test]
    fn test_incremental_push_across_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"event: endpoint\r\ndata: /mess").is_empty());
        let events = decoder.push(b"ages?session_id=1\r\n\r\nda");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/messages?session_id=1");

        assert!(decoder.push(b"ta: tail").is_empty());
        assert_eq!(decoder.finish().unwrap().data, "tail");
    }

    #[test]
    fn test_deliver_routes_by_id() {
        let pending: PendingMap = Arc::default();
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(42, tx);

        deliver("s", &pending, r#"{"jsonrpc":"2.0","id":41,"result":{}}"#);
        assert!(rx.try_recv().is_err());

        deliver("s", &pending, r#"{"jsonrpc":"2.0","id":42,"result":{"x":1}}"#);
        let resp = rx.try_recv().unwrap();
        assert_eq!(resp.result.unwrap()["x"], 1);
        assert!(pending.lock().unwrap().is_empty());
    }
}
