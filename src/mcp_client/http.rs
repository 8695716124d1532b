//! Streamable HTTP transport.
//!
//! Every message is a `POST` to one endpoint. A request is answered either
//! with a plain JSON body or with an SSE stream that eventually carries the
//! response. The server may assign a session id on `initialize`; it is echoed
//! on every later request and the session is released with `DELETE` on close.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{StatusCode, Url};

use super::errors::McpError;
use super::sse::SseDecoder;
use super::transport::next_request_id;
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Establishing the TCP/TLS connection, not the whole exchange.
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a client that sends the configured extra headers on every request.
pub(crate) fn build_client(
    server: &str,
    headers: &BTreeMap<String, String>,
) -> Result<reqwest::Client, McpError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| McpError::ConnectFailed {
            server: server.to_string(),
            reason: format!("invalid header name '{name}': {e}"),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| McpError::ConnectFailed {
            server: server.to_string(),
            reason: format!("invalid value for header '{name}': {e}"),
        })?;
        map.insert(name, value);
    }

    reqwest::Client::builder()
        .default_headers(map)
        .connect_timeout(TCP_CONNECT_TIMEOUT)
        .build()
        .map_err(|e| McpError::ConnectFailed {
            server: server.to_string(),
            reason: format!("failed to build http client: {e}"),
        })
}

/// JSON-RPC over streamable HTTP.
pub struct HttpTransport {
    server_name: String,
    http: reqwest::Client,
    endpoint: Url,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<Option<String>>,
}

impl HttpTransport {
    /// Prepare a transport. No network traffic happens until the first request.
    pub fn new(
        server_name: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Self, McpError> {
        let endpoint = Url::parse(url).map_err(|e| McpError::ConnectFailed {
            server: server_name.to_string(),
            reason: format!("invalid url: {e}"),
        })?;
        Ok(Self {
            server_name: server_name.to_string(),
            http: build_client(server_name, headers)?,
            endpoint,
            session_id: Mutex::new(None),
            protocol_version: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the negotiated protocol version; sent as a header from now on.
    pub fn set_protocol_version(&self, version: &str) {
        *self
            .protocol_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(version.to_string());
    }

    fn post(&self) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(self.endpoint.clone())
            .header("accept", ACCEPT_BOTH);
        if let Some(sid) = self.session_id() {
            req = req.header(SESSION_HEADER, sid);
        }
        let version = self
            .protocol_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(version) = version {
            req = req.header(PROTOCOL_HEADER, version);
        }
        req
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }

    /// Send a request and wait for the response, from a JSON body or an SSE stream.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let resp = self
            .post()
            .json(&JsonRpcRequest::new(id, method, params))
            .send()
            .await
            .map_err(|e| self.transport_error(format!("request failed: {e}")))?;

        if let Some(sid) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|h| h.to_str().ok())
        {
            *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(sid.to_string());
        }

        let status = resp.status();
        if status == StatusCode::ACCEPTED {
            return Err(self.transport_error("server returned 202 for a request".into()));
        }
        if !status.is_success() {
            return Err(self.transport_error(format!("HTTP {status}")));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();
        tracing::trace!(server = %self.server_name, method, content_type = %content_type, "http response");

        if content_type.starts_with("text/event-stream") {
            return self.read_sse_response(resp, id).await;
        }

        let body = resp
            .text()
            .await
            .map_err(|e| self.transport_error(format!("failed to read body: {e}")))?;
        let parsed: JsonRpcResponse =
            serde_json::from_str(&body).map_err(|e| McpError::InvalidResponse {
                server: self.server_name.clone(),
                reason: format!("not a JSON-RPC response: {e}"),
            })?;
        if parsed.answers(id) {
            Ok(parsed)
        } else {
            Err(McpError::InvalidResponse {
                server: self.server_name.clone(),
                reason: format!("response id does not match request {id}"),
            })
        }
    }

    async fn read_sse_response(
        &self,
        resp: reqwest::Response,
        id: u64,
    ) -> Result<JsonRpcResponse, McpError> {
        let mut decoder = SseDecoder::default();
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| self.transport_error(format!("stream read error: {e}")))?;
            for event in decoder.push(&bytes) {
                if let Some(found) = match_response(&event.data, id) {
                    return Ok(found);
                }
            }
        }
        if let Some(found) = decoder.finish().and_then(|e| match_response(&e.data, id)) {
            return Ok(found);
        }

        Err(McpError::InvalidResponse {
            server: self.server_name.clone(),
            reason: "event stream ended without a response".into(),
        })
    }

    /// Send a notification. Servers answer 202, but any 2xx is accepted.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let resp = self
            .post()
            .json(&JsonRpcNotification::new(method, params))
            .send()
            .await
            .map_err(|e| self.transport_error(format!("notification failed: {e}")))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(self.transport_error(format!("notification returned HTTP {}", resp.status())))
        }
    }

    /// Release the server-side session, if one was assigned.
    pub async fn close(&self) -> Result<(), McpError> {
        let Some(sid) = self.session_id.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Ok(());
        };

        let resp = self
            .http
            .delete(self.endpoint.clone())
            .header(SESSION_HEADER, sid)
            .timeout(TCP_CONNECT_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(format!("session delete failed: {e}")))?;

        // 405 means the server does not support explicit termination.
        match resp.status() {
            s if s.is_success() || s == StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            s => Err(self.transport_error(format!("session delete returned HTTP {s}"))),
        }
    }
}

fn match_response(data: &str, id: u64) -> Option<JsonRpcResponse> {
    serde_json::from_str::<JsonRpcResponse>(data)
        .ok()
        .filter(|r| r.answers(id))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
