//! MCP transport drivers.
//!
//! Exposes a uniform request/notify surface over the three MCP transports:
//!
//! - **stdio** — spawn a child process and pipe newline-delimited JSON-RPC
//!   2.0 over its stdin/stdout.
//! - **HTTP + SSE** — POST requests to an endpoint; a persistent GET stream
//!   delivers server-to-client notifications (tool progress, cancellations).
//! - **streamable HTTP** — a single endpoint carrying framed JSON-RPC; each
//!   POST may answer as plain JSON or as an SSE body, and a server-assigned
//!   `Mcp-Session-Id` is echoed on subsequent requests.
//!
//! A driver that loses its peer (child exit, broken pipe, dropped stream)
//! marks itself lost and fails every in-flight and subsequent request with
//! [`ErrorKind::TransportLost`]; the MCP client reacts by re-creating the
//! driver and retrying with backoff. Health is probed with a JSON-RPC
//! `ping`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::agentmesh::error::{ErrorKind, MeshError};

/// JSON-RPC error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    pub data: Option<JsonValue>,
}

impl JsonRpcError {
    /// Map a JSON-RPC error into the crate taxonomy.
    ///
    /// Server-side tool failures surface through the `tools/call` result
    /// payload, not here, so everything arriving as a JSON-RPC error object
    /// is a protocol-level failure.
    pub fn into_mesh_error(self) -> MeshError {
        MeshError::new(
            ErrorKind::ProtocolError,
            format!("JSON-RPC error {}: {}", self.code, self.message),
        )
    }
}

/// Incoming JSON-RPC frame: a response (`id` + `result`/`error`) or a
/// server-initiated notification/request (`method`).
#[derive(Debug, Deserialize)]
struct IncomingFrame {
    id: Option<JsonValue>,
    result: Option<JsonValue>,
    error: Option<JsonRpcError>,
    method: Option<String>,
    params: Option<JsonValue>,
}

/// A server-to-client notification.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Notification method, e.g. `"notifications/progress"`.
    pub method: String,
    /// Notification parameters.
    pub params: JsonValue,
}

/// Uniform send surface over the three MCP transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and await its response value.
    async fn request(&self, method: &str, params: JsonValue) -> Result<JsonValue, MeshError>;

    /// Send a fire-and-forget notification.
    async fn notify(&self, method: &str, params: JsonValue) -> Result<(), MeshError>;

    /// Subscribe to server-to-client notifications.
    fn notifications(&self) -> broadcast::Receiver<Notification>;

    /// Health probe. The default sends a JSON-RPC `ping`.
    async fn ping(&self) -> Result<(), MeshError> {
        self.request("ping", serde_json::json!({})).await.map(|_| ())
    }

    /// Tear the connection down. Idempotent.
    async fn close(&self);
}

fn request_body(id: u64, method: &str, params: &JsonValue) -> JsonValue {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

fn notification_body(method: &str, params: &JsonValue) -> JsonValue {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<JsonValue, MeshError>>>>>;

/// Fail every in-flight request with `transport_lost`.
async fn drain_pending(pending: &PendingMap) {
    let mut guard = pending.lock().await;
    for (_, sender) in guard.drain() {
        let _ = sender.send(Err(MeshError::new(
            ErrorKind::TransportLost,
            "connection lost before response arrived",
        )));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// stdio
// ─────────────────────────────────────────────────────────────────────────────

/// Child-process stdio transport: newline-delimited JSON-RPC 2.0.
pub struct StdioTransport {
    stdin: Mutex<tokio::process::ChildStdin>,
    child: Mutex<tokio::process::Child>,
    pending: PendingMap,
    notif_tx: broadcast::Sender<Notification>,
    next_id: AtomicU64,
    lost: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Spawn `command args...` with the given extra environment and start the
    /// reader task.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, MeshError> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            MeshError::with_source(
                ErrorKind::TransportLost,
                format!("failed to spawn '{}'", command),
                e,
            )
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MeshError::new(ErrorKind::TransportLost, "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MeshError::new(ErrorKind::TransportLost, "child stdout unavailable"))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (notif_tx, _) = broadcast::channel(64);
        let lost = Arc::new(AtomicBool::new(false));

        // Reader task: routes responses to their waiters and notifications to
        // subscribers until the child closes its stdout.
        let reader_pending = pending.clone();
        let reader_tx = notif_tx.clone();
        let reader_lost = lost.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        route_frame(&line, &reader_pending, &reader_tx).await;
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            reader_lost.store(true, Ordering::SeqCst);
            drain_pending(&reader_pending).await;
        });

        Ok(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending,
            notif_tx,
            next_id: AtomicU64::new(1),
            lost,
        })
    }

    fn check_alive(&self) -> Result<(), MeshError> {
        if self.lost.load(Ordering::SeqCst) {
            Err(MeshError::new(
                ErrorKind::TransportLost,
                "child process is gone",
            ))
        } else {
            Ok(())
        }
    }

    async fn write_line(&self, body: &JsonValue) -> Result<(), MeshError> {
        let mut line = serde_json::to_string(body)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        // A dead child surfaces as EPIPE here (the runtime masks SIGPIPE);
        // treat it as a lost transport, not a crash.
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            self.lost.store(true, Ordering::SeqCst);
            drain_pending(&self.pending).await;
            return Err(MeshError::with_source(
                ErrorKind::TransportLost,
                "write to child failed",
                e,
            ));
        }
        stdin
            .flush()
            .await
            .map_err(|e| MeshError::with_source(ErrorKind::TransportLost, "flush failed", e))
    }
}

async fn route_frame(line: &str, pending: &PendingMap, notif_tx: &broadcast::Sender<Notification>) {
    let frame: IncomingFrame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(err) => {
            log::warn!("discarding unparsable JSON-RPC frame: {}", err);
            return;
        }
    };

    if let Some(method) = frame.method {
        let _ = notif_tx.send(Notification {
            method,
            params: frame.params.unwrap_or(JsonValue::Null),
        });
        return;
    }

    let id = frame.id.as_ref().and_then(|v| v.as_u64());
    if let Some(id) = id {
        let waiter = pending.lock().await.remove(&id);
        if let Some(sender) = waiter {
            let outcome = match frame.error {
                Some(err) => Err(err.into_mesh_error()),
                None => Ok(frame.result.unwrap_or(JsonValue::Null)),
            };
            let _ = sender.send(outcome);
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: JsonValue) -> Result<JsonValue, MeshError> {
        self.check_alive()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(err) = self.write_line(&request_body(id, method, &params)).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        rx.await.unwrap_or_else(|_| {
            Err(MeshError::new(
                ErrorKind::TransportLost,
                "response channel closed",
            ))
        })
    }

    async fn notify(&self, method: &str, params: JsonValue) -> Result<(), MeshError> {
        self.check_alive()?;
        self.write_line(&notification_body(method, &params)).await
    }

    fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notif_tx.subscribe()
    }

    async fn close(&self) {
        self.lost.store(true, Ordering::SeqCst);
        drain_pending(&self.pending).await;
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP + SSE
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP+SSE transport: POST per request, persistent GET for notifications.
pub struct SseTransport {
    client: reqwest::Client,
    endpoint: String,
    notif_tx: broadcast::Sender<Notification>,
    next_id: AtomicU64,
    stream_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    lost: Arc<AtomicBool>,
}

impl SseTransport {
    /// Connect to `endpoint` and start the notification stream.
    pub fn connect(endpoint: &str, client: reqwest::Client) -> Self {
        let (notif_tx, _) = broadcast::channel(64);
        let lost = Arc::new(AtomicBool::new(false));

        let stream_client = client.clone();
        let stream_endpoint = endpoint.to_string();
        let stream_tx = notif_tx.clone();
        let stream_lost = lost.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) =
                run_notification_stream(&stream_client, &stream_endpoint, &stream_tx).await
            {
                log::warn!("SSE notification stream ended: {}", err);
            }
            stream_lost.store(true, Ordering::SeqCst);
        });

        Self {
            client,
            endpoint: endpoint.to_string(),
            notif_tx,
            next_id: AtomicU64::new(1),
            stream_task: Mutex::new(Some(handle)),
            lost,
        }
    }
}

async fn run_notification_stream(
    client: &reqwest::Client,
    endpoint: &str,
    notif_tx: &broadcast::Sender<Notification>,
) -> Result<(), MeshError> {
    use futures_util::StreamExt;

    let resp = client
        .get(endpoint)
        .header("Accept", "text/event-stream")
        .send()
        .await
        .map_err(|e| MeshError::with_source(ErrorKind::TransportLost, "SSE connect failed", e))?;

    let mut stream = resp.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| MeshError::with_source(ErrorKind::TransportLost, "SSE read failed", e))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        // SSE frames are separated by a blank line.
        while let Some(pos) = buffer.find("\n\n") {
            let frame: String = buffer.drain(..pos + 2).collect();
            for data in sse_data_lines(&frame) {
                if let Ok(incoming) = serde_json::from_str::<IncomingFrame>(&data) {
                    if let Some(method) = incoming.method {
                        let _ = notif_tx.send(Notification {
                            method,
                            params: incoming.params.unwrap_or(JsonValue::Null),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

/// Collect the concatenated `data:` lines of one SSE frame.
fn sse_data_lines(frame: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for line in frame.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(data);
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, method: &str, params: JsonValue) -> Result<JsonValue, MeshError> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(MeshError::new(
                ErrorKind::TransportLost,
                "notification stream is gone",
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request_body(id, method, &params))
            .send()
            .await
            .map_err(|e| MeshError::with_source(ErrorKind::TransportLost, "POST failed", e))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| MeshError::with_source(ErrorKind::TransportLost, "body read failed", e))?;

        if !(200..300).contains(&status) {
            return Err(MeshError::new(
                ErrorKind::ProtocolError,
                format!("HTTP {} from MCP server: {}", status, text),
            ));
        }

        let frame: IncomingFrame = serde_json::from_str(&text)?;
        match frame.error {
            Some(err) => Err(err.into_mesh_error()),
            None => Ok(frame.result.unwrap_or(JsonValue::Null)),
        }
    }

    async fn notify(&self, method: &str, params: JsonValue) -> Result<(), MeshError> {
        self.client
            .post(&self.endpoint)
            .json(&notification_body(method, &params))
            .send()
            .await
            .map_err(|e| MeshError::with_source(ErrorKind::TransportLost, "POST failed", e))?;
        Ok(())
    }

    fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notif_tx.subscribe()
    }

    async fn close(&self) {
        self.lost.store(true, Ordering::SeqCst);
        if let Some(handle) = self.stream_task.lock().await.take() {
            handle.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streamable HTTP
// ─────────────────────────────────────────────────────────────────────────────

/// Streamable HTTP transport: one endpoint, each POST answered as plain JSON
/// or as an SSE body; `Mcp-Session-Id` from the server is echoed back.
pub struct StreamableHttpTransport {
    client: reqwest::Client,
    endpoint: String,
    session_id: std::sync::Mutex<Option<String>>,
    notif_tx: broadcast::Sender<Notification>,
    next_id: AtomicU64,
}

impl StreamableHttpTransport {
    /// Connect to a streamable-HTTP MCP endpoint.
    pub fn connect(endpoint: &str, client: reqwest::Client) -> Self {
        let (notif_tx, _) = broadcast::channel(64);
        Self {
            client,
            endpoint: endpoint.to_string(),
            session_id: std::sync::Mutex::new(None),
            notif_tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Find the response frame for `id` in a body that is either a single
    /// JSON object or an SSE stream; broadcast any notification frames seen
    /// along the way.
    fn parse_response_body(
        &self,
        body: &str,
        content_type: Option<&str>,
        id: u64,
    ) -> Result<JsonValue, MeshError> {
        let is_sse = content_type.map(|s| s.contains("text/event-stream")).unwrap_or(false);

        if !is_sse {
            let frame: IncomingFrame = serde_json::from_str(body)?;
            return match frame.error {
                Some(err) => Err(err.into_mesh_error()),
                None => Ok(frame.result.unwrap_or(JsonValue::Null)),
            };
        }

        for block in body.split("\n\n") {
            for data in sse_data_lines(block) {
                let frame: IncomingFrame = match serde_json::from_str(&data) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                if let Some(method) = frame.method {
                    let _ = self.notif_tx.send(Notification {
                        method,
                        params: frame.params.unwrap_or(JsonValue::Null),
                    });
                    continue;
                }
                if frame.id.as_ref().and_then(|v| v.as_u64()) == Some(id) {
                    return match frame.error {
                        Some(err) => Err(err.into_mesh_error()),
                        None => Ok(frame.result.unwrap_or(JsonValue::Null)),
                    };
                }
            }
        }
        Err(MeshError::new(
            ErrorKind::ProtocolError,
            "SSE body contained no response for request",
        ))
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn request(&self, method: &str, params: JsonValue) -> Result<JsonValue, MeshError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json, text/event-stream")
            .json(&request_body(id, method, &params));

        if let Some(session) = self.session_id.lock().expect("session id poisoned").clone() {
            req = req.header("Mcp-Session-Id", session);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| MeshError::with_source(ErrorKind::TransportLost, "POST failed", e))?;

        if let Some(session) = resp
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().expect("session id poisoned") = Some(session.to_string());
        }

        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let text = resp
            .text()
            .await
            .map_err(|e| MeshError::with_source(ErrorKind::TransportLost, "body read failed", e))?;

        if !(200..300).contains(&status) {
            return Err(MeshError::new(
                ErrorKind::ProtocolError,
                format!("HTTP {} from MCP server: {}", status, text),
            ));
        }

        self.parse_response_body(&text, content_type.as_deref(), id)
    }

    async fn notify(&self, method: &str, params: JsonValue) -> Result<(), MeshError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json, text/event-stream")
            .json(&notification_body(method, &params));
        if let Some(session) = self.session_id.lock().expect("session id poisoned").clone() {
            req = req.header("Mcp-Session-Id", session);
        }
        req.send()
            .await
            .map_err(|e| MeshError::with_source(ErrorKind::TransportLost, "POST failed", e))?;
        Ok(())
    }

    fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notif_tx.subscribe()
    }

    async fn close(&self) {}
}
