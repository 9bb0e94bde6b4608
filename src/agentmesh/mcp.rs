//! MCP client pool.
//!
//! For each configured server the pool maintains at most one live transport
//! driver and at most one in-flight capability discovery. Discovery results
//! (tools, prompts, resources) are memoized per TTL — and optionally on disk
//! via [`CapabilityCache`](crate::agentmesh::capability_cache::CapabilityCache)
//! — so the pool performs at most one live discovery call per `(server, TTL
//! window)`.
//!
//! Concurrency: a single server may process multiple concurrent tool calls
//! up to a configurable per-server cap; excess requests queue FIFO on the
//! server's semaphore. Unrelated servers are never serialized against each
//! other.
//!
//! Failure policy: a tool error *returned by the server* is not a pool-level
//! error — it comes back as a [`ToolOutcome`] with `is_error: true` so the
//! agent can show it to the model. Only transport/protocol failures are pool
//! errors; transport failures are retried with exponential backoff after
//! re-creating the driver, protocol failures surface immediately.
//!
//! # Server configuration
//!
//! Servers are declared in a JSON document; unknown fields are ignored:
//!
//! ```json
//! {
//!   "servers": [
//!     {"id": "files", "transport": "stdio", "command": "mcp-files", "args": ["--root", "/data"]},
//!     {"id": "search", "transport": "sse", "url": "http://search-mcp:8080/mcp"},
//!     {"id": "github", "transport": "http", "url": "https://github-mcp.example.com/mcp"}
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::agentmesh::cancel::run_with_deadline;
use crate::agentmesh::capability_cache::CapabilityCache;
use crate::agentmesh::clients::http_pool::get_shared_http_client;
use crate::agentmesh::config::MeshConfig;
use crate::agentmesh::error::{ErrorKind, MeshError};
use crate::agentmesh::transport::{
    SseTransport, StdioTransport, StreamableHttpTransport, Transport,
};

/// MCP protocol revision sent during the initialize handshake.
const PROTOCOL_VERSION: &str = "2025-03-26";

/// Transport retry bound and backoff base for `call_tool`.
const MAX_TRANSPORT_RETRIES: usize = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Deadline for each discovery request; a hung server must not stall the
/// whole catalogue build.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

async fn discovery_request(
    transport: &Arc<dyn Transport>,
    method: &str,
) -> Result<JsonValue, MeshError> {
    match tokio::time::timeout(
        DISCOVERY_TIMEOUT,
        transport.request(method, serde_json::json!({})),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(MeshError::new(
            ErrorKind::ProtocolError,
            format!("{} timed out", method),
        )),
    }
}

/// Which transport a server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child-process stdio.
    Stdio,
    /// HTTP POST + persistent SSE notification stream.
    Sse,
    /// Streamable HTTP.
    Http,
}

/// One configured MCP server.
///
/// Transport-specific fields: `command`/`args`/`env` for stdio, `url` for
/// the HTTP transports. Unknown JSON fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Stable server identifier used as the tool namespace prefix.
    pub id: String,
    /// Transport selector.
    pub transport: TransportKind,
    /// Executable for stdio servers.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments for stdio servers.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for stdio servers.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Endpoint for SSE / streamable-HTTP servers.
    #[serde(default)]
    pub url: Option<String>,
}

impl ServerConfig {
    /// A stable endpoint string used as the capability-cache key.
    pub fn endpoint(&self) -> String {
        match self.transport {
            TransportKind::Stdio => format!(
                "stdio:{} {}",
                self.command.as_deref().unwrap_or(""),
                self.args.join(" ")
            ),
            TransportKind::Sse | TransportKind::Http => {
                self.url.clone().unwrap_or_default()
            }
        }
    }
}

/// The JSON document enumerating configured servers.
#[derive(Debug, Clone, Deserialize)]
pub struct ServersDocument {
    /// Configured servers in declaration order.
    pub servers: Vec<ServerConfig>,
}

impl ServersDocument {
    /// Parse the configuration document; unknown fields are ignored.
    pub fn from_json(text: &str) -> Result<Self, MeshError> {
        serde_json::from_str(text).map_err(|e| {
            MeshError::with_source(ErrorKind::ProtocolError, "invalid servers document", e)
        })
    }
}

/// A tool advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Bare tool name as the server knows it.
    pub name: String,
    /// Description surfaced to the LLM.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments.
    #[serde(rename = "inputSchema", default = "default_schema")]
    pub input_schema: JsonValue,
}

fn default_schema() -> JsonValue {
    serde_json::json!({"type": "object"})
}

/// A prompt advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptInfo {
    /// Prompt name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
}

/// A resource advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Resource URI.
    pub uri: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// MIME type, when declared.
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
}

/// A snapshot of one server's advertised capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discovery {
    /// Advertised tools.
    pub tools: Vec<ToolInfo>,
    /// Advertised prompts.
    pub prompts: Vec<PromptInfo>,
    /// Advertised resources.
    pub resources: Vec<ResourceInfo>,
    /// When the probe ran; drives TTL expiry.
    pub fetched_at: DateTime<Utc>,
}

/// Result of a tool invocation.
///
/// `is_error: true` means the *server* reported a tool failure; the call
/// itself succeeded at the protocol level and the text should be fed back to
/// the model.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Flattened text content blocks.
    pub content: String,
    /// Structured content, when the server returned any.
    pub structured: Option<JsonValue>,
    /// Server-reported tool failure flag.
    pub is_error: bool,
}

/// Per-server MCP client with connection caching and memoized discovery.
pub struct McpClient {
    config: ServerConfig,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    discovery: RwLock<Option<Discovery>>,
    /// Held while a live probe runs so concurrent callers coalesce onto one
    /// discovery per TTL window.
    discovery_gate: Mutex<()>,
    permits: Arc<Semaphore>,
    ttl: Duration,
    degraded: AtomicBool,
    cache: Option<Arc<CapabilityCache>>,
}

impl McpClient {
    /// Build a client for one configured server.
    pub fn new(
        config: ServerConfig,
        ttl: Duration,
        concurrency: usize,
        cache: Option<Arc<CapabilityCache>>,
    ) -> Self {
        Self {
            config,
            transport: Mutex::new(None),
            discovery: RwLock::new(None),
            discovery_gate: Mutex::new(()),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            ttl,
            degraded: AtomicBool::new(false),
            cache,
        }
    }

    /// The server's configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Whether the last health probe failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn build_transport(&self) -> Result<Arc<dyn Transport>, MeshError> {
        match self.config.transport {
            TransportKind::Stdio => {
                let command = self.config.command.as_deref().ok_or_else(|| {
                    MeshError::new(
                        ErrorKind::ProtocolError,
                        format!("server '{}' is stdio but has no command", self.config.id),
                    )
                })?;
                Ok(Arc::new(StdioTransport::spawn(
                    command,
                    &self.config.args,
                    &self.config.env,
                )?))
            }
            TransportKind::Sse => {
                let url = self.require_url()?;
                Ok(Arc::new(SseTransport::connect(
                    url,
                    get_shared_http_client().clone(),
                )))
            }
            TransportKind::Http => {
                let url = self.require_url()?;
                Ok(Arc::new(StreamableHttpTransport::connect(
                    url,
                    get_shared_http_client().clone(),
                )))
            }
        }
    }

    fn require_url(&self) -> Result<&str, MeshError> {
        self.config.url.as_deref().ok_or_else(|| {
            MeshError::new(
                ErrorKind::ProtocolError,
                format!("server '{}' has no url", self.config.id),
            )
        })
    }

    /// Idempotent connect: reuse the live driver, or create one and run the
    /// initialize handshake.
    pub async fn connect(&self) -> Result<Arc<dyn Transport>, MeshError> {
        let mut guard = self.transport.lock().await;
        if let Some(existing) = guard.as_ref() {
            return Ok(existing.clone());
        }

        let transport = self.build_transport()?;
        let init_params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "agentmesh",
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        transport.request("initialize", init_params).await?;
        transport
            .notify("notifications/initialized", serde_json::json!({}))
            .await?;

        *guard = Some(transport.clone());
        self.degraded.store(false, Ordering::SeqCst);
        Ok(transport)
    }

    /// Drop the live driver so the next call reconnects.
    async fn reset_transport(&self) {
        let mut guard = self.transport.lock().await;
        if let Some(transport) = guard.take() {
            transport.close().await;
        }
    }

    /// Probe health; a failed ping marks the server degraded and exempts it
    /// from routing until the next successful probe.
    pub async fn health_check(&self) -> bool {
        let healthy = match self.connect().await {
            Ok(transport) => transport.ping().await.is_ok(),
            Err(_) => false,
        };
        if !healthy {
            self.reset_transport().await;
        }
        self.degraded.store(!healthy, Ordering::SeqCst);
        healthy
    }

    /// Capability discovery, memoized per TTL window.
    ///
    /// If the cached descriptor is fresh this returns immediately without
    /// touching the transport. At most one live probe runs at a time; callers
    /// arriving during a probe wait on the gate and reuse its result.
    pub async fn discover(&self) -> Result<Discovery, MeshError> {
        if let Some(fresh) = self.fresh_discovery().await {
            return Ok(fresh);
        }

        let _gate = self.discovery_gate.lock().await;
        // Re-check: the probe we waited on may have refreshed the snapshot.
        if let Some(fresh) = self.fresh_discovery().await {
            return Ok(fresh);
        }

        // Disk cache survives process restarts.
        if let Some(cache) = &self.cache {
            if let Some(snapshot) = cache.load(&self.config.id, &self.config.endpoint()) {
                *self.discovery.write().await = Some(snapshot.clone());
                return Ok(snapshot);
            }
        }

        let snapshot = self.probe().await?;
        if let Some(cache) = &self.cache {
            cache.store(&self.config.id, &self.config.endpoint(), &snapshot);
        }
        *self.discovery.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn fresh_discovery(&self) -> Option<Discovery> {
        let guard = self.discovery.read().await;
        let snapshot = guard.as_ref()?;
        let age = Utc::now().signed_duration_since(snapshot.fetched_at);
        if age.to_std().ok()? <= self.ttl {
            Some(snapshot.clone())
        } else {
            None
        }
    }

    /// Drop the memoized discovery (and rely on the next call to re-probe).
    pub async fn invalidate(&self) {
        *self.discovery.write().await = None;
    }

    async fn probe(&self) -> Result<Discovery, MeshError> {
        let transport = self.connect().await?;

        let tools_result = discovery_request(&transport, "tools/list").await?;
        let tools: Vec<ToolInfo> = serde_json::from_value(
            tools_result.get("tools").cloned().unwrap_or(JsonValue::Array(Vec::new())),
        )?;

        // Prompts and resources are optional capabilities; method-not-found
        // simply means the server has none.
        let prompts = match discovery_request(&transport, "prompts/list").await {
            Ok(result) => serde_json::from_value(
                result.get("prompts").cloned().unwrap_or(JsonValue::Array(Vec::new())),
            )
            .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        let resources = match discovery_request(&transport, "resources/list").await {
            Ok(result) => serde_json::from_value(
                result.get("resources").cloned().unwrap_or(JsonValue::Array(Vec::new())),
            )
            .unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        Ok(Discovery {
            tools,
            prompts,
            resources,
            fetched_at: Utc::now(),
        })
    }

    /// List the server's tools (memoized).
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, MeshError> {
        Ok(self.discover().await?.tools)
    }

    /// List the server's prompts (memoized).
    pub async fn list_prompts(&self) -> Result<Vec<PromptInfo>, MeshError> {
        Ok(self.discover().await?.prompts)
    }

    /// List the server's resources (memoized).
    pub async fn list_resources(&self) -> Result<Vec<ResourceInfo>, MeshError> {
        Ok(self.discover().await?.resources)
    }

    /// Invoke a tool with a per-call deadline.
    ///
    /// Transport failures re-create the driver and retry with exponential
    /// backoff up to [`MAX_TRANSPORT_RETRIES`]; protocol errors and timeouts
    /// surface immediately. A queue slot is held for the duration of the
    /// call, bounding per-server concurrency.
    pub async fn call_tool(
        &self,
        tool: &str,
        args: JsonValue,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome, MeshError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| MeshError::new(ErrorKind::Unknown, "server permit pool closed"))?;

        let params = serde_json::json!({
            "name": tool,
            "arguments": args,
        });

        let mut attempt = 0;
        loop {
            let transport = match self.connect().await {
                Ok(transport) => transport,
                Err(err) if err.kind.is_retryable_transport() && attempt < MAX_TRANSPORT_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt as u32 - 1)).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let result = run_with_deadline(cancel, timeout, ErrorKind::ToolTimeout, {
                transport.request("tools/call", params.clone())
            })
            .await;

            match result {
                Ok(value) => return Ok(parse_tool_result(&value)),
                Err(err) if err.kind.is_retryable_transport() && attempt < MAX_TRANSPORT_RETRIES => {
                    log::warn!(
                        "server '{}' transport lost during tools/call (attempt {}); reconnecting",
                        self.config.id,
                        attempt + 1
                    );
                    self.reset_transport().await;
                    attempt += 1;
                    tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt as u32 - 1)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fetch the full prompt text for the virtual `get_prompt` tool.
    pub async fn get_prompt(
        &self,
        name: &str,
        args: Option<JsonValue>,
    ) -> Result<String, MeshError> {
        let transport = self.connect().await?;
        let params = serde_json::json!({
            "name": name,
            "arguments": args.unwrap_or(JsonValue::Object(Default::default())),
        });
        let result = transport.request("prompts/get", params).await?;
        let mut text = String::new();
        if let Some(messages) = result.get("messages").and_then(|m| m.as_array()) {
            for message in messages {
                if let Some(chunk) = message
                    .get("content")
                    .and_then(|c| c.get("text"))
                    .and_then(|t| t.as_str())
                {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(chunk);
                }
            }
        }
        Ok(text)
    }

    /// Read the full resource body for the virtual `get_resource` tool.
    pub async fn read_resource(&self, uri: &str) -> Result<String, MeshError> {
        let transport = self.connect().await?;
        let result = transport
            .request("resources/read", serde_json::json!({"uri": uri}))
            .await?;
        let mut text = String::new();
        if let Some(contents) = result.get("contents").and_then(|c| c.as_array()) {
            for item in contents {
                if let Some(chunk) = item.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(chunk);
                }
            }
        }
        Ok(text)
    }

    /// Close the transport and clear state.
    pub async fn shutdown(&self) {
        self.reset_transport().await;
        self.invalidate().await;
    }
}

/// Flatten a `tools/call` result into a [`ToolOutcome`].
fn parse_tool_result(value: &JsonValue) -> ToolOutcome {
    let is_error = value
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut content = String::new();
    if let Some(blocks) = value.get("content").and_then(|c| c.as_array()) {
        for block in blocks {
            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                if !content.is_empty() {
                    content.push('\n');
                }
                content.push_str(text);
            }
        }
    }

    ToolOutcome {
        content,
        structured: value.get("structuredContent").cloned(),
        is_error,
    }
}

/// One client per configured server.
pub struct McpPool {
    clients: HashMap<String, Arc<McpClient>>,
    order: Vec<String>,
}

impl McpPool {
    /// Build the pool from parsed server configs.
    pub fn new(configs: Vec<ServerConfig>, mesh: &MeshConfig) -> Self {
        let cache = mesh.capability_cache_dir.as_ref().and_then(|dir| {
            match CapabilityCache::open(dir, mesh.capability_ttl) {
                Ok(cache) => Some(Arc::new(cache)),
                Err(err) => {
                    log::warn!("capability cache disabled: {}", err);
                    None
                }
            }
        });

        let mut clients = HashMap::new();
        let mut order = Vec::new();
        for config in configs {
            let id = config.id.clone();
            order.push(id.clone());
            clients.insert(
                id,
                Arc::new(McpClient::new(
                    config,
                    mesh.capability_ttl,
                    mesh.per_server_concurrency,
                    cache.clone(),
                )),
            );
        }
        Self { clients, order }
    }

    /// Borrow a server's client by id.
    pub fn client(&self, server_id: &str) -> Result<Arc<McpClient>, MeshError> {
        self.clients.get(server_id).cloned().ok_or_else(|| {
            MeshError::new(
                ErrorKind::ProtocolError,
                format!("unknown server '{}'", server_id),
            )
        })
    }

    /// Server ids in declaration order.
    pub fn server_ids(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Probe every server's health; degraded servers are exempted from
    /// routing until the next probe.
    pub async fn probe_all(&self) {
        for id in &self.order {
            if let Some(client) = self.clients.get(id) {
                let healthy = client.health_check().await;
                if !healthy {
                    log::warn!("server '{}' is degraded", id);
                }
            }
        }
    }

    /// Close every transport.
    pub async fn shutdown(&self) {
        for client in self.clients.values() {
            client.shutdown().await;
        }
    }
}
