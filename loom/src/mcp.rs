//! `MCPServerManager`: per-workspace pool of MCP tool-provider connections
//! with signature-based cache invalidation, leases, and idle eviction
//! (spec §4.9).

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mcp_client::stdio::{JsonRpcMessage, StdioClientTransport, StdioServerParameters, StdioStream};
use mcp_core::{MessageId, NotificationMessage, RequestMessage, ResultMessage};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::block_in_place;

use crate::error::McpError;

const IDLE_EVICTION_INTERVAL: Duration = Duration::from_secs(60);
const IDLE_EVICTION_THRESHOLD: Duration = Duration::from_secs(10 * 60);
const MCP_PROTOCOL_VERSION: &str = "2025-11-25";

#[derive(Debug, Clone)]
pub enum Transport {
    Stdio { command: String, args: Vec<String>, env: Vec<(String, String)> },
    Http { url: String, headers: Vec<(String, String)> },
    Sse { url: String, headers: Vec<(String, String)> },
    /// Tries HTTP first; falls back to SSE on 400/404/405.
    Auto { url: String, headers: Vec<(String, String)> },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub transport: Transport,
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Computes a stable signature for cache invalidation from
/// {transport, command|url, resolved headers (secrets redacted), oauth presence}.
fn signature_for(config: &ServerConfig, oauth_token_present: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config.name.as_bytes());
    match &config.transport {
        Transport::Stdio { command, args, env } => {
            hasher.update(b"stdio");
            hasher.update(command.as_bytes());
            for a in args {
                hasher.update(a.as_bytes());
            }
            let mut keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
            keys.sort_unstable();
            for k in keys {
                hasher.update(k.as_bytes()); // names only; values are secrets
            }
        }
        Transport::Http { url, headers } | Transport::Sse { url, headers } | Transport::Auto { url, headers } => {
            hasher.update(b"remote");
            hasher.update(url.as_bytes());
            let mut keys: Vec<&str> = headers.iter().map(|(k, _)| k.as_str()).collect();
            keys.sort_unstable();
            for k in keys {
                hasher.update(k.as_bytes());
            }
        }
    }
    hasher.update([oauth_token_present as u8]);
    format!("{:x}", hasher.finalize())
}

/// Tool-name namespacing: `<server>_<tool>`, provider-safe (`[A-Za-z0-9_-]`),
/// truncated to 64 chars with a deterministic hash suffix on collision.
fn namespaced_tool_name(server_name: &str, tool_name: &str, used: &mut std::collections::HashSet<String>) -> String {
    let raw = format!("{server_name}_{tool_name}");
    let sanitized: String = raw.chars().map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' }).collect();
    let mut candidate = if sanitized.len() > 64 { sanitized[..64].to_string() } else { sanitized.clone() };
    if used.contains(&candidate) {
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        let suffix = format!("{:x}", hasher.finalize());
        let suffix = &suffix[..8];
        let base_len = 64usize.saturating_sub(suffix.len() + 1);
        let base = if sanitized.len() > base_len { &sanitized[..base_len] } else { &sanitized[..] };
        candidate = format!("{base}_{suffix}");
    }
    used.insert(candidate.clone());
    candidate
}

struct StdioConnection {
    transport: StdioClientTransport,
    receiver: mpsc::UnboundedReceiver<JsonRpcMessage>,
    closed: bool,
}

impl StdioConnection {
    fn spawn(command: &str, args: &[String], env: &[(String, String)]) -> Result<Self, McpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut params = StdioServerParameters::new(command).args(args.to_vec()).stderr(StdioStream::Null);
        if !env.is_empty() {
            params = params.env(env.to_vec());
        }
        let mut transport = StdioClientTransport::new(params);
        transport.on_message(move |msg| {
            let _ = tx.send(msg);
        });
        transport.on_error(|_e| {});
        transport.start().map_err(|e| McpError::Transport { server: command.to_string(), message: e.to_string() })?;
        Ok(Self { transport, receiver: rx, closed: false })
    }

    fn request(&mut self, id: &str, method: &str, params: Value) -> Result<Option<ResultMessage>, McpError> {
        let req = RequestMessage::new(id, method, params);
        self.transport
            .send(&JsonRpcMessage::Request(req))
            .map_err(|e| McpError::Transport { server: "stdio".into(), message: e.to_string() })?;
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            if Instant::now() >= deadline {
                return Ok(None);
            }
            match self.receiver.try_recv() {
                Ok(JsonRpcMessage::Result(msg)) if msg.id.as_str() == Some(id) => return Ok(Some(msg)),
                Ok(JsonRpcMessage::Request(req)) if req.method == "roots/list" => {
                    let result = ResultMessage::success(req.id.clone(), json!({ "roots": [] }));
                    let _ = self.transport.send(&JsonRpcMessage::Result(result));
                }
                Ok(_) => {}
                Err(mpsc::error::TryRecvError::Empty) => std::thread::sleep(Duration::from_millis(10)),
                Err(mpsc::error::TryRecvError::Disconnected) => return Ok(None),
            }
        }
    }

    fn initialize(&mut self) -> Result<(), McpError> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": { "name": "mux-mcp", "version": env!("CARGO_PKG_VERSION") }
        });
        match self.request("mux-mcp-init", "initialize", params)? {
            Some(result) if result.error.is_none() => {
                let notif = JsonRpcMessage::Notification(NotificationMessage::new("notifications/initialized", Some(json!({}))));
                let _ = self.transport.send(&notif);
                Ok(())
            }
            Some(result) => Err(McpError::Transport {
                server: "stdio".into(),
                message: result.error.map(|e| e.message).unwrap_or_else(|| "initialize failed".into()),
            }),
            None => Err(McpError::ConnectTimeout("stdio".into())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponseBody {
    result: Option<Value>,
    error: Option<JsonRpcErrorBody>,
}

fn parse_rpc_body(body: &str, content_type: Option<&str>) -> Result<JsonRpcResponseBody, McpError> {
    let is_sse = content_type.map(|c| c.contains("text/event-stream")).unwrap_or(false);
    if !is_sse {
        return serde_json::from_str(body).map_err(|e| McpError::Transport { server: "http".into(), message: e.to_string() });
    }
    for line in body.lines() {
        if let Some(data) = line.strip_prefix("data: ") {
            if let Ok(r) = serde_json::from_str::<JsonRpcResponseBody>(data) {
                if r.result.is_some() || r.error.is_some() {
                    return Ok(r);
                }
            }
        }
    }
    Err(McpError::Transport { server: "http".into(), message: "no JSON-RPC response in SSE body".into() })
}

struct HttpConnection {
    client: Client,
    url: String,
    headers: Vec<(String, String)>,
    closed: bool,
    auto_fallback_used: bool,
}

impl HttpConnection {
    async fn connect(url: &str, headers: &[(String, String)], prefer_sse_accept: bool) -> Result<Self, McpError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| McpError::Transport { server: url.to_string(), message: e.to_string() })?;
        let mut conn = Self { client, url: url.to_string(), headers: headers.to_vec(), closed: false, auto_fallback_used: false };
        conn.initialize(prefer_sse_accept).await?;
        Ok(conn)
    }

    async fn post(&self, body: Value) -> Result<(reqwest::StatusCode, Option<String>, String), McpError> {
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", MCP_PROTOCOL_VERSION)
            .json(&body);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().await.map_err(|e| McpError::Transport { server: self.url.clone(), message: e.to_string() })?;
        let status = resp.status();
        let content_type = resp.headers().get("content-type").and_then(|v| v.to_str().ok()).map(String::from);
        let text = resp.text().await.unwrap_or_default();
        Ok((status, content_type, text))
    }

    async fn initialize(&mut self, _prefer_sse_accept: bool) -> Result<(), McpError> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": { "name": "mux-mcp", "version": env!("CARGO_PKG_VERSION") }
        });
        let request = RequestMessage::new("mux-mcp-init", "initialize", params);
        let (status, _content_type, _text) = self
            .post(serde_json::to_value(&request).map_err(|e| McpError::Transport { server: self.url.clone(), message: e.to_string() })?)
            .await?;
        if matches!(status.as_u16(), 400 | 404 | 405) {
            return Err(McpError::Transport { server: self.url.clone(), message: format!("initialize HTTP {status}") });
        }
        if !status.is_success() && status != reqwest::StatusCode::ACCEPTED {
            return Err(McpError::Transport { server: self.url.clone(), message: format!("initialize HTTP {status}") });
        }
        let notification = NotificationMessage::new("notifications/initialized", Some(json!({})));
        let _ = self.post(serde_json::to_value(&notification).unwrap()).await;
        Ok(())
    }

    async fn request(&self, id: &str, method: &str, params: Value) -> Result<ResultMessage, McpError> {
        let req = RequestMessage::new(id, method, params);
        let (status, content_type, text) = self
            .post(serde_json::to_value(&req).map_err(|e| McpError::Transport { server: self.url.clone(), message: e.to_string() })?)
            .await?;
        if !status.is_success() {
            return Err(McpError::Transport { server: self.url.clone(), message: format!("HTTP {status}") });
        }
        let parsed = parse_rpc_body(&text, content_type.as_deref())?;
        if let Some(err) = parsed.error {
            return Ok(ResultMessage::failure(MessageId::from(id), mcp_core::ErrorObject::new(-32000, err.message, None)));
        }
        Ok(ResultMessage::success(MessageId::from(id), parsed.result.unwrap_or(Value::Null)))
    }
}

enum ServerConnection {
    Stdio(StdMutex<StdioConnection>),
    Http(HttpConnection),
}

struct PooledServer {
    connection: ServerConnection,
    server_name: String,
}

struct WorkspacePool {
    signature: String,
    lease_count: u32,
    last_activity: Instant,
    servers: HashMap<String, PooledServer>,
    tool_index: HashMap<String, (String, String)>, // namespaced -> (server, raw tool name)
    auto_fallback_used: bool,
}

pub struct GetToolsRequest<'a> {
    pub workspace_id: &'a str,
    pub servers: Vec<ServerConfig>,
    pub oauth_token_present: bool,
}

pub struct McpServerManager {
    pools: DashMap<String, WorkspacePool>,
}

impl Default for McpServerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl McpServerManager {
    pub fn new() -> Self {
        Self { pools: DashMap::new() }
    }

    fn combined_signature(servers: &[ServerConfig], oauth_token_present: bool) -> String {
        let mut names: Vec<(String, String)> =
            servers.iter().map(|s| (s.name.clone(), signature_for(s, oauth_token_present))).collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));
        let mut hasher = Sha256::new();
        for (name, sig) in names {
            hasher.update(name.as_bytes());
            hasher.update(sig.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    async fn start_server(config: &ServerConfig) -> Result<ServerConnection, McpError> {
        match &config.transport {
            Transport::Stdio { command, args, env } => {
                let command = command.clone();
                let args = args.clone();
                let env = env.clone();
                let conn = block_in_place(|| -> Result<StdioConnection, McpError> {
                    let mut conn = StdioConnection::spawn(&command, &args, &env)?;
                    conn.initialize()?;
                    Ok(conn)
                })?;
                Ok(ServerConnection::Stdio(StdMutex::new(conn)))
            }
            Transport::Http { url, headers } => Ok(ServerConnection::Http(HttpConnection::connect(url, headers, false).await?)),
            Transport::Sse { url, headers } => Ok(ServerConnection::Http(HttpConnection::connect(url, headers, true).await?)),
            Transport::Auto { url, headers } => match HttpConnection::connect(url, headers, false).await {
                Ok(conn) => Ok(ServerConnection::Http(conn)),
                Err(_) => {
                    let mut conn = HttpConnection::connect(url, headers, true).await?;
                    conn.auto_fallback_used = true;
                    Ok(ServerConnection::Http(conn))
                }
            },
        }
    }

    async fn list_tools(server_name: &str, conn: &ServerConnection) -> Result<Vec<ToolSpec>, McpError> {
        let result = match conn {
            ServerConnection::Stdio(mutex) => {
                let result = block_in_place(|| {
                    mutex.lock().unwrap().request("mux-tools-list", "tools/list", Value::Object(serde_json::Map::new()))
                })?;
                result.ok_or_else(|| McpError::Transport { server: server_name.to_string(), message: "timeout".into() })?
            }
            ServerConnection::Http(http) => http.request("mux-tools-list", "tools/list", Value::Object(serde_json::Map::new())).await?,
        };
        if let Some(err) = result.error {
            return Err(McpError::Transport { server: server_name.to_string(), message: err.message });
        }
        let tools = result
            .result
            .and_then(|r| r.get("tools").cloned())
            .and_then(|t| t.as_array().cloned())
            .unwrap_or_default();
        Ok(tools
            .into_iter()
            .filter_map(|t| {
                let obj = t.as_object()?;
                Some(ToolSpec {
                    name: obj.get("name")?.as_str()?.to_string(),
                    description: obj.get("description").and_then(|v| v.as_str()).map(String::from),
                    input_schema: obj.get("inputSchema").cloned().unwrap_or(Value::Object(serde_json::Map::new())),
                })
            })
            .collect())
    }

    /// Resolves enabled servers to a namespaced tool map, reusing the cached
    /// pool when the signature is unchanged and no instance is closed.
    pub async fn get_tools_for_workspace(&self, req: GetToolsRequest<'_>) -> Result<Vec<(String, ToolSpec)>, McpError> {
        let signature = Self::combined_signature(&req.servers, req.oauth_token_present);
        let has_lease = self.pools.get(req.workspace_id).map(|p| p.lease_count > 0).unwrap_or(false);

        let needs_rebuild = match self.pools.get(req.workspace_id) {
            Some(pool) => pool.signature != signature && !has_lease,
            None => true,
        };

        if needs_rebuild {
            let mut servers = HashMap::new();
            let mut tool_index = HashMap::new();
            let mut used_names = std::collections::HashSet::new();
            let mut auto_fallback_used = false;
            for config in &req.servers {
                let connection = Self::start_server(config).await?;
                let tools = Self::list_tools(&config.name, &connection).await?;
                if let ServerConnection::Http(h) = &connection {
                    auto_fallback_used |= h.auto_fallback_used;
                }
                for tool in tools {
                    let namespaced = namespaced_tool_name(&config.name, &tool.name, &mut used_names);
                    tool_index.insert(namespaced, (config.name.clone(), tool.name));
                }
                servers.insert(config.name.clone(), PooledServer { connection, server_name: config.name.clone() });
            }
            self.pools.insert(
                req.workspace_id.to_string(),
                WorkspacePool { signature, lease_count: 0, last_activity: Instant::now(), servers, tool_index, auto_fallback_used },
            );
        } else if has_lease {
            // Signature changed but a lease is held: restart only closed
            // instances, keep the pool shape stable for the in-flight stream.
            let mut pool = self.pools.get_mut(req.workspace_id).unwrap();
            let closed_servers: Vec<String> = pool
                .servers
                .iter()
                .filter(|(_, s)| matches!(&s.connection, ServerConnection::Stdio(m) if m.lock().map(|g| g.closed).unwrap_or(true)))
                .map(|(name, _)| name.clone())
                .collect();
            for name in closed_servers {
                if let Some(config) = req.servers.iter().find(|c| &c.name == &name) {
                    if let Ok(connection) = Self::start_server(config).await {
                        pool.servers.insert(name.clone(), PooledServer { connection, server_name: name });
                    }
                }
            }
        }

        let enabled_names: std::collections::HashSet<&str> = req.servers.iter().map(|s| s.name.as_str()).collect();
        let mut pool = self.pools.get_mut(req.workspace_id).unwrap();
        pool.last_activity = Instant::now();
        let mut out = Vec::new();
        for (namespaced, (server_name, raw_name)) in &pool.tool_index {
            if !enabled_names.contains(server_name.as_str()) {
                continue; // newly disabled server: hide tools for next stream only
            }
            if let Some(server) = pool.servers.get(server_name) {
                if let ServerConnection::Http(_) | ServerConnection::Stdio(_) = &server.connection {
                    out.push((
                        namespaced.clone(),
                        ToolSpec { name: raw_name.clone(), description: None, input_schema: Value::Object(serde_json::Map::new()) },
                    ));
                }
            }
        }
        Ok(out)
    }

    /// Executes a namespaced tool call; refreshes `lastActivity` even on failure.
    pub async fn call_tool(&self, workspace_id: &str, namespaced_tool: &str, arguments: Value) -> Result<Value, McpError> {
        let (server_name, raw_name) = {
            let mut pool = self.pools.get_mut(workspace_id).ok_or_else(|| McpError::ServerNotConfigured(workspace_id.into()))?;
            pool.last_activity = Instant::now();
            pool.tool_index
                .get(namespaced_tool)
                .cloned()
                .ok_or_else(|| McpError::ToolNotFound(namespaced_tool.to_string()))?
        };

        let pool = self.pools.get(workspace_id).ok_or_else(|| McpError::ServerNotConfigured(workspace_id.into()))?;
        let server = pool.servers.get(&server_name).ok_or_else(|| McpError::ServerNotConfigured(server_name.clone()))?;
        let params = json!({ "name": raw_name, "arguments": arguments });
        let call_id = format!("mux-call-{raw_name}");
        let result = match &server.connection {
            ServerConnection::Stdio(mutex) => {
                block_in_place(|| mutex.lock().unwrap().request(&call_id, "tools/call", params))?
                    .ok_or_else(|| McpError::Transport { server: server_name.clone(), message: "timeout".into() })?
            }
            ServerConnection::Http(http) => http.request(&call_id, "tools/call", params).await?,
        };
        if let Some(err) = result.error {
            return Err(McpError::Transport { server: server_name.clone(), message: err.message });
        }
        Ok(result.result.unwrap_or(Value::Null))
    }

    pub fn acquire_lease(&self, workspace_id: &str) {
        if let Some(mut pool) = self.pools.get_mut(workspace_id) {
            pool.lease_count += 1;
            pool.last_activity = Instant::now();
        }
    }

    pub fn release_lease(&self, workspace_id: &str) {
        if let Some(mut pool) = self.pools.get_mut(workspace_id) {
            pool.lease_count = pool.lease_count.saturating_sub(1);
        }
    }

    pub fn auto_fallback_used(&self, workspace_id: &str) -> bool {
        self.pools.get(workspace_id).map(|p| p.auto_fallback_used).unwrap_or(false)
    }

    /// Stops all servers for a workspace, dropping the cached pool.
    pub fn stop_servers(&self, workspace_id: &str) {
        self.pools.remove(workspace_id);
    }

    /// One tick of the 60s idle-eviction ticker: stops servers for any
    /// workspace with no lease whose `last_activity` is past the threshold.
    pub fn evict_idle(&self) {
        let stale: Vec<String> = self
            .pools
            .iter()
            .filter(|entry| entry.lease_count == 0 && entry.last_activity.elapsed() >= IDLE_EVICTION_THRESHOLD)
            .map(|entry| entry.key().clone())
            .collect();
        for workspace_id in stale {
            self.pools.remove(&workspace_id);
        }
    }

    pub fn idle_eviction_interval() -> Duration {
        IDLE_EVICTION_INTERVAL
    }
}
