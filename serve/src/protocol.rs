//! Wire protocol DTOs: one JSON object per WebSocket text frame, tagged by
//! `type`. Covers `run` / `stream_event`, `tools_list` / `tool_show`, and
//! `ping` / `pong`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ClientRequest {
    Run(RunRequest),
    ToolsList(ToolsListRequest),
    ToolShow(ToolShowRequest),
    Ping(PingRequest),
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RunRequest {
    pub id: String,
    pub workspace_id: String,
    pub message: String,
    #[serde(default)]
    pub file_mentions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum TransportWire {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Vec<(String, String)>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
    Auto {
        url: String,
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
}

impl From<TransportWire> for loom::mcp::Transport {
    fn from(w: TransportWire) -> Self {
        match w {
            TransportWire::Stdio { command, args, env } => loom::mcp::Transport::Stdio { command, args, env },
            TransportWire::Http { url, headers } => loom::mcp::Transport::Http { url, headers },
            TransportWire::Sse { url, headers } => loom::mcp::Transport::Sse { url, headers },
            TransportWire::Auto { url, headers } => loom::mcp::Transport::Auto { url, headers },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ServerConfigWire {
    pub name: String,
    pub transport: TransportWire,
}

impl From<ServerConfigWire> for loom::mcp::ServerConfig {
    fn from(w: ServerConfigWire) -> Self {
        loom::mcp::ServerConfig {
            name: w.name,
            transport: w.transport.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ToolsListRequest {
    pub id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub servers: Vec<ServerConfigWire>,
    #[serde(default)]
    pub oauth_token_present: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ToolShowOutput {
    Json,
    Yaml,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ToolShowRequest {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(default)]
    pub servers: Vec<ServerConfigWire>,
    #[serde(default)]
    pub oauth_token_present: bool,
    #[serde(default)]
    pub output: Option<ToolShowOutput>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PingRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ServerResponse {
    RunStarted(RunStartedResponse),
    CompactionDeferred(CompactionDeferredResponse),
    StreamEvent(StreamEventResponse),
    ToolsList(ToolsListResponse),
    ToolShow(ToolShowResponse),
    Pong(PongResponse),
    Error(ErrorResponse),
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct RunStartedResponse {
    pub id: String,
    pub message_id: String,
    pub compaction_warning: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CompactionDeferredResponse {
    pub id: String,
    pub compaction_request_message_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct StreamEventResponse {
    pub id: String,
    #[serde(flatten)]
    pub envelope: Value,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ToolSpecWire {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ToolsListResponse {
    pub id: String,
    pub tools: Vec<ToolSpecWire>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ToolShowResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_yaml: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct PongResponse {
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ErrorResponse {
    pub id: Option<String>,
    pub error: String,
}
