//! Per-service error enums (spec §7 "Error handling design").
//!
//! Each service gets its own small `thiserror` enum rather than one
//! catch-all; `StreamErrorKind` (from `stream-event`) is the taxonomy used
//! for UI-facing classification and is produced by [`StreamError::kind`].

use stream_event::StreamErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryStoreError {
    #[error("io error for workspace {workspace_id}: {source}")]
    Io {
        workspace_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("message {id} not found in workspace {workspace_id}")]
    NotFound { workspace_id: String, id: String },
    #[error("corrupt history for workspace {workspace_id}: {reason}")]
    Corrupt { workspace_id: String, reason: String },
}

#[derive(Error, Debug)]
pub enum PartialStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize partial: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("partial message missing historySequence")]
    MissingHistorySequence,
}

#[derive(Error, Debug)]
pub enum CompactionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize post-compaction cache: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    History(#[from] HistoryStoreError),
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("no active stream for workspace {0}")]
    NotStreaming(String),
    #[error("stream already starting for workspace {0}")]
    AlreadyStreaming(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("previous response not found: {0}")]
    PreviousResponseNotFound(String),
    #[error("context window exceeded")]
    ContextExceeded,
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("quota exhausted: {0}")]
    Quota(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("unknown stream error: {0}")]
    Unknown(String),
    #[error(transparent)]
    History(#[from] HistoryStoreError),
}

impl StreamError {
    pub fn kind(&self) -> StreamErrorKind {
        match self {
            StreamError::NotStreaming(_) => StreamErrorKind::NotStreaming,
            StreamError::AlreadyStreaming(_) => StreamErrorKind::AlreadyStreaming,
            StreamError::ModelNotFound(_) => StreamErrorKind::ModelNotFound,
            StreamError::PreviousResponseNotFound(_) => StreamErrorKind::PreviousResponseNotFound,
            StreamError::ContextExceeded => StreamErrorKind::ContextExceeded,
            StreamError::RateLimit(_) => StreamErrorKind::RateLimit,
            StreamError::Quota(_) => StreamErrorKind::Quota,
            StreamError::Auth(_) => StreamErrorKind::Auth,
            StreamError::Network(_) => StreamErrorKind::Network,
            StreamError::Io(_) => StreamErrorKind::Io,
            StreamError::Invalid(_) => StreamErrorKind::Invalid,
            StreamError::Unknown(_) => StreamErrorKind::Unknown,
            StreamError::History(_) => StreamErrorKind::Unknown,
        }
    }
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("parent workspace {0} not found")]
    ParentNotFound(String),
    #[error("task nesting depth {depth} exceeds max {max}")]
    DepthExceeded { depth: usize, max: usize },
    #[error("agent {0} is not runnable; runnable agents: {1:?}")]
    AgentNotRunnable(String, Vec<String>),
    #[error("task {0} not found")]
    TaskNotFound(String),
    #[error("task {0} has active descendants; agent_report may only succeed at a leaf")]
    HasActiveDescendants(String),
    #[error("wait for agent report {0} timed out")]
    WaitTimedOut(String),
    #[error("wait for agent report {0} aborted: {1}")]
    WaitAborted(String, String),
    #[error(transparent)]
    History(#[from] HistoryStoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] loom_workspace::StoreError),
    #[error("git patch generation failed for {child_id}: {message}")]
    PatchGeneration { child_id: String, message: String },
}

#[derive(Error, Debug)]
pub enum ToolHookError {
    #[error("hook timed out during {phase}")]
    Timeout { phase: &'static str },
    #[error("hook exited with status {0}")]
    NonZeroExit(i32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tool execution failed: {0}")]
    ToolFailed(String),
}

#[derive(Error, Debug)]
pub enum McpError {
    #[error("server {0} not configured")]
    ServerNotConfigured(String),
    #[error("transport error for server {server}: {message}")]
    Transport { server: String, message: String },
    #[error("connect timed out for server {0}")]
    ConnectTimeout(String),
    #[error("tool {0} not found")]
    ToolNotFound(String),
}

#[derive(Error, Debug)]
pub enum TimingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize timing: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum SshPromptError {
    #[error("request {0} timed out")]
    TimedOut(String),
    #[error("request {0} not found")]
    NotFound(String),
}
