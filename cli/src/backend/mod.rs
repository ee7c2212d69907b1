//! Backend abstraction used by the `loom` CLI.
//!
//! The CLI runs the engine in-process via [`LocalBackend`]. This module
//! centralizes the streaming output contract and the [`RunBackend`] trait
//! that `main.rs`/`repl.rs` drive.

mod local;

pub use local::LocalBackend;

use crate::run::RunError;
use crate::RunOptions;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Optional sink for JSON stream output (used by `--json`).
///
/// - `Some(...)`: events are forwarded immediately as they arrive (stdout or a file).
/// - `None`: the backend collects events in memory and returns them at the end.
pub type StreamOut = Option<Arc<Mutex<dyn FnMut(Value) + Send>>>;

/// Output of a single run.
#[derive(Debug)]
pub enum RunOutput {
    /// Plain-text mode: the reply text and the workspace it ran in.
    Reply { workspace_id: String, reply: String },
    /// `--json` mode without a streaming sink: the collected stream events
    /// alongside the workspace id, for one-shot JSON output.
    Json {
        workspace_id: String,
        events: Vec<Value>,
    },
}

/// Output format for `tool show`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolShowFormat {
    Yaml,
    Json,
}

#[async_trait]
pub trait RunBackend: Send + Sync {
    /// Sends one message to a workspace and streams (or collects) the result.
    ///
    /// Streaming contract:
    /// - `stream_out = Some`: the backend forwards each event immediately and
    ///   returns `RunOutput::Reply`.
    /// - `stream_out = None`: if `opts.output_json` is true, returns
    ///   `RunOutput::Json { events, .. }`; otherwise `RunOutput::Reply`.
    async fn run(&self, opts: &RunOptions, stream_out: StreamOut) -> Result<RunOutput, RunError>;
    async fn list_tools(&self, opts: &RunOptions) -> Result<(), RunError>;
    async fn show_tool(&self, opts: &RunOptions, name: &str, format: ToolShowFormat) -> Result<(), RunError>;
    async fn list_tasks(&self, workspace_id: &str) -> Result<(), RunError>;
    async fn tail(&self, workspace_id: &str, limit: Option<usize>) -> Result<(), RunError>;
}
