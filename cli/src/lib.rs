//! Library surface for the `loom` operator CLI.
//!
//! The binary (`main.rs`) parses arguments into [`RunOptions`] and drives a
//! [`RunBackend`] — currently only [`LocalBackend`], which runs the engine
//! in-process. There is no remote/socket mode: the CLI talks to the same
//! services `serve` exposes over HTTP, directly.

pub mod backend;
pub mod engine;
pub mod run;

pub use backend::{LocalBackend, RunBackend, RunOutput, StreamOut, ToolShowFormat};
pub use run::RunError;

use std::path::PathBuf;

/// Parameters for one `loom run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// The message text to send.
    pub message: String,
    /// Workspace to run in; a fresh workspace is created when absent.
    pub workspace_id: Option<String>,
    /// Directory a freshly created workspace should be rooted at.
    pub working_folder: Option<PathBuf>,
    /// `@file` mentions to attach to the message.
    pub file_mentions: Vec<String>,
    /// Emit the raw stream as JSON instead of plain text.
    pub output_json: bool,
}
