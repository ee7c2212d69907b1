//! # Loom
//!
//! The per-workspace agent engine: a long-lived LLM streaming loop with
//! durable history, context-window compaction, a tool-call fabric (hooks +
//! MCP), sub-agent task scheduling, and session timing.
//!
//! ## Main modules
//!
//! - [`message`]: [`Message`], [`Part`], [`Metadata`] — the chat history data model.
//! - [`history`]: [`HistoryStore`] — per-workspace durable chat history (`chat.jsonl`).
//! - [`partial`]: [`PartialStore`] — in-flight streaming message persistence and commit.
//! - [`stream_manager`]: [`StreamManager`] — drives one LLM stream per workspace end to end.
//! - [`compress`]: [`CompactionMonitor`] (usage checks) and [`CompactionHandler`] (summary commit).
//! - [`timing`]: [`SessionTimingService`] — per-stream timing derivation and roll-up.
//! - [`tool_hook`]: [`ToolHookRunner`] — external pre/post hook scripts around tool execution.
//! - [`mcp`]: [`McpServerManager`] — pooled MCP tool-provider connections.
//! - [`task`]: [`TaskService`] — sub-agent scheduling, parallelism caps, report delivery.
//! - [`agent_session`]: [`AgentSession`] — orchestrates `sendMessage` across the above services.
//! - [`delegated_tool_call`]: [`DelegatedToolCallRegistry`] — pending-promise registry for
//!   tool calls resolved out of band (e.g. by a tool hook or a sub-agent report).
//! - [`ssh_prompt`]: [`SshPromptService`] — request bus for SSH interactive prompts.
//! - [`locks`]: [`WorkspaceLocks`] — per-workspace async mutex registry shared by the stores above.
//! - [`error`]: per-service `thiserror` error enums.

pub mod agent_session;
pub mod compress;
pub mod delegated_tool_call;
pub mod error;
pub mod history;
pub mod locks;
pub mod mcp;
pub mod message;
pub mod partial;
pub mod ssh_prompt;
pub mod stream_manager;
pub mod task;
pub mod timing;
pub mod tool_hook;

pub use agent_session::AgentSession;
pub use compress::{CompactionConfig, CompactionHandler, CompactionMonitor};
pub use delegated_tool_call::{CallOutcome, DelegatedToolCallRegistry};
pub use error::{
    CompactionError, HistoryStoreError, McpError, PartialStoreError, SshPromptError, StreamError,
    TaskError, TimingError, ToolHookError,
};
pub use history::HistoryStore;
pub use locks::WorkspaceLocks;
pub use mcp::McpServerManager;
pub use message::{Message, Metadata, Part, Role};
pub use partial::PartialStore;
pub use ssh_prompt::SshPromptService;
pub use stream_manager::{StartOutcome, StreamManager, StreamState};
pub use task::TaskService;
pub use timing::SessionTimingService;
pub use tool_hook::{HookScripts, ToolHookRunner, ToolInvocation};

#[cfg(test)]
mod test_logging {
    use ctor::ctor;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::Layer;

    #[ctor]
    fn init() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(filter),
            )
            .try_init();
    }
}
