//! Run orchestration: send one message to a workspace, then forward its
//! stream to the caller (stdout or a JSON sink).
//!
//! Flow: `agent_session.send_message` (append + maybe start a stream) →
//! report `Started`/`CompactionDeferred` → forward the live stream, if one
//! was started, until it ends.

mod display;

use std::sync::{Arc, Mutex};

use serde_json::Value;
use stream_event::{EnvelopeState, StreamEvent};
use thiserror::Error;
use tokio::sync::broadcast;

use loom::agent_session::{SendMessageOptions, SendMessageOutcome};

use crate::engine::Engine;
use crate::RunOptions;

pub use display::format_message_line;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("stream: {0}")]
    Stream(#[from] loom::error::StreamError),
    #[error("mcp: {0}")]
    Mcp(#[from] loom::error::McpError),
    #[error("history: {0}")]
    History(#[from] loom::error::HistoryStoreError),
    #[error("workspace store: {0}")]
    Store(#[from] loom_workspace::StoreError),
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error("engine: {0}")]
    Engine(String),
}

/// Result of one `run`: which workspace it ran against, the reply text (best
/// effort — there is no LLM provider wired up, so this is usually empty
/// unless a prior process streamed real content into history), and whichever
/// stream events were observed.
pub struct RunResult {
    pub workspace_id: String,
    pub reply: String,
    pub events: Vec<Value>,
}

/// Sends `opts.message` to `opts.workspace_id` (creating a workspace first
/// when absent) and forwards the resulting stream.
///
/// When `stream_out` is `Some`, each event is forwarded through it as it
/// arrives and `events` in the result is empty. When `None`, events are
/// collected and returned.
pub async fn run_message(
    engine: &Engine,
    opts: &RunOptions,
    stream_out: Option<Arc<Mutex<dyn FnMut(Value) + Send>>>,
) -> Result<RunResult, RunError> {
    let workspace_id = engine
        .resolve_workspace(opts.workspace_id.clone(), opts.working_folder.as_deref())
        .await?;

    let send_opts = SendMessageOptions {
        file_mentions: opts.file_mentions.clone(),
        hide_follow_up_sentinel: false,
    };
    let outcome = engine
        .agent_session
        .send_message(&workspace_id, &opts.message, send_opts, &engine.providers_config)
        .await?;

    let message_id = match outcome {
        SendMessageOutcome::Started { message_id, compaction_warning } => {
            if let Some(pct) = compaction_warning {
                eprintln!("loom: context usage at {:.1}%, consider compacting soon", pct);
            }
            message_id
        }
        SendMessageOutcome::CompactionDeferred { compaction_request_message_id } => {
            eprintln!("loom: message deferred behind a compaction request ({})", compaction_request_message_id);
            return Ok(RunResult { workspace_id, reply: String::new(), events: Vec::new() });
        }
    };

    let mut envelope = EnvelopeState::new(workspace_id.clone());
    let mut events = Vec::new();
    let reply = match engine.stream_manager.subscribe(&workspace_id) {
        Some(rx) => forward_stream(rx, &mut envelope, &message_id, stream_out, &mut events).await?,
        None => String::new(),
    };

    Ok(RunResult { workspace_id, reply, events })
}

async fn forward_stream(
    mut rx: broadcast::Receiver<StreamEvent>,
    envelope: &mut EnvelopeState,
    message_id: &str,
    stream_out: Option<Arc<Mutex<dyn FnMut(Value) + Send>>>,
    events: &mut Vec<Value>,
) -> Result<String, RunError> {
    let mut reply = String::new();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                eprintln!("loom: stream receiver lagged, skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if let StreamEvent::TextDelta { delta, .. } = &event {
            reply.push_str(delta);
        }

        let terminal = matches!(
            event,
            StreamEvent::StreamEnd { .. } | StreamEvent::StreamAbort { .. } | StreamEvent::StreamError { .. }
        );
        let value = envelope.to_json(&event).map_err(|e| RunError::Engine(e.to_string()))?;

        match &stream_out {
            Some(sink) => {
                if let Ok(mut f) = sink.lock() {
                    f(value);
                }
            }
            None => events.push(value),
        }

        if terminal {
            break;
        }
    }
    let _ = message_id;
    Ok(reply)
}
