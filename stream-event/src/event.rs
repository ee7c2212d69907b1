//! Wire-level stream event types (spec §4.5, §6.1).
//!
//! `StreamEvent` is the one type the engine and transport agree on: every
//! event StreamManager produces for a workspace, from `stream-start` through
//! `stream-end`/`stream-abort`/`stream-error`, serializes through this enum.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error_kind::StreamErrorKind;

/// One event in a workspace's stream, tagged by `type` on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// Stream started. `replay: true` marks a synthetic replay for a late subscriber.
    StreamStart {
        message_id: String,
        #[serde(default)]
        replay: bool,
    },
    /// Incremental text delta appended to the assistant message.
    TextDelta { message_id: String, delta: String },
    /// Incremental reasoning ("thinking") delta.
    ReasoningDelta { message_id: String, delta: String },
    /// Incremental tool-call argument delta (streaming tool-call construction).
    ToolArgsDelta {
        message_id: String,
        tool_call_id: String,
        delta: String,
    },
    /// A tool call has been fully constructed and is starting execution.
    ToolCall {
        message_id: String,
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    /// A tool call finished (success or error). The stream continues regardless.
    ToolCallEnd {
        message_id: String,
        tool_call_id: String,
        tool_name: String,
        success: bool,
        output: Option<Value>,
        error: Option<String>,
    },
    /// Token usage delta, emitted as the provider reports it mid-stream.
    UsageDelta {
        message_id: String,
        prompt_tokens: u32,
        completion_tokens: u32,
        total_tokens: u32,
        cached_input_tokens: Option<u32>,
    },
    /// Stream ended normally; the assistant message has been committed.
    StreamEnd {
        message_id: String,
        ttft_ms: Option<u64>,
    },
    /// Stream was stopped before completion (user abort, supersession by a
    /// newer `startStream`, or explicit `stopStream`). Empty `message_id`
    /// marks the synthetic abort emitted when there was no active stream.
    StreamAbort {
        message_id: String,
        abandoned: bool,
    },
    /// A classified, UI-safe error. The stream is considered ended after this.
    StreamError {
        message_id: String,
        kind: StreamErrorKind,
        message: String,
    },
}

impl StreamEvent {
    /// The message id this event pertains to, if any (empty string for the
    /// synthetic no-op abort emitted by `stopStream` on an absent stream).
    pub fn message_id(&self) -> &str {
        match self {
            StreamEvent::StreamStart { message_id, .. }
            | StreamEvent::TextDelta { message_id, .. }
            | StreamEvent::ReasoningDelta { message_id, .. }
            | StreamEvent::ToolArgsDelta { message_id, .. }
            | StreamEvent::ToolCall { message_id, .. }
            | StreamEvent::ToolCallEnd { message_id, .. }
            | StreamEvent::UsageDelta { message_id, .. }
            | StreamEvent::StreamEnd { message_id, .. }
            | StreamEvent::StreamAbort { message_id, .. }
            | StreamEvent::StreamError { message_id, .. } => message_id,
        }
    }

    /// Convenience constructor for the synthetic abort `stopStream` emits
    /// when there is no active stream for the workspace (spec §4.5).
    pub fn synthetic_no_op_abort() -> Self {
        StreamEvent::StreamAbort {
            message_id: String::new(),
            abandoned: true,
        }
    }
}
