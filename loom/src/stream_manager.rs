//! `StreamManager`: owns exactly one live LLM stream per workspace, serializes
//! starts, persists and replays parts, categorizes errors (spec §4.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use stream_event::{StreamErrorKind, StreamEvent};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::error::{PartialStoreError, StreamError};
use crate::history::HistoryStore;
use crate::locks::WorkspaceLocks;
use crate::message::{Message, Metadata, Part, Role, ToolPartState};
use crate::partial::PartialStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Starting,
    Streaming,
    Ended,
    Aborted,
    Errored,
}

struct ToolCallTracker {
    tool_name: String,
    start: Instant,
}

/// In-flight state for a workspace's one live stream.
struct WorkspaceStreamInfo {
    token: String,
    message_id: String,
    state: StreamState,
    parts: Vec<Part>,
    tool_calls: HashMap<String, ToolCallTracker>,
    tool_completion_timestamps: HashMap<String, Instant>,
    first_token_observed: bool,
    started_at: Instant,
    events_tx: broadcast::Sender<StreamEvent>,
}

pub struct StartOutcome {
    pub started: bool,
    pub message_id: String,
}

/// Owns the per-workspace stream registry. `tmp_root` mirrors `~/.mux-tmp/<token>`.
pub struct StreamManager {
    tmp_root: std::path::PathBuf,
    locks: Arc<WorkspaceLocks>,
    history: Arc<HistoryStore>,
    partial: Arc<PartialStore>,
    streams: DashMap<String, Arc<Mutex<Option<WorkspaceStreamInfo>>>>,
}

impl StreamManager {
    pub fn new(
        tmp_root: impl Into<std::path::PathBuf>,
        locks: Arc<WorkspaceLocks>,
        history: Arc<HistoryStore>,
        partial: Arc<PartialStore>,
    ) -> Self {
        Self {
            tmp_root: tmp_root.into(),
            locks,
            history,
            partial,
            streams: DashMap::new(),
        }
    }

    fn slot(&self, workspace_id: &str) -> Arc<Mutex<Option<WorkspaceStreamInfo>>> {
        self.streams
            .entry(workspace_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Serializes starts for one workspace: stops any existing stream
    /// (committing its partial), creates a fresh token + tmp dir, installs
    /// the new `WorkspaceStreamInfo`. A prior `abortSignal` firing before
    /// atomic creation tears down the tmp dir with no `stream-start` emitted.
    pub async fn start_stream(
        &self,
        workspace_id: &str,
        aborted_before_start: bool,
    ) -> Result<StartOutcome, StreamError> {
        let slot = self.slot(workspace_id);
        let mut guard = slot.lock().await;

        if let Some(existing) = guard.take() {
            self.partial.commit_to_history(workspace_id).await.ok();
            let _ = existing.events_tx.send(StreamEvent::StreamAbort {
                message_id: existing.message_id,
                abandoned: false,
            });
        }

        let token = Uuid::new_v4().to_string();
        let tmp_dir = self.tmp_root.join(&token);

        if aborted_before_start {
            return Ok(StartOutcome { started: false, message_id: String::new() });
        }

        tokio::task::block_in_place(|| std::fs::create_dir_all(&tmp_dir)).map_err(StreamError::Io)?;

        let message_id = Uuid::new_v4().to_string();
        let (events_tx, _rx) = broadcast::channel(1024);
        *guard = Some(WorkspaceStreamInfo {
            token,
            message_id: message_id.clone(),
            state: StreamState::Starting,
            parts: Vec::new(),
            tool_calls: HashMap::new(),
            tool_completion_timestamps: HashMap::new(),
            first_token_observed: false,
            started_at: Instant::now(),
            events_tx: events_tx.clone(),
        });
        drop(guard);

        let mut placeholder = Message::new(message_id.clone(), Role::Assistant, vec![]);
        placeholder.metadata.partial = true;
        self.partial.write_partial(workspace_id, placeholder).await.ok();
        let _ = events_tx.send(StreamEvent::StreamStart { message_id: message_id.clone(), replay: false });

        Ok(StartOutcome { started: true, message_id })
    }

    pub fn subscribe(&self, workspace_id: &str) -> Option<broadcast::Receiver<StreamEvent>> {
        let entry = self.streams.get(workspace_id)?;
        let guard = entry.try_lock().ok()?;
        guard.as_ref().map(|info| info.events_tx.subscribe())
    }

    /// Drives one incoming provider event through the state machine,
    /// persisting partial flushes as it goes (§4.5 "Event processing").
    pub async fn process_event(
        &self,
        workspace_id: &str,
        event: StreamEvent,
    ) -> Result<(), StreamError> {
        let slot = self.slot(workspace_id);
        let mut guard = slot.lock().await;
        let info = guard.as_mut().ok_or_else(|| StreamError::NotStreaming(workspace_id.to_string()))?;

        match &event {
            StreamEvent::StreamStart { .. } => {
                info.state = StreamState::Streaming;
            }
            StreamEvent::TextDelta { delta, .. } => {
                info.first_token_observed = true;
                Self::append_text(&mut info.parts, delta);
            }
            StreamEvent::ReasoningDelta { delta, .. } => {
                Self::append_reasoning(&mut info.parts, delta);
            }
            StreamEvent::ToolArgsDelta { .. } => {}
            StreamEvent::ToolCall { tool_call_id, tool_name, input, .. } => {
                info.tool_calls.insert(
                    tool_call_id.clone(),
                    ToolCallTracker { tool_name: tool_name.clone(), start: Instant::now() },
                );
                info.parts.push(Part::DynamicTool {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    state: ToolPartState::InputAvailable,
                    input: input.clone(),
                    output: None,
                });
            }
            StreamEvent::ToolCallEnd { tool_call_id, output, .. } => {
                info.tool_calls.remove(tool_call_id);
                info.tool_completion_timestamps.insert(tool_call_id.clone(), Instant::now());
                if let Some(part) = info.parts.iter_mut().find(|p| matches!(p, Part::DynamicTool { tool_call_id: id, .. } if id == tool_call_id)) {
                    if let Part::DynamicTool { state, output: out, .. } = part {
                        *state = ToolPartState::OutputAvailable;
                        *out = Self::strip_encrypted_content(output.clone());
                    }
                }
            }
            StreamEvent::StreamAbort { abandoned, .. } => {
                info.state = StreamState::Aborted;
                let _ = info.events_tx.send(event.clone());
                let ws = workspace_id.to_string();
                let abandon = *abandoned;
                let partial = self.partial.clone();
                drop(guard);
                if abandon {
                    partial.discard_partial(&ws).await.ok();
                } else {
                    partial.commit_to_history(&ws).await.ok();
                }
                return Ok(());
            }
            StreamEvent::StreamEnd { .. } => {
                info.state = StreamState::Ended;
                let ws = workspace_id.to_string();
                let message_id = info.message_id.clone();
                let parts = info.parts.clone();
                let ttft_ms = if info.first_token_observed {
                    Some(info.started_at.elapsed().as_millis() as u64)
                } else {
                    None
                };
                let _ = info.events_tx.send(event.clone());
                drop(guard);
                self.finalize(&ws, &message_id, parts, ttft_ms).await?;
                return Ok(());
            }
            StreamEvent::StreamError { .. } => {
                info.state = StreamState::Errored;
            }
            StreamEvent::UsageDelta { .. } => {}
        }

        let _ = info.events_tx.send(event);
        Ok(())
    }

    fn append_text(parts: &mut Vec<Part>, delta: &str) {
        if let Some(Part::Text { text }) = parts.last_mut() {
            text.push_str(delta);
        } else {
            parts.push(Part::text(delta));
        }
    }

    fn append_reasoning(parts: &mut Vec<Part>, delta: &str) {
        if let Some(Part::Reasoning { text }) = parts.last_mut() {
            text.push_str(delta);
        } else {
            parts.push(Part::Reasoning { text: delta.to_string() });
        }
    }

    /// Removes opaque `encryptedContent` fields from tool outputs (§4.5
    /// "Sanitization"), in both array-shape and `{type:"json", value:[...]}`.
    fn strip_encrypted_content(output: Option<serde_json::Value>) -> Option<serde_json::Value> {
        fn strip(value: &mut serde_json::Value) {
            match value {
                serde_json::Value::Object(map) => {
                    map.remove("encryptedContent");
                    for v in map.values_mut() {
                        strip(v);
                    }
                }
                serde_json::Value::Array(items) => {
                    for v in items {
                        strip(v);
                    }
                }
                _ => {}
            }
        }
        output.map(|mut v| {
            strip(&mut v);
            v
        })
    }

    async fn finalize(
        &self,
        workspace_id: &str,
        message_id: &str,
        parts: Vec<Part>,
        ttft_ms: Option<u64>,
    ) -> Result<(), StreamError> {
        let mut message = Message::new(message_id.to_string(), Role::Assistant, parts);
        message.metadata.ttft_ms = ttft_ms;
        if let Ok(existing_history) = self.history.get_history(workspace_id).await {
            let next_seq = existing_history
                .iter()
                .filter_map(|m| m.metadata.history_sequence)
                .max()
                .map(|s| s + 1)
                .unwrap_or(0);
            message.metadata.history_sequence = Some(next_seq);
        }
        self.partial.write_partial(workspace_id, message).await.map_err(|e| match e {
            PartialStoreError::Io(io) => StreamError::Io(io),
            other => StreamError::Unknown(other.to_string()),
        })?;
        self.partial
            .commit_to_history(workspace_id)
            .await
            .map_err(|e| StreamError::Unknown(e.to_string()))
    }

    /// Snapshots `parts` before replaying — never iterates the live array
    /// (§4.5 / §9 design note).
    pub async fn replay_stream(&self, workspace_id: &str) -> Result<Vec<StreamEvent>, StreamError> {
        let slot = self.slot(workspace_id);
        let guard = slot.lock().await;
        let info = guard.as_ref().ok_or_else(|| StreamError::NotStreaming(workspace_id.to_string()))?;

        let parts_snapshot = info.parts.clone();
        let message_id = info.message_id.clone();
        let mut events = vec![StreamEvent::StreamStart { message_id: message_id.clone(), replay: true }];
        for part in &parts_snapshot {
            match part {
                Part::Text { text } => events.push(StreamEvent::TextDelta { message_id: message_id.clone(), delta: text.clone() }),
                Part::Reasoning { text } => events.push(StreamEvent::ReasoningDelta { message_id: message_id.clone(), delta: text.clone() }),
                Part::DynamicTool { tool_call_id, tool_name, state, input, output } => {
                    events.push(StreamEvent::ToolCall {
                        message_id: message_id.clone(),
                        tool_call_id: tool_call_id.clone(),
                        tool_name: tool_name.clone(),
                        input: input.clone(),
                    });
                    if *state == ToolPartState::OutputAvailable {
                        events.push(StreamEvent::ToolCallEnd {
                            message_id: message_id.clone(),
                            tool_call_id: tool_call_id.clone(),
                            tool_name: tool_name.clone(),
                            success: true,
                            output: output.clone(),
                            error: None,
                        });
                    }
                }
                Part::File { .. } => {}
            }
        }
        Ok(events)
    }

    /// If no stream exists, emits a synthetic `stream-abort` with empty
    /// `messageId` so waiting subscribers unblock (§4.5 / §7).
    pub async fn stop_stream(&self, workspace_id: &str, abandon_partial: bool) -> Result<StreamEvent, StreamError> {
        let slot = self.slot(workspace_id);
        let mut guard = slot.lock().await;
        match guard.take() {
            Some(info) => {
                let event = StreamEvent::StreamAbort { message_id: info.message_id.clone(), abandoned: abandon_partial };
                let _ = info.events_tx.send(event.clone());
                drop(guard);
                if abandon_partial {
                    self.partial.discard_partial(workspace_id).await.ok();
                } else {
                    self.partial.commit_to_history(workspace_id).await.ok();
                }
                Ok(event)
            }
            None => Ok(StreamEvent::StreamAbort { message_id: String::new(), abandoned: true }),
        }
    }

    /// Whether a stream is currently registered (starting or in progress) for
    /// this workspace.
    pub fn is_streaming(&self, workspace_id: &str) -> bool {
        self.streams
            .get(workspace_id)
            .and_then(|s| s.try_lock().ok().map(|g| g.is_some()))
            .unwrap_or(false)
    }

    pub fn tool_wall_intervals(&self, workspace_id: &str) -> usize {
        self.streams
            .get(workspace_id)
            .and_then(|s| s.try_lock().ok().map(|g| g.as_ref().map(|i| i.tool_calls.len()).unwrap_or(0)))
            .unwrap_or(0)
    }

    /// Error taxonomy (§4.5 `categorizeError`).
    pub fn categorize_error(message: &str, status: Option<u16>) -> StreamErrorKind {
        let lower = message.to_lowercase();
        if lower.contains("model_not_found") || lower.contains("model not found") {
            StreamErrorKind::ModelNotFound
        } else if lower.contains("previous_response_not_found") || lower.contains("resp_") {
            StreamErrorKind::PreviousResponseNotFound
        } else if matches!(status, Some(402)) || (matches!(status, Some(429)) && lower.contains("insufficient_quota")) {
            StreamErrorKind::Quota
        } else if matches!(status, Some(429)) {
            StreamErrorKind::RateLimit
        } else if lower.contains("context_exceeded") || lower.contains("context length") {
            StreamErrorKind::ContextExceeded
        } else if lower.contains("auth") || matches!(status, Some(401) | Some(403)) {
            StreamErrorKind::Auth
        } else if lower.contains("network") || lower.contains("timeout") || lower.contains("connection") {
            StreamErrorKind::Network
        } else {
            StreamErrorKind::Unknown
        }
    }
}
