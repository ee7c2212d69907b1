//! `CompactionHandler`: turns a streamed compaction summary into a durable
//! boundary, and caches pre-boundary file edits for post-compaction replay
//! (spec §4.4).

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CompactionError;
use crate::history::HistoryStore;
use crate::locks::WorkspaceLocks;
use crate::message::{CompactedBy, Message, MuxEventType};
use crate::partial::PartialStore;

pub const MAX_EDITED_FILES: usize = 50;
pub const MAX_FILE_CONTENT_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub diff: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PostCompactionFile {
    version: u32,
    created_at_ms: i64,
    diffs: Vec<FileDiff>,
}

/// Why a streamed summary was not turned into a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmptySummary,
    SummaryIsRawJson,
}

pub struct CompactionHandler {
    sessions_root: PathBuf,
    locks: Arc<WorkspaceLocks>,
    history: Arc<HistoryStore>,
    partial: Arc<PartialStore>,
    pending_diffs: tokio::sync::Mutex<Option<(Vec<FileDiff>, bool)>>,
}

impl CompactionHandler {
    pub fn new(
        sessions_root: impl Into<PathBuf>,
        locks: Arc<WorkspaceLocks>,
        history: Arc<HistoryStore>,
        partial: Arc<PartialStore>,
    ) -> Self {
        Self {
            sessions_root: sessions_root.into(),
            locks,
            history,
            partial,
            pending_diffs: tokio::sync::Mutex::new(None),
        }
    }

    fn post_compaction_path(&self, workspace_id: &str) -> PathBuf {
        self.sessions_root.join(workspace_id).join("post-compaction.json")
    }

    /// §4.4 trigger detection: newest post-boundary user message whose
    /// `muxMetadata.type = compaction-request`, scanning the last 10 messages.
    pub fn find_compaction_request<'a>(history_tail: &'a [Message]) -> Option<&'a Message> {
        history_tail
            .iter()
            .rev()
            .take(10)
            .find(|m| {
                matches!(m.role, crate::message::Role::User)
                    && m.metadata
                        .mux_metadata
                        .as_ref()
                        .and_then(|mm| mm.kind)
                        == Some(MuxEventType::CompactionRequest)
            })
    }

    /// Self-healing rejection check (§4.4): empty summary, or a summary that
    /// parses as a raw JSON object (a leaked tool call).
    pub fn reject_reason(summary_text: &str) -> Option<RejectReason> {
        if summary_text.trim().is_empty() {
            return Some(RejectReason::EmptySummary);
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(summary_text.trim()) {
            if value.is_object() {
                return Some(RejectReason::SummaryIsRawJson);
            }
        }
        None
    }

    /// `getNextCompactionEpoch`: `1 + max(valid epoch cursors; +1 per legacy
    /// summary without epoch)`.
    pub fn next_epoch(history: &[Message]) -> u64 {
        let mut cursor = 0u64;
        for m in history {
            if !m.metadata.compaction_boundary {
                continue;
            }
            match (m.metadata.compacted, m.metadata.compaction_epoch) {
                (Some(_), Some(epoch)) if epoch > 0 => cursor = cursor.max(epoch),
                (Some(_), None) => cursor += 1,
                _ => {}
            }
        }
        cursor + 1
    }

    fn extract_diffs(history: &[Message]) -> Vec<FileDiff> {
        // File-edit tool output parts carry a `{path, diff}` shaped output
        // (spec §6 post-compaction.json) produced by file-editing tools;
        // here we scan committed tool outputs for that shape.
        let mut diffs = Vec::new();
        for m in history {
            for part in &m.parts {
                if let crate::message::Part::DynamicTool {
                    state: crate::message::ToolPartState::OutputAvailable,
                    output: Some(output),
                    ..
                } = part
                {
                    if let (Some(path), Some(diff)) = (
                        output.get("path").and_then(|v| v.as_str()),
                        output.get("diff").and_then(|v| v.as_str()),
                    ) {
                        let truncated = diff.len() > MAX_FILE_CONTENT_SIZE;
                        let diff = if truncated { diff[..MAX_FILE_CONTENT_SIZE].to_string() } else { diff.to_string() };
                        diffs.push(FileDiff { path: path.to_string(), diff, truncated });
                        if diffs.len() >= MAX_EDITED_FILES {
                            return diffs;
                        }
                    }
                }
            }
        }
        diffs
    }

    /// Persists `post-compaction.json`. Best-effort: failure is logged, never
    /// propagated (§4.4 step 3).
    async fn persist_pending_diffs(&self, workspace_id: &str, diffs: &[FileDiff], created_at_ms: i64) {
        let _guard = self.locks.acquire(workspace_id).await;
        let path = self.post_compaction_path(workspace_id);
        let file = PostCompactionFile {
            version: 1,
            created_at_ms,
            diffs: diffs.to_vec(),
        };
        let result = tokio::task::block_in_place(|| -> Result<(), CompactionError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string(&file)?;
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        });
        if let Err(e) = result {
            warn!(workspace_id, error = %e, "failed to persist post-compaction.json (best-effort)");
        }
    }

    /// §4.4 full accept path. Returns the written summary message, or a
    /// [`RejectReason`] without marking the request processed.
    #[allow(clippy::too_many_arguments)]
    pub async fn accept_summary(
        &self,
        workspace_id: &str,
        summary_text: &str,
        compacted_by: CompactedBy,
        epoch_model: Option<String>,
        now_ms: i64,
        existing_message_id: Option<&str>,
    ) -> Result<Result<Message, RejectReason>, CompactionError> {
        if let Some(reason) = Self::reject_reason(summary_text) {
            return Ok(Err(reason));
        }

        // Step 1: delete stale partial *before* persisting the summary.
        self.partial.discard_partial(workspace_id).await.ok();

        // Step 2: compute pre-summary epoch slice and extract diffs.
        let full_history = self.history.get_history(workspace_id).await?;
        let epoch_slice = self.history.get_history_from_latest_boundary(workspace_id).await?;
        let diffs = Self::extract_diffs(&epoch_slice);

        // Step 3: best-effort persist.
        self.persist_pending_diffs(workspace_id, &diffs, now_ms).await;
        *self.pending_diffs.lock().await = Some((diffs, false));

        // Step 4: next epoch.
        let next_epoch = Self::next_epoch(&full_history);

        // Steps 5-6: build the summary message.
        let mut summary = Message::new(
            existing_message_id.map(|s| s.to_string()).unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            crate::message::Role::Assistant,
            vec![crate::message::Part::text(summary_text)],
        );
        summary.metadata.compacted = Some(compacted_by);
        summary.metadata.compaction_boundary = true;
        summary.metadata.compaction_epoch = Some(next_epoch);
        summary.metadata.model = epoch_model;
        summary.metadata.timestamp = Some(now_ms);
        summary.metadata.mux_metadata = Some(crate::message::MuxMetadata {
            kind: Some(MuxEventType::CompactionSummary),
            ..Default::default()
        });

        // Step 7: update in place if already persisted, else append.
        let already_persisted = existing_message_id
            .map(|id| full_history.iter().any(|m| m.id == id))
            .unwrap_or(false);
        if already_persisted {
            self.history.update(workspace_id, summary.clone()).await?;
        } else {
            summary = self.history.append(workspace_id, summary).await?;
        }

        Ok(Ok(summary))
    }

    /// Lazily loads `post-compaction.json` if not already in memory; marks
    /// the cache as consumed-pending.
    pub async fn peek_pending_diffs(&self, workspace_id: &str) -> Vec<FileDiff> {
        let mut guard = self.pending_diffs.lock().await;
        if guard.is_none() {
            let path = self.post_compaction_path(workspace_id);
            let loaded = tokio::task::block_in_place(|| -> Option<Vec<FileDiff>> {
                let content = std::fs::read_to_string(&path).ok()?;
                let file: PostCompactionFile = serde_json::from_str(&content).ok()?;
                Some(file.diffs)
            });
            *guard = Some((loaded.unwrap_or_default(), false));
        }
        if let Some((diffs, pending)) = guard.as_mut() {
            *pending = true;
            diffs.clone()
        } else {
            Vec::new()
        }
    }

    pub async fn peek_cached_file_paths(&self, workspace_id: &str) -> Vec<String> {
        self.peek_pending_diffs(workspace_id)
            .await
            .into_iter()
            .map(|d| d.path)
            .collect()
    }

    pub async fn ack_pending_diffs_consumed(&self, workspace_id: &str) {
        *self.pending_diffs.lock().await = None;
        let path = self.post_compaction_path(workspace_id);
        let _ = tokio::task::block_in_place(|| std::fs::remove_file(path));
    }

    pub async fn discard_pending_diffs(&self, _reason: &str) {
        *self.pending_diffs.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    fn handler() -> (CompactionHandler, Arc<HistoryStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(WorkspaceLocks::new());
        let history = Arc::new(HistoryStore::new(dir.path(), locks.clone()));
        let partial = Arc::new(PartialStore::new(dir.path(), locks.clone(), history.clone()));
        let handler = CompactionHandler::new(dir.path(), locks, history.clone(), partial);
        (handler, history, dir)
    }

    #[test]
    fn empty_summary_is_rejected() {
        assert_eq!(CompactionHandler::reject_reason("   "), Some(RejectReason::EmptySummary));
    }

    #[test]
    fn raw_json_object_summary_is_rejected() {
        assert_eq!(
            CompactionHandler::reject_reason(r#"{"tool": "call"}"#),
            Some(RejectReason::SummaryIsRawJson)
        );
    }

    #[test]
    fn plain_text_summary_is_accepted() {
        assert_eq!(CompactionHandler::reject_reason("the conversation covered X, Y, Z"), None);
    }

    #[test]
    fn next_epoch_is_max_plus_one() {
        let mut boundary = Message::new("b1", Role::Assistant, vec![]);
        boundary.metadata.compaction_boundary = true;
        boundary.metadata.compacted = Some(CompactedBy::User);
        boundary.metadata.compaction_epoch = Some(4);
        assert_eq!(CompactionHandler::next_epoch(std::slice::from_ref(&boundary)), 5);
    }

    #[test]
    fn legacy_boundary_without_epoch_increments_cursor_by_one() {
        let mut legacy = Message::new("b1", Role::Assistant, vec![]);
        legacy.metadata.compaction_boundary = true;
        legacy.metadata.compacted = Some(CompactedBy::User);
        // no epoch set: legacy summary
        assert_eq!(CompactionHandler::next_epoch(std::slice::from_ref(&legacy)), 2);
    }

    #[tokio::test]
    async fn accept_summary_writes_boundary_with_strictly_greater_epoch() {
        let (handler, history, _dir) = handler();
        history
            .append("ws", Message::new("u1", Role::User, vec![]))
            .await
            .unwrap();

        let result = handler
            .accept_summary("ws", "summary of the conversation", CompactedBy::User, None, 1000, None)
            .await
            .unwrap();
        let summary = result.unwrap();
        assert!(summary.metadata.compaction_boundary);
        assert_eq!(summary.metadata.compaction_epoch, Some(1));

        let committed = history.get_history("ws").await.unwrap();
        assert_eq!(committed.len(), 2);
    }

    #[tokio::test]
    async fn rejected_summary_does_not_write_a_boundary() {
        let (handler, history, _dir) = handler();
        let result = handler
            .accept_summary("ws", "", CompactedBy::User, None, 1000, None)
            .await
            .unwrap();
        assert_eq!(result.unwrap_err(), RejectReason::EmptySummary);
        assert!(history.get_history("ws").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_diffs_round_trip_through_persisted_file() {
        let (handler, _history, _dir) = handler();
        handler
            .accept_summary("ws", "summary text", CompactedBy::Idle, None, 1000, None)
            .await
            .unwrap()
            .unwrap();
        let paths = handler.peek_cached_file_paths("ws").await;
        assert!(paths.is_empty()); // no tool-output diffs in this history
        handler.ack_pending_diffs_consumed("ws").await;
    }
}
