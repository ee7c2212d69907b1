//! Single in-flight assistant message per workspace, atomically written and
//! transactionally finalized into history (spec §4.2 "PartialStore").

use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::error::PartialStoreError;
use crate::history::HistoryStore;
use crate::locks::WorkspaceLocks;
use crate::message::Message;

pub struct PartialStore {
    sessions_root: PathBuf,
    locks: Arc<WorkspaceLocks>,
    history: Arc<HistoryStore>,
}

impl PartialStore {
    pub fn new(
        sessions_root: impl Into<PathBuf>,
        locks: Arc<WorkspaceLocks>,
        history: Arc<HistoryStore>,
    ) -> Self {
        Self {
            sessions_root: sessions_root.into(),
            locks,
            history,
        }
    }

    fn partial_path(&self, workspace_id: &str) -> PathBuf {
        self.sessions_root.join(workspace_id).join("partial.json")
    }

    pub async fn write_partial(
        &self,
        workspace_id: &str,
        mut message: Message,
    ) -> Result<(), PartialStoreError> {
        message.metadata.partial = true;
        let _guard = self.locks.acquire(workspace_id).await;
        let path = self.partial_path(workspace_id);
        tokio::task::block_in_place(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string(&message)?;
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        })
    }

    pub async fn read_partial(
        &self,
        workspace_id: &str,
    ) -> Result<Option<Message>, PartialStoreError> {
        let _guard = self.locks.acquire(workspace_id).await;
        let path = self.partial_path(workspace_id);
        tokio::task::block_in_place(move || {
            if !path.exists() {
                return Ok(None);
            }
            let content = std::fs::read_to_string(&path)?;
            let message: Message = serde_json::from_str(&content)?;
            Ok(Some(message))
        })
    }

    async fn delete_partial_file(&self, workspace_id: &str) -> Result<(), PartialStoreError> {
        let path = self.partial_path(workspace_id);
        tokio::task::block_in_place(move || {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            Ok(())
        })
    }

    /// Transactional finalization (§4.2 `commitToHistory`). IO failure aborts
    /// *without* deleting the partial, so it is re-runnable on next start.
    pub async fn commit_to_history(&self, workspace_id: &str) -> Result<(), PartialStoreError> {
        let mut message = match self.read_partial(workspace_id).await? {
            Some(m) => m,
            None => return Ok(()),
        };

        // Step 1: strip transient UI-only fields.
        message.metadata.error = None;
        message.metadata.error_type = None;

        // Step 2: historySequence is required.
        let history_sequence = message
            .metadata
            .history_sequence
            .ok_or(PartialStoreError::MissingHistorySequence)?;

        // Step 3: locate a placeholder with the same historySequence in the active epoch.
        let epoch_slice = self
            .history
            .get_history_from_latest_boundary(workspace_id)
            .await
            .map_err(|e| {
                warn!(workspace_id, error = %e, "failed to read history during partial commit");
                PartialStoreError::Io(std::io::Error::other(e.to_string()))
            })?;
        let placeholder = epoch_slice
            .iter()
            .find(|m| m.metadata.history_sequence == Some(history_sequence));

        // Step 4: decide commit-worthiness.
        let worthy = message.is_commit_worthy();

        // Steps 5-6: commit or no-op, then always delete the partial file.
        message.metadata.partial = false;
        let result = if worthy {
            match placeholder {
                None => self.history.append(workspace_id, message).await.map(|_| ()),
                Some(existing) if existing.parts.len() < message.parts.len() => {
                    self.history.update(workspace_id, message).await
                }
                Some(_) => Ok(()),
            }
            .map_err(|e| PartialStoreError::Io(std::io::Error::other(e.to_string())))
        } else {
            Ok(())
        };

        result?;
        self.delete_partial_file(workspace_id).await
    }

    /// Discards the partial without committing (abort with `abandonPartial`).
    pub async fn discard_partial(&self, workspace_id: &str) -> Result<(), PartialStoreError> {
        self.delete_partial_file(workspace_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Part, Role, ToolPartState};

    fn stores() -> (PartialStore, Arc<HistoryStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(WorkspaceLocks::new());
        let history = Arc::new(HistoryStore::new(dir.path(), locks.clone()));
        let partial = PartialStore::new(dir.path(), locks, history.clone());
        (partial, history, dir)
    }

    #[tokio::test]
    async fn write_then_read_partial_round_trips() {
        let (partial, _history, _dir) = stores();
        let msg = Message::new("m1", Role::Assistant, vec![Part::text("hi")]);
        partial.write_partial("ws", msg.clone()).await.unwrap();
        let read = partial.read_partial("ws").await.unwrap().unwrap();
        assert_eq!(read.id, "m1");
        assert!(read.metadata.partial);
    }

    #[tokio::test]
    async fn write_partial_is_idempotent_under_repetition() {
        let (partial, _history, _dir) = stores();
        let msg = Message::new("m1", Role::Assistant, vec![Part::text("hi")]);
        partial.write_partial("ws", msg.clone()).await.unwrap();
        partial.write_partial("ws", msg.clone()).await.unwrap();
        let read = partial.read_partial("ws").await.unwrap().unwrap();
        assert_eq!(read.id, "m1");
    }

    #[tokio::test]
    async fn missing_history_sequence_is_invalid() {
        let (partial, _history, _dir) = stores();
        let msg = Message::new("m1", Role::Assistant, vec![Part::text("hi")]);
        partial.write_partial("ws", msg).await.unwrap();
        let err = partial.commit_to_history("ws").await.unwrap_err();
        assert!(matches!(err, PartialStoreError::MissingHistorySequence));
    }

    #[tokio::test]
    async fn pure_input_available_tool_partial_is_never_committed_but_file_is_deleted() {
        let (partial, history, _dir) = stores();
        let mut msg = Message::new(
            "m1",
            Role::Assistant,
            vec![Part::DynamicTool {
                tool_call_id: "t1".into(),
                tool_name: "bash".into(),
                state: ToolPartState::InputAvailable,
                input: serde_json::json!({}),
                output: None,
            }],
        );
        msg.metadata.history_sequence = Some(0);
        partial.write_partial("ws", msg).await.unwrap();
        partial.commit_to_history("ws").await.unwrap();

        assert!(history.get_history("ws").await.unwrap().is_empty());
        assert!(partial.read_partial("ws").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_worthy_partial_appends_when_no_placeholder_exists() {
        let (partial, history, _dir) = stores();
        let mut msg = Message::new("m1", Role::Assistant, vec![Part::text("hello")]);
        msg.metadata.history_sequence = Some(0);
        partial.write_partial("ws", msg).await.unwrap();
        partial.commit_to_history("ws").await.unwrap();

        let committed = history.get_history("ws").await.unwrap();
        assert_eq!(committed.len(), 1);
        assert!(!committed[0].metadata.partial);
        assert!(partial.read_partial("ws").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_updates_placeholder_with_fewer_parts_in_place() {
        let (partial, history, _dir) = stores();
        let mut placeholder = Message::new("m1", Role::Assistant, vec![Part::text("partial")]);
        placeholder.metadata.partial = true;
        let appended = history.append("ws", placeholder).await.unwrap();
        let seq = appended.metadata.history_sequence;

        let mut full = Message::new("m1", Role::Assistant, vec![Part::text("partial"), Part::text("more")]);
        full.metadata.history_sequence = seq;
        partial.write_partial("ws", full).await.unwrap();
        partial.commit_to_history("ws").await.unwrap();

        let committed = history.get_history("ws").await.unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].parts.len(), 2);
        assert_eq!(committed[0].metadata.history_sequence, seq);
    }

    #[tokio::test]
    async fn discard_partial_deletes_without_committing() {
        let (partial, history, _dir) = stores();
        let mut msg = Message::new("m1", Role::Assistant, vec![Part::text("hi")]);
        msg.metadata.history_sequence = Some(0);
        partial.write_partial("ws", msg).await.unwrap();
        partial.discard_partial("ws").await.unwrap();

        assert!(history.get_history("ws").await.unwrap().is_empty());
        assert!(partial.read_partial("ws").await.unwrap().is_none());
    }
}
