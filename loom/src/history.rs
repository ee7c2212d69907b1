//! Append-only per-workspace message log (spec §4.1 "HistoryStore").
//!
//! Backed by `chat.jsonl` under each workspace's session directory — one
//! JSON [`Message`] per line, written with atomic rename so a crash never
//! leaves a torn file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::error::HistoryStoreError;
use crate::locks::WorkspaceLocks;
use crate::message::Message;

pub struct HistoryStore {
    sessions_root: PathBuf,
    locks: Arc<WorkspaceLocks>,
}

impl HistoryStore {
    pub fn new(sessions_root: impl Into<PathBuf>, locks: Arc<WorkspaceLocks>) -> Self {
        Self {
            sessions_root: sessions_root.into(),
            locks,
        }
    }

    fn chat_path(&self, workspace_id: &str) -> PathBuf {
        self.sessions_root.join(workspace_id).join("chat.jsonl")
    }

    fn read_all_sync(path: &Path, workspace_id: &str) -> Result<Vec<Message>, HistoryStoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path).map_err(|source| HistoryStoreError::Io {
            workspace_id: workspace_id.to_string(),
            source,
        })?;
        let mut messages = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(m) => messages.push(m),
                Err(e) => {
                    // Parse errors reset to empty with a warning (§4.1 ordering/tie-break).
                    warn!(workspace_id, error = %e, "corrupt chat.jsonl line, resetting history to empty");
                    return Ok(Vec::new());
                }
            }
        }
        Ok(messages)
    }

    fn write_all_sync(
        path: &Path,
        workspace_id: &str,
        messages: &[Message],
    ) -> Result<(), HistoryStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| HistoryStoreError::Io {
                workspace_id: workspace_id.to_string(),
                source,
            })?;
        }
        let mut buf = String::new();
        for message in messages {
            let line = serde_json::to_string(message).map_err(|e| HistoryStoreError::Corrupt {
                workspace_id: workspace_id.to_string(),
                reason: e.to_string(),
            })?;
            buf.push_str(&line);
            buf.push('\n');
        }
        let tmp_path = path.with_extension("jsonl.tmp");
        std::fs::write(&tmp_path, buf).map_err(|source| HistoryStoreError::Io {
            workspace_id: workspace_id.to_string(),
            source,
        })?;
        std::fs::rename(&tmp_path, path).map_err(|source| HistoryStoreError::Io {
            workspace_id: workspace_id.to_string(),
            source,
        })?;
        Ok(())
    }

    /// Assigns `historySequence = maxExisting + 1` and appends atomically.
    pub async fn append(
        &self,
        workspace_id: &str,
        mut message: Message,
    ) -> Result<Message, HistoryStoreError> {
        let _guard = self.locks.acquire(workspace_id).await;
        let path = self.chat_path(workspace_id);
        let workspace_id = workspace_id.to_string();
        tokio::task::block_in_place(move || {
            let mut messages = Self::read_all_sync(&path, &workspace_id)?;
            let next_seq = messages
                .iter()
                .filter_map(|m| m.metadata.history_sequence)
                .max()
                .map(|s| s + 1)
                .unwrap_or(0);
            message.metadata.history_sequence = Some(next_seq);
            messages.push(message.clone());
            Self::write_all_sync(&path, &workspace_id, &messages)?;
            Ok(message)
        })
    }

    /// Locates by `id`, preserves `historySequence`.
    pub async fn update(
        &self,
        workspace_id: &str,
        message: Message,
    ) -> Result<(), HistoryStoreError> {
        let _guard = self.locks.acquire(workspace_id).await;
        let path = self.chat_path(workspace_id);
        let workspace_id = workspace_id.to_string();
        tokio::task::block_in_place(move || {
            let mut messages = Self::read_all_sync(&path, &workspace_id)?;
            let existing = messages.iter_mut().find(|m| m.id == message.id).ok_or_else(|| {
                HistoryStoreError::NotFound {
                    workspace_id: workspace_id.clone(),
                    id: message.id.clone(),
                }
            })?;
            let preserved_seq = existing.metadata.history_sequence;
            *existing = message;
            existing.metadata.history_sequence = preserved_seq;
            Self::write_all_sync(&path, &workspace_id, &messages)
        })
    }

    pub async fn get_history(&self, workspace_id: &str) -> Result<Vec<Message>, HistoryStoreError> {
        let _guard = self.locks.acquire(workspace_id).await;
        let path = self.chat_path(workspace_id);
        let workspace_id = workspace_id.to_string();
        tokio::task::block_in_place(move || Self::read_all_sync(&path, &workspace_id))
    }

    pub async fn get_last_messages(
        &self,
        workspace_id: &str,
        n: usize,
    ) -> Result<Vec<Message>, HistoryStoreError> {
        let mut history = self.get_history(workspace_id).await?;
        if history.len() > n {
            history.drain(0..history.len() - n);
        }
        Ok(history)
    }

    /// Slice from (and including) the newest valid boundary to the tail;
    /// full history if no valid boundary exists. Malformed boundary rows are
    /// skipped silently (§4.1).
    pub async fn get_history_from_latest_boundary(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<Message>, HistoryStoreError> {
        let history = self.get_history(workspace_id).await?;
        let boundary_idx = history
            .iter()
            .enumerate()
            .rev()
            .find(|(_, m)| m.metadata.is_valid_boundary())
            .map(|(i, _)| i);
        Ok(match boundary_idx {
            Some(i) => history[i..].to_vec(),
            None => history,
        })
    }

    pub async fn truncate_after_message(
        &self,
        workspace_id: &str,
        id: &str,
    ) -> Result<(), HistoryStoreError> {
        let _guard = self.locks.acquire(workspace_id).await;
        let path = self.chat_path(workspace_id);
        let ws = workspace_id.to_string();
        let id = id.to_string();
        tokio::task::block_in_place(move || {
            let messages = Self::read_all_sync(&path, &ws)?;
            let cut = messages.iter().position(|m| m.id == id).ok_or_else(|| {
                HistoryStoreError::NotFound {
                    workspace_id: ws.clone(),
                    id: id.clone(),
                }
            })?;
            let truncated = messages[..=cut].to_vec();
            Self::write_all_sync(&path, &ws, &truncated)
        })
    }

    pub async fn clear_history(&self, workspace_id: &str) -> Result<(), HistoryStoreError> {
        let _guard = self.locks.acquire(workspace_id).await;
        let path = self.chat_path(workspace_id);
        let ws = workspace_id.to_string();
        tokio::task::block_in_place(move || Self::write_all_sync(&path, &ws, &[]))
    }

    pub async fn delete_partial(&self, workspace_id: &str) -> Result<(), HistoryStoreError> {
        let _guard = self.locks.acquire(workspace_id).await;
        let path = self.sessions_root.join(workspace_id).join("partial.json");
        if path.exists() {
            std::fs::remove_file(&path).map_err(|source| HistoryStoreError::Io {
                workspace_id: workspace_id.to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CompactedBy, Role};

    fn store() -> (HistoryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path(), Arc::new(WorkspaceLocks::new()));
        (store, dir)
    }

    #[tokio::test]
    async fn append_assigns_strictly_increasing_sequence() {
        let (store, _dir) = store();
        let m1 = store
            .append("ws", Message::new("a", Role::User, vec![]))
            .await
            .unwrap();
        let m2 = store
            .append("ws", Message::new("b", Role::User, vec![]))
            .await
            .unwrap();
        assert_eq!(m1.metadata.history_sequence, Some(0));
        assert_eq!(m2.metadata.history_sequence, Some(1));
    }

    #[tokio::test]
    async fn update_preserves_history_sequence() {
        let (store, _dir) = store();
        let m1 = store
            .append("ws", Message::new("a", Role::User, vec![]))
            .await
            .unwrap();
        let mut updated = m1.clone();
        updated.metadata.history_sequence = Some(999);
        store.update("ws", updated).await.unwrap();
        let history = store.get_history("ws").await.unwrap();
        assert_eq!(history[0].metadata.history_sequence, Some(0));
    }

    #[tokio::test]
    async fn update_missing_id_is_not_found() {
        let (store, _dir) = store();
        let err = store
            .update("ws", Message::new("missing", Role::User, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn get_last_messages_returns_tail() {
        let (store, _dir) = store();
        for id in ["a", "b", "c"] {
            store
                .append("ws", Message::new(id, Role::User, vec![]))
                .await
                .unwrap();
        }
        let tail = store.get_last_messages("ws", 2).await.unwrap();
        assert_eq!(tail.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn boundary_slice_returns_from_newest_valid_boundary() {
        let (store, _dir) = store();
        store
            .append("ws", Message::new("pre", Role::User, vec![]))
            .await
            .unwrap();
        let mut boundary = Message::new("boundary", Role::Assistant, vec![]);
        boundary.metadata.compaction_boundary = true;
        boundary.metadata.compacted = Some(CompactedBy::User);
        boundary.metadata.compaction_epoch = Some(1);
        store.append("ws", boundary).await.unwrap();
        store
            .append("ws", Message::new("post", Role::User, vec![]))
            .await
            .unwrap();

        let slice = store.get_history_from_latest_boundary("ws").await.unwrap();
        assert_eq!(
            slice.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["boundary", "post"]
        );
    }

    #[tokio::test]
    async fn malformed_boundary_is_skipped_and_full_history_returned() {
        let (store, _dir) = store();
        let mut malformed = Message::new("fake-boundary", Role::Assistant, vec![]);
        malformed.metadata.compaction_boundary = true; // no `compacted`, no epoch
        store.append("ws", malformed).await.unwrap();
        store
            .append("ws", Message::new("after", Role::User, vec![]))
            .await
            .unwrap();

        let slice = store.get_history_from_latest_boundary("ws").await.unwrap();
        assert_eq!(slice.len(), 2);
    }

    #[tokio::test]
    async fn truncate_after_message_drops_the_tail() {
        let (store, _dir) = store();
        for id in ["a", "b", "c"] {
            store
                .append("ws", Message::new(id, Role::User, vec![]))
                .await
                .unwrap();
        }
        store.truncate_after_message("ws", "b").await.unwrap();
        let history = store.get_history("ws").await.unwrap();
        assert_eq!(history.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn corrupt_file_resets_to_empty_on_read() {
        let (store, dir) = store();
        let ws_dir = dir.path().join("ws");
        std::fs::create_dir_all(&ws_dir).unwrap();
        std::fs::write(ws_dir.join("chat.jsonl"), "not json\n").unwrap();
        let history = store.get_history("ws").await.unwrap();
        assert!(history.is_empty());
    }
}
