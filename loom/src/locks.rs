//! Per-workspace file lock registry shared by HistoryStore, PartialStore,
//! SessionTimingService, and the subagent-patch writer (spec §5
//! "workspaceFileLocks").
//!
//! A single process-wide [`WorkspaceLocks`] hands out an
//! `Arc<tokio::sync::Mutex<()>>` per workspace id, so the services above
//! never race each other's file writes for the same workspace even though
//! each owns its own file.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct WorkspaceLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl WorkspaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, workspace_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(workspace_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquires the lock for `workspace_id`; the guard is held for as long as
    /// the caller needs exclusive file access to that workspace's session dir.
    pub async fn acquire(&self, workspace_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(workspace_id).lock_owned().await
    }
}
