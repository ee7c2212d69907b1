//! `DelegatedToolCallRegistry`: pending-promise registry for tool calls whose
//! result arrives out-of-band (spec §4.12).

use std::collections::HashMap;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::oneshot;

#[derive(Debug, Clone)]
pub enum CallOutcome {
    Answered(serde_json::Value),
    Cancelled(String),
}

struct Pending {
    tool_name: String,
    created_at: Instant,
    sender: Option<oneshot::Sender<CallOutcome>>,
}

#[derive(Default)]
pub struct DelegatedToolCallRegistry {
    // workspace_id -> tool_call_id -> pending entry
    calls: DashMap<String, HashMap<String, Pending>>,
}

impl DelegatedToolCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending call; the returned receiver resolves on `answer`/`cancel`.
    pub fn register_pending(
        &self,
        workspace_id: &str,
        tool_call_id: &str,
        tool_name: &str,
    ) -> oneshot::Receiver<CallOutcome> {
        assert!(!workspace_id.is_empty() && !tool_call_id.is_empty(), "ids must be non-empty");
        let (tx, rx) = oneshot::channel();
        let mut workspace_calls = self.calls.entry(workspace_id.to_string()).or_default();
        assert!(
            !workspace_calls.contains_key(tool_call_id),
            "tool call {tool_call_id} already registered for workspace {workspace_id}"
        );
        workspace_calls.insert(
            tool_call_id.to_string(),
            Pending { tool_name: tool_name.to_string(), created_at: Instant::now(), sender: Some(tx) },
        );
        rx
    }

    pub fn answer(&self, workspace_id: &str, tool_call_id: &str, result: serde_json::Value) -> bool {
        self.settle(workspace_id, tool_call_id, CallOutcome::Answered(result))
    }

    pub fn cancel(&self, workspace_id: &str, tool_call_id: &str, reason: &str) -> bool {
        self.settle(workspace_id, tool_call_id, CallOutcome::Cancelled(reason.to_string()))
    }

    pub fn cancel_all(&self, workspace_id: &str, reason: &str) {
        if let Some(mut workspace_calls) = self.calls.get_mut(workspace_id) {
            for (_, pending) in workspace_calls.iter_mut() {
                if let Some(tx) = pending.sender.take() {
                    let _ = tx.send(CallOutcome::Cancelled(reason.to_string()));
                }
            }
            workspace_calls.clear();
        }
    }

    fn settle(&self, workspace_id: &str, tool_call_id: &str, outcome: CallOutcome) -> bool {
        if let Some(mut workspace_calls) = self.calls.get_mut(workspace_id) {
            if let Some(mut pending) = workspace_calls.remove(tool_call_id) {
                if let Some(tx) = pending.sender.take() {
                    let _ = tx.send(outcome);
                    return true;
                }
            }
        }
        false
    }

    /// Returns the `tool_call_id` of the latest-registered pending call.
    pub fn get_latest_pending(&self, workspace_id: &str) -> Option<String> {
        self.calls.get(workspace_id).and_then(|workspace_calls| {
            workspace_calls
                .iter()
                .max_by_key(|(_, pending)| pending.created_at)
                .map(|(id, _)| id.clone())
        })
    }

    pub fn tool_name_for(&self, workspace_id: &str, tool_call_id: &str) -> Option<String> {
        self.calls
            .get(workspace_id)
            .and_then(|calls| calls.get(tool_call_id).map(|p| p.tool_name.clone()))
    }
}
