//! `SessionTimingService`: per-stream timing derivation and per-session/
//! per-model aggregation (spec §4.10).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TimingError;
use crate::locks::WorkspaceLocks;

#[derive(Debug, Default)]
struct ActiveStreamTiming {
    started_at: Option<Instant>,
    first_token_time_ms: Option<u64>,
    tool_wall_ms: u64,
    tool_wall_start: Option<Instant>,
    pending_tool_starts: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelTotals {
    pub total_duration_ms: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub stream_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionTotals {
    pub total_duration_ms: u64,
    pub tool_execution_ms: u64,
    pub model_time_ms: u64,
    pub streaming_ms: u64,
    #[serde(default)]
    pub by_model: HashMap<String, ModelTotals>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingFile {
    pub version: u32,
    pub session: SessionTotals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request: Option<CompletedTiming>,
    #[serde(default)]
    pub rolled_up_from: HashMap<String, bool>,
}

impl Default for TimingFile {
    fn default() -> Self {
        Self { version: 2, session: SessionTotals::default(), last_request: None, rolled_up_from: HashMap::new() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletedTiming {
    pub total_duration_ms: u64,
    pub ttft_ms: Option<u64>,
    pub tool_execution_ms: u64,
    pub model_time_ms: u64,
    pub streaming_ms: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub invalid: bool,
    pub anomalies: Vec<String>,
}

pub struct SessionTimingService {
    sessions_root: PathBuf,
    locks: Arc<WorkspaceLocks>,
    active: tokio::sync::Mutex<HashMap<String, ActiveStreamTiming>>,
    write_epoch: tokio::sync::Mutex<HashMap<String, u64>>,
}

impl SessionTimingService {
    pub fn new(sessions_root: impl Into<PathBuf>, locks: Arc<WorkspaceLocks>) -> Self {
        Self {
            sessions_root: sessions_root.into(),
            locks,
            active: tokio::sync::Mutex::new(HashMap::new()),
            write_epoch: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn timing_path(&self, workspace_id: &str) -> PathBuf {
        self.sessions_root.join(workspace_id).join("session-timing.json")
    }

    pub async fn start_stream(&self, workspace_id: &str) {
        let mut active = self.active.lock().await;
        active.insert(workspace_id.to_string(), ActiveStreamTiming { started_at: Some(Instant::now()), ..Default::default() });
    }

    pub async fn first_token(&self, workspace_id: &str) {
        let mut active = self.active.lock().await;
        if let Some(entry) = active.get_mut(workspace_id) {
            if entry.first_token_time_ms.is_none() {
                if let Some(started) = entry.started_at {
                    entry.first_token_time_ms = Some(started.elapsed().as_millis() as u64);
                }
            }
        }
    }

    /// On first concurrent tool start, set `tool_wall_start`; on each
    /// additional start take min with existing (§4.10 "Tool-wall algorithm").
    pub async fn tool_start(&self, workspace_id: &str) {
        let mut active = self.active.lock().await;
        if let Some(entry) = active.get_mut(workspace_id) {
            let now = Instant::now();
            entry.pending_tool_starts += 1;
            entry.tool_wall_start = Some(match entry.tool_wall_start {
                Some(existing) => existing.min(now),
                None => now,
            });
        }
    }

    /// On the last concurrent tool end, `tool_wall_ms += now - segment_start`.
    pub async fn tool_end(&self, workspace_id: &str) {
        let mut active = self.active.lock().await;
        if let Some(entry) = active.get_mut(workspace_id) {
            if entry.pending_tool_starts > 0 {
                entry.pending_tool_starts -= 1;
            }
            if entry.pending_tool_starts == 0 {
                if let Some(segment_start) = entry.tool_wall_start.take() {
                    entry.tool_wall_ms += segment_start.elapsed().as_millis() as u64;
                }
            }
        }
    }

    fn compute_completed(entry: &ActiveStreamTiming, output_tokens: u64, reasoning_tokens: u64) -> CompletedTiming {
        let total = entry.started_at.map(|s| s.elapsed().as_millis() as u64).unwrap_or(0);
        let tool = entry.tool_wall_ms;
        let ttft = entry.first_token_time_ms;

        let mut anomalies = Vec::new();
        if tool > total {
            anomalies.push("tool_gt_total".to_string());
        }
        if let Some(t) = ttft {
            if t > total {
                anomalies.push("ttft_gt_total".to_string());
            }
        }
        let invalid = !anomalies.is_empty();

        let model_time_ms = total.saturating_sub(tool);
        let streaming_ms = model_time_ms.saturating_sub(ttft.unwrap_or(0));

        CompletedTiming {
            total_duration_ms: total,
            ttft_ms: ttft,
            tool_execution_ms: tool,
            model_time_ms,
            streaming_ms,
            output_tokens,
            reasoning_tokens,
            invalid,
            anomalies,
        }
    }

    /// Computes completed timing and persists it (still persisted when
    /// `invalid`; §8 testable property `tool_gt_total`).
    pub async fn handle_stream_end(
        &self,
        workspace_id: &str,
        model: &str,
        output_tokens: u64,
        reasoning_tokens: u64,
    ) -> Result<CompletedTiming, TimingError> {
        let entry = {
            let mut active = self.active.lock().await;
            active.remove(workspace_id).unwrap_or_default()
        };
        let completed = Self::compute_completed(&entry, output_tokens, reasoning_tokens);
        if completed.invalid {
            warn!(workspace_id, anomalies = ?completed.anomalies, "stream_timing_invalid");
        }
        self.persist(workspace_id, model, &completed).await?;
        Ok(completed)
    }

    pub async fn handle_stream_abort(&self, workspace_id: &str, model: &str) -> Result<CompletedTiming, TimingError> {
        self.handle_stream_end(workspace_id, model, 0, 0).await
    }

    async fn persist(&self, workspace_id: &str, model: &str, completed: &CompletedTiming) -> Result<(), TimingError> {
        let epoch = {
            let mut epochs = self.write_epoch.lock().await;
            *epochs.entry(workspace_id.to_string()).or_insert(0)
        };
        let _guard = self.locks.acquire(workspace_id).await;
        // Re-check the epoch hasn't advanced (a concurrent `clear_timing_file`)
        // while we waited for the lock — stale in-flight writes are discarded.
        if epoch != *self.write_epoch.lock().await.get(workspace_id).unwrap_or(&0) {
            return Ok(());
        }
        let path = self.timing_path(workspace_id);
        let mut file = tokio::task::block_in_place(|| -> Result<TimingFile, TimingError> {
            if !path.exists() {
                return Ok(TimingFile::default());
            }
            let content = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&content).unwrap_or_default())
        })?;

        file.session.total_duration_ms += completed.total_duration_ms;
        file.session.tool_execution_ms += completed.tool_execution_ms;
        file.session.model_time_ms += completed.model_time_ms;
        file.session.streaming_ms += completed.streaming_ms;
        let model_totals = file.session.by_model.entry(model.to_string()).or_default();
        model_totals.total_duration_ms += completed.total_duration_ms;
        model_totals.output_tokens += completed.output_tokens;
        model_totals.reasoning_tokens += completed.reasoning_tokens;
        model_totals.stream_count += 1;
        file.last_request = Some(completed.clone());

        tokio::task::block_in_place(|| -> Result<(), TimingError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string(&file)?;
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        })
    }

    /// Increments the write epoch so in-flight writes scheduled before this
    /// call are discarded rather than resurrecting old totals.
    pub async fn clear_timing_file(&self, workspace_id: &str) -> Result<(), TimingError> {
        {
            let mut epochs = self.write_epoch.lock().await;
            *epochs.entry(workspace_id.to_string()).or_insert(0) += 1;
        }
        let _guard = self.locks.acquire(workspace_id).await;
        let path = self.timing_path(workspace_id);
        tokio::task::block_in_place(|| {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            Ok(())
        })
    }

    /// Idempotent roll-up via `rolled_up_from` ledger: repeated calls for the
    /// same child leave parent totals unchanged on the second call.
    pub async fn roll_up_timing_into_parent(
        &self,
        parent_workspace_id: &str,
        child_workspace_id: &str,
    ) -> Result<(), TimingError> {
        let child_path = self.timing_path(child_workspace_id);
        let child_file: Option<TimingFile> = tokio::task::block_in_place(|| {
            std::fs::read_to_string(&child_path)
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok())
        });
        let Some(child_file) = child_file else { return Ok(()) };

        let _guard = self.locks.acquire(parent_workspace_id).await;
        let parent_path = self.timing_path(parent_workspace_id);
        let mut parent_file: TimingFile = tokio::task::block_in_place(|| {
            if !parent_path.exists() {
                return Ok(TimingFile::default());
            }
            let content = std::fs::read_to_string(&parent_path)?;
            Ok::<_, TimingError>(serde_json::from_str(&content).unwrap_or_default())
        })?;

        if parent_file.rolled_up_from.contains_key(child_workspace_id) {
            return Ok(()); // already rolled up; idempotent no-op
        }

        parent_file.session.total_duration_ms += child_file.session.total_duration_ms;
        parent_file.session.tool_execution_ms += child_file.session.tool_execution_ms;
        parent_file.session.model_time_ms += child_file.session.model_time_ms;
        parent_file.session.streaming_ms += child_file.session.streaming_ms;
        for (model, totals) in child_file.session.by_model {
            let entry = parent_file.session.by_model.entry(model).or_default();
            entry.total_duration_ms += totals.total_duration_ms;
            entry.output_tokens += totals.output_tokens;
            entry.reasoning_tokens += totals.reasoning_tokens;
            entry.stream_count += totals.stream_count;
        }
        parent_file.rolled_up_from.insert(child_workspace_id.to_string(), true);
        // last_request is left untouched per spec.

        tokio::task::block_in_place(|| -> Result<(), TimingError> {
            if let Some(parent_dir) = parent_path.parent() {
                std::fs::create_dir_all(parent_dir)?;
            }
            let json = serde_json::to_string(&parent_file)?;
            let tmp = parent_path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, &parent_path)?;
            Ok(())
        })
    }
}
