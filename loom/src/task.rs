//! `TaskService`: sub-agent scheduler with strict correctness under restart
//! (spec §4.7).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tracing::warn;

use loom_workspace::{NewTaskWorkspace, RuntimeConfig, Store, TaskStatus, WorkspaceEntry};

use crate::agent_session::{AgentSession, SendMessageOptions};
use crate::error::TaskError;
use crate::history::HistoryStore;
use crate::message::{Message, Part, Role, ToolPartState};
use crate::stream_manager::StreamManager;

const COMPLETED_REPORT_TTL: Duration = Duration::from_secs(60 * 60);
const COMPLETED_REPORT_MAX_ENTRIES: usize = 128;

/// Abstraction over the filesystem/git side-effects of creating and tearing
/// down a task workspace's working tree. Kept separate from `TaskService` so
/// tests can exercise scheduling logic without real git/process calls.
pub trait TaskRuntime: Send + Sync {
    fn create_worktree(&self, parent_project_path: &str, task_id: &str, trunk_branch: Option<&str>) -> std::io::Result<PathBuf>;
    fn remove_worktree(&self, project_path: &str) -> std::io::Result<()>;
    fn run_init_hook(&self, project_path: &str) -> std::io::Result<()>;
    fn head_commit_sha(&self, project_path: &str) -> std::io::Result<String>;
}

/// Local git-backed runtime: worktrees are real `git worktree add` checkouts,
/// init hooks run `.mux/init` if present.
pub struct LocalGitRuntime;

impl TaskRuntime for LocalGitRuntime {
    fn create_worktree(&self, parent_project_path: &str, task_id: &str, trunk_branch: Option<&str>) -> std::io::Result<PathBuf> {
        let worktree_path = std::path::Path::new(parent_project_path)
            .join(".mux-worktrees")
            .join(task_id);
        let mut cmd = std::process::Command::new("git");
        cmd.arg("-C").arg(parent_project_path).arg("worktree").arg("add").arg(&worktree_path);
        if let Some(branch) = trunk_branch {
            cmd.arg(branch);
        }
        let status = cmd.status()?;
        if !status.success() {
            return Err(std::io::Error::other(format!("git worktree add exited with {status}")));
        }
        Ok(worktree_path)
    }

    fn remove_worktree(&self, project_path: &str) -> std::io::Result<()> {
        let status = std::process::Command::new("git")
            .arg("worktree")
            .arg("remove")
            .arg("--force")
            .arg(project_path)
            .status()?;
        if !status.success() {
            warn!(project_path, "git worktree remove failed, falling back to rm -rf");
            std::fs::remove_dir_all(project_path)?;
        }
        Ok(())
    }

    fn run_init_hook(&self, project_path: &str) -> std::io::Result<()> {
        let hook = std::path::Path::new(project_path).join(".mux").join("init");
        if !hook.exists() {
            return Ok(());
        }
        std::process::Command::new(&hook).current_dir(project_path).status()?;
        Ok(())
    }

    fn head_commit_sha(&self, project_path: &str) -> std::io::Result<String> {
        let output = std::process::Command::new("git")
            .arg("-C")
            .arg(project_path)
            .arg("rev-parse")
            .arg("HEAD")
            .output()?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub agent_id: String,
    pub runnable: bool,
    pub skip_init_hook: bool,
    pub default_model: Option<String>,
}

pub struct AgentRegistry {
    agents: HashMap<String, AgentDefinition>,
}

impl AgentRegistry {
    pub fn new(agents: Vec<AgentDefinition>) -> Self {
        Self { agents: agents.into_iter().map(|a| (a.agent_id.clone(), a)).collect() }
    }

    fn get(&self, agent_id: &str) -> Option<&AgentDefinition> {
        self.agents.get(&agent_id.to_lowercase())
    }

    fn runnable_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.values().filter(|a| a.runnable).map(|a| a.agent_id.clone()).collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub parent_workspace_id: String,
    pub agent_id: String,
    pub prompt: String,
    pub explicit_model: Option<String>,
    pub parent_per_agent_model: Option<String>,
    pub workspace_default_model: Option<String>,
    pub global_default_model: Option<String>,
}

#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Queued { task_id: String },
    Running { task_id: String },
}

#[derive(Debug, Clone)]
pub struct CompletedReport {
    pub report_markdown: String,
    pub title: String,
    pub ancestor_workspace_ids: Vec<String>,
}

struct CacheEntry {
    report: CompletedReport,
    inserted_at: Instant,
}

/// Registered waiter for `waitForAgentReport`; resolved exactly once.
struct Waiter {
    tx: oneshot::Sender<CompletedReport>,
}

#[derive(Default)]
struct SchedulerState {
    /// In-memory waiters keyed by task id, for tasks already running.
    waiters: HashMap<String, Vec<Waiter>>,
    /// Waiters registered before the task left `queued`; moved to `waiters`
    /// (and their timeout clock started) on transition to running.
    pending_start_waiters: HashMap<String, Vec<Waiter>>,
    /// Workspaces currently blocked in the `task` tool awaiting a child
    /// report — excluded from `countActiveAgentTasks` (§4.7 deadlock note).
    foreground_await_count: HashMap<String, usize>,
    /// One-shot "reminded" flag per task for the stream-end-without-report path.
    reminded: HashSet<String>,
    completed_reports: HashMap<String, CacheEntry>,
}

pub struct TaskServiceDeps {
    pub store: Arc<Store>,
    pub history: Arc<HistoryStore>,
    pub stream_manager: Arc<StreamManager>,
    pub agent_session: Arc<AgentSession>,
    pub runtime: Arc<dyn TaskRuntime>,
    pub agents: Arc<AgentRegistry>,
    pub max_parallel_agent_tasks: usize,
    pub max_task_nesting_depth: usize,
}

pub struct TaskService {
    store: Arc<Store>,
    history: Arc<HistoryStore>,
    stream_manager: Arc<StreamManager>,
    agent_session: Arc<AgentSession>,
    runtime: Arc<dyn TaskRuntime>,
    agents: Arc<AgentRegistry>,
    max_parallel_agent_tasks: usize,
    max_task_nesting_depth: usize,
    state: Mutex<SchedulerState>,
    /// Serializes `maybeStartQueuedTasks` drains across concurrent callers;
    /// kept distinct from `state`'s own lock so drain-loop bodies can still
    /// call waiter/foreground-await helpers that lock `state` internally.
    drain_lock: Mutex<()>,
}

impl TaskService {
    pub fn new(deps: TaskServiceDeps) -> Self {
        Self {
            store: deps.store,
            history: deps.history,
            stream_manager: deps.stream_manager,
            agent_session: deps.agent_session,
            runtime: deps.runtime,
            agents: deps.agents,
            max_parallel_agent_tasks: deps.max_parallel_agent_tasks,
            max_task_nesting_depth: deps.max_task_nesting_depth,
            state: Mutex::new(SchedulerState::default()),
            drain_lock: Mutex::new(()),
        }
    }

    fn resolve_effective_model(&self, agent: &AgentDefinition, req: &CreateTaskRequest) -> Option<String> {
        req.explicit_model
            .clone()
            .or_else(|| agent.default_model.clone())
            .or_else(|| req.parent_per_agent_model.clone())
            .or_else(|| req.workspace_default_model.clone())
            .or_else(|| req.global_default_model.clone())
    }

    async fn count_active_excluding_foreground_awaits(&self) -> Result<usize, TaskError> {
        let exclude: Vec<String> = {
            let state = self.state.lock().await;
            state.foreground_await_count.keys().cloned().collect()
        };
        Ok(self.store.count_active_agent_tasks(&exclude).await?)
    }

    /// `create` (§4.7).
    pub async fn create(&self, req: CreateTaskRequest) -> Result<CreateOutcome, TaskError> {
        let parent = self
            .store
            .get_workspace(&req.parent_workspace_id)
            .await?
            .ok_or_else(|| TaskError::ParentNotFound(req.parent_workspace_id.clone()))?;

        let parent_depth = self.store.depth(&req.parent_workspace_id).await?;
        if parent_depth + 1 > self.max_task_nesting_depth {
            return Err(TaskError::DepthExceeded { depth: parent_depth + 1, max: self.max_task_nesting_depth });
        }

        let agent = self
            .agents
            .get(&req.agent_id)
            .filter(|a| a.runnable)
            .ok_or_else(|| TaskError::AgentNotRunnable(req.agent_id.clone(), self.agents.runnable_ids()))?
            .clone();

        let effective_model = self.resolve_effective_model(&agent, &req);

        let active = self.count_active_excluding_foreground_awaits().await?;
        if active >= self.max_parallel_agent_tasks {
            let entry = self
                .store
                .create_task_workspace(NewTaskWorkspace {
                    name: None,
                    project_path: parent.project_path.clone(),
                    parent_workspace_id: req.parent_workspace_id.clone(),
                    runtime_config: RuntimeConfig::Worktree,
                    agent_id: req.agent_id.clone(),
                    task_status: TaskStatus::Queued,
                    task_prompt: Some(req.prompt.clone()),
                    task_trunk_branch: None,
                    task_base_commit_sha: None,
                    task_model_string: effective_model,
                    task_thinking_level: None,
                })
                .await?;
            return Ok(CreateOutcome::Queued { task_id: entry.id });
        }

        self.start_task(&parent, &req, &agent, effective_model).await
    }

    async fn start_task(
        &self,
        parent: &WorkspaceEntry,
        req: &CreateTaskRequest,
        agent: &AgentDefinition,
        effective_model: Option<String>,
    ) -> Result<CreateOutcome, TaskError> {
        let entry = self
            .store
            .create_task_workspace(NewTaskWorkspace {
                name: None,
                project_path: parent.project_path.clone(),
                parent_workspace_id: req.parent_workspace_id.clone(),
                runtime_config: RuntimeConfig::Worktree,
                agent_id: req.agent_id.clone(),
                task_status: TaskStatus::Queued,
                task_prompt: Some(req.prompt.clone()),
                task_trunk_branch: None,
                task_base_commit_sha: None,
                task_model_string: effective_model.clone(),
                task_thinking_level: None,
            })
            .await?;

        match self.provision_and_dispatch(&entry, parent, req, agent).await {
            Ok(()) => Ok(CreateOutcome::Running { task_id: entry.id }),
            Err(e) => {
                let _ = self.store.remove_workspace(&entry.id).await;
                Err(e)
            }
        }
    }

    async fn provision_and_dispatch(
        &self,
        entry: &WorkspaceEntry,
        parent: &WorkspaceEntry,
        req: &CreateTaskRequest,
        agent: &AgentDefinition,
    ) -> Result<(), TaskError> {
        let runtime = self.runtime.clone();
        let parent_project_path = parent.project_path.clone();
        let task_id = entry.id.clone();
        let worktree_path = tokio::task::block_in_place(|| runtime.create_worktree(&parent_project_path, &task_id, None))?;
        let worktree_path_str = worktree_path.to_string_lossy().to_string();

        if !agent.skip_init_hook {
            let runtime = self.runtime.clone();
            let path = worktree_path_str.clone();
            tokio::task::block_in_place(|| runtime.run_init_hook(&path))?;
        }

        let base_sha = tokio::task::block_in_place(|| self.runtime.head_commit_sha(&worktree_path_str))?;
        self.store.set_task_base_commit_sha(&entry.id, &base_sha).await?;
        self.store.set_task_status(&entry.id, TaskStatus::Running, None).await?;
        self.store.clear_task_prompt(&entry.id).await?;

        let providers_config = model_spec_core::ProvidersConfig::default();
        self.agent_session
            .send_message(&entry.id, &req.prompt, SendMessageOptions::default(), &providers_config)
            .await
            .map_err(|e| TaskError::Io(std::io::Error::other(e.to_string())))?;

        Ok(())
    }

    /// `maybeStartQueuedTasks` (§4.7): drain queued tasks oldest-first under
    /// the scheduler's lock, dispatching any that now fit capacity.
    pub async fn maybe_start_queued_tasks(&self) -> Result<(), TaskError> {
        let _drain_guard = self.drain_lock.lock().await;
        loop {
            let active = {
                let exclude: Vec<String> = self.state.lock().await.foreground_await_count.keys().cloned().collect();
                self.store.count_active_agent_tasks(&exclude).await?
            };
            if active >= self.max_parallel_agent_tasks {
                break;
            }
            let Some(next) = self.oldest_queued_task().await? else { break };
            let Some(parent_id) = next.parent_workspace_id.clone() else {
                warn!(task_id = %next.id, "queued task has no parent workspace, dropping");
                self.store.remove_workspace(&next.id).await?;
                continue;
            };
            let Some(parent) = self.store.get_workspace(&parent_id).await? else {
                warn!(task_id = %next.id, "queued task's parent workspace is gone, dropping");
                self.store.remove_workspace(&next.id).await?;
                continue;
            };
            let agent = self
                .agents
                .get(next.agent_id.as_deref().unwrap_or_default())
                .cloned()
                .unwrap_or(AgentDefinition {
                    agent_id: next.agent_id.clone().unwrap_or_default(),
                    runnable: true,
                    skip_init_hook: false,
                    default_model: None,
                });
            let req = CreateTaskRequest {
                parent_workspace_id: parent.id.clone(),
                agent_id: agent.agent_id.clone(),
                prompt: next.task_prompt.clone().unwrap_or_default(),
                explicit_model: next.task_model_string.clone(),
                parent_per_agent_model: None,
                workspace_default_model: None,
                global_default_model: None,
            };
            match self.provision_and_dispatch(&next, &parent, &req, &agent).await {
                Ok(()) => self.promote_pending_start_waiters(&next.id).await,
                Err(e) => {
                    warn!(task_id = %next.id, error = %e, "failed to start queued task");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn oldest_queued_task(&self) -> Result<Option<WorkspaceEntry>, TaskError> {
        Ok(self.store.list_queued_tasks().await?.into_iter().next())
    }

    pub async fn register_foreground_await(&self, workspace_id: &str) {
        let mut state = self.state.lock().await;
        *state.foreground_await_count.entry(workspace_id.to_string()).or_insert(0) += 1;
    }

    pub async fn unregister_foreground_await(&self, workspace_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(count) = state.foreground_await_count.get_mut(workspace_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.foreground_await_count.remove(workspace_id);
            }
        }
    }

    fn subagent_report_xml(task_id: &str, agent_type: &str, title: &str, report_markdown: &str) -> String {
        format!(
            "<mux_subagent_report>\n<task_id>{task_id}</task_id>\n<agent_type>{agent_type}</agent_type>\n<title>{title}</title>\n<report_markdown>{report_markdown}</report_markdown>\n</mux_subagent_report>"
        )
    }

    /// Report delivery path (§4.7, `tool-call-end { toolName: "agent_report" }`).
    pub async fn deliver_agent_report(
        &self,
        task_id: &str,
        title: Option<String>,
        report_markdown: String,
    ) -> Result<(), TaskError> {
        let entry = self.store.get_workspace(task_id).await?.ok_or_else(|| TaskError::TaskNotFound(task_id.to_string()))?;

        let children = self.store.list_children(task_id).await?;
        if children.iter().any(|c| matches!(c.task_status, Some(TaskStatus::Queued | TaskStatus::Running | TaskStatus::AwaitingReport))) {
            return Err(TaskError::HasActiveDescendants(task_id.to_string()));
        }

        let reported_at_ms = now_ms();
        self.store.set_task_status(task_id, TaskStatus::Reported, Some(reported_at_ms)).await?;
        self.stream_manager.stop_stream(task_id, false).await.map_err(|e| TaskError::Io(std::io::Error::other(e.to_string())))?;

        let title = title.unwrap_or_else(|| format!("Subagent ({}) report", entry.agent_id.as_deref().unwrap_or("unknown")));
        let report = CompletedReport {
            report_markdown: report_markdown.clone(),
            title: title.clone(),
            ancestor_workspace_ids: self.ancestor_ids(&entry).await?,
        };
        self.cache_completed_report(task_id, report.clone()).await;

        let delivered_to_waiter = {
            let mut state = self.state.lock().await;
            if let Some(waiters) = state.waiters.remove(task_id) {
                for waiter in waiters {
                    let _ = waiter.tx.send(report.clone());
                }
                true
            } else {
                false
            }
        };

        if !delivered_to_waiter {
            if let Some(parent_id) = &entry.parent_workspace_id {
                let finalized_tool_call = if self.stream_manager.is_streaming(parent_id) {
                    false
                } else {
                    self.finalize_pending_task_tool_call(parent_id, task_id, &report).await?
                };

                if !finalized_tool_call {
                    let xml = Self::subagent_report_xml(
                        task_id,
                        entry.agent_id.as_deref().unwrap_or("unknown"),
                        &title,
                        &report_markdown,
                    );
                    let mut message = Message::new(uuid::Uuid::new_v4().to_string(), Role::User, vec![Part::text(xml)]);
                    message.metadata.synthetic = true;
                    self.history.append(parent_id, message).await?;
                }
            }
        }

        self.generate_patch_artifact(&entry).await;
        self.cleanup_leaf_ancestry(task_id).await?;

        if let Some(parent_id) = &entry.parent_workspace_id {
            let remaining_children = self.store.list_children(parent_id).await?;
            let parent_has_active_descendants = remaining_children
                .iter()
                .any(|c| matches!(c.task_status, Some(TaskStatus::Queued | TaskStatus::Running | TaskStatus::AwaitingReport)));
            if !parent_has_active_descendants {
                let _ = self.stream_manager.start_stream(parent_id, false).await;
            }
        }

        Ok(())
    }

    /// §4.7 step 5(b): the parent isn't actively streaming, so there's no
    /// live `tool-call-end` path to promote its pending `task` tool-call part.
    /// Find that part in the parent's committed history (matched by
    /// `toolCallId == taskId`) and finalize it directly instead of appending
    /// a synthetic report message. Returns `false` if no such part exists.
    async fn finalize_pending_task_tool_call(
        &self,
        parent_id: &str,
        task_id: &str,
        report: &CompletedReport,
    ) -> Result<bool, TaskError> {
        let mut history = self.history.get_history(parent_id).await?;
        let is_pending_task_call = |part: &Part| {
            matches!(
                part,
                Part::DynamicTool { tool_call_id, tool_name, state, .. }
                    if tool_call_id == task_id && tool_name == "task" && *state == ToolPartState::InputAvailable
            )
        };
        let Some(message) = history.iter_mut().rev().find(|m| m.parts.iter().any(is_pending_task_call)) else {
            return Ok(false);
        };
        for part in message.parts.iter_mut() {
            if is_pending_task_call(part) {
                if let Part::DynamicTool { state, output, .. } = part {
                    *state = ToolPartState::OutputAvailable;
                    *output = Some(serde_json::json!({ "title": report.title, "reportMarkdown": report.report_markdown }));
                }
            }
        }
        self.history.update(parent_id, message.clone()).await?;
        Ok(true)
    }

    async fn ancestor_ids(&self, entry: &WorkspaceEntry) -> Result<Vec<String>, TaskError> {
        let mut ids = Vec::new();
        let mut current = entry.parent_workspace_id.clone();
        while let Some(id) = current {
            ids.push(id.clone());
            current = self.store.get_workspace(&id).await?.and_then(|e| e.parent_workspace_id);
        }
        Ok(ids)
    }

    async fn cache_completed_report(&self, task_id: &str, report: CompletedReport) {
        let mut state = self.state.lock().await;
        state.completed_reports.retain(|_, entry| entry.inserted_at.elapsed() < COMPLETED_REPORT_TTL);
        if state.completed_reports.len() >= COMPLETED_REPORT_MAX_ENTRIES {
            if let Some(oldest_key) = state
                .completed_reports
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                state.completed_reports.remove(&oldest_key);
            }
        }
        state.completed_reports.insert(task_id.to_string(), CacheEntry { report, inserted_at: Instant::now() });
    }

    pub async fn completed_report(&self, task_id: &str) -> Option<CompletedReport> {
        let state = self.state.lock().await;
        state.completed_reports.get(task_id).map(|e| e.report.clone())
    }

    /// `git format-patch <base>..HEAD` into `subagent-patches/<childId>.mbox`,
    /// with a `.json` descriptor tracking status (§6 artifact format). Writes
    /// a `pending` marker first so `cleanupLeafAncestry` can detect in-flight
    /// generation and defer deletion.
    async fn generate_patch_artifact(&self, entry: &WorkspaceEntry) {
        let Some(base_sha) = entry.task_base_commit_sha.clone() else { return };
        let project_path = entry.project_path.clone();
        let task_id = entry.id.clone();
        let parent_id = entry.parent_workspace_id.clone().unwrap_or_default();
        let patches_dir = std::path::Path::new(&project_path).join("subagent-patches");
        let descriptor_path = patches_dir.join(format!("{task_id}.json"));
        let pending_marker = patches_dir.join(format!("{task_id}.pending"));
        let created_at_ms = now_ms();

        let write_descriptor = |status: &str, mbox_path: Option<&str>, commit_count: Option<usize>, error: Option<&str>| {
            let descriptor = serde_json::json!({
                "childTaskId": task_id,
                "parentWorkspaceId": parent_id,
                "createdAtMs": created_at_ms,
                "updatedAtMs": now_ms(),
                "status": status,
                "baseCommitSha": base_sha,
                "mboxPath": mbox_path,
                "commitCount": commit_count,
                "error": error,
            });
            let _ = std::fs::create_dir_all(&patches_dir);
            let _ = std::fs::write(&descriptor_path, serde_json::to_vec_pretty(&descriptor).unwrap_or_default());
        };

        tokio::task::block_in_place(|| {
            let _ = std::fs::create_dir_all(&patches_dir);
            let _ = std::fs::write(&pending_marker, b"");
            write_descriptor("pending", None, None, None);

            let output = std::process::Command::new("git")
                .arg("-C")
                .arg(&project_path)
                .arg("format-patch")
                .arg("--stdout")
                .arg("--binary")
                .arg(format!("{base_sha}..HEAD"))
                .output();

            match output {
                Ok(output) if output.status.success() && !output.stdout.is_empty() => {
                    let mbox_path = patches_dir.join(format!("{task_id}.mbox"));
                    match std::fs::write(&mbox_path, &output.stdout) {
                        Ok(()) => write_descriptor("ready", Some(mbox_path.to_string_lossy().as_ref()), None, None),
                        Err(e) => write_descriptor("failed", None, None, Some(&e.to_string())),
                    }
                }
                Ok(_) => write_descriptor("skipped", None, Some(0), None),
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "git format-patch failed");
                    write_descriptor("failed", None, None, Some(&e.to_string()));
                }
            }
            let _ = std::fs::remove_file(&pending_marker);
        });
    }

    /// Walk parent-ward deleting reported leaves with no pending patch artifact.
    async fn cleanup_leaf_ancestry(&self, task_id: &str) -> Result<(), TaskError> {
        let mut current = Some(task_id.to_string());
        while let Some(id) = current {
            let Some(entry) = self.store.get_workspace(&id).await? else { break };
            if entry.task_status != Some(TaskStatus::Reported) {
                break;
            }
            let children = self.store.list_children(&id).await?;
            if !children.is_empty() {
                break;
            }
            let patch_pending = std::path::Path::new(&entry.project_path)
                .join("subagent-patches")
                .join(format!("{id}.pending"));
            if patch_pending.exists() {
                break;
            }
            let next = entry.parent_workspace_id.clone();
            let _ = tokio::task::block_in_place(|| self.runtime.remove_worktree(&entry.project_path));
            self.store.remove_workspace(&id).await?;
            current = next;
        }
        Ok(())
    }

    /// Stream-end-without-`agent_report` fallback (§4.7).
    pub async fn handle_child_stream_end_without_report(&self, task_id: &str, latest_assistant_text: &str, agent_type: &str) -> Result<(), TaskError> {
        let entry = self.store.get_workspace(task_id).await?.ok_or_else(|| TaskError::TaskNotFound(task_id.to_string()))?;

        let already_reminded = {
            let mut state = self.state.lock().await;
            !state.reminded.insert(task_id.to_string())
        };

        if !already_reminded && entry.task_status == Some(TaskStatus::Running) {
            self.store.set_task_status(task_id, TaskStatus::AwaitingReport, None).await?;
            let providers_config = model_spec_core::ProvidersConfig::default();
            let opts = SendMessageOptions { file_mentions: vec![], hide_follow_up_sentinel: true };
            self.agent_session
                .send_message(task_id, "Call `agent_report` exactly once to finish this task.", opts, &providers_config)
                .await
                .map_err(|e| TaskError::Io(std::io::Error::other(e.to_string())))?;
            return Ok(());
        }

        let title = format!("Subagent ({agent_type}) report (fallback)");
        self.deliver_agent_report(task_id, Some(title), latest_assistant_text.to_string()).await
    }

    /// Parent keep-alive (§4.7): resume a parent whose stream ended while it
    /// still has active descendants.
    pub async fn keep_parent_alive_if_awaiting(&self, parent_id: &str) -> Result<(), TaskError> {
        let children = self.store.list_children(parent_id).await?;
        let has_active = children
            .iter()
            .any(|c| matches!(c.task_status, Some(TaskStatus::Queued | TaskStatus::Running | TaskStatus::AwaitingReport)));
        if !has_active {
            return Ok(());
        }
        let providers_config = model_spec_core::ProvidersConfig::default();
        let opts = SendMessageOptions { file_mentions: vec![], hide_follow_up_sentinel: true };
        self.agent_session
            .send_message(parent_id, "Call `task_await` to wait for your sub-agents to finish.", opts, &providers_config)
            .await
            .map_err(|e| TaskError::Io(std::io::Error::other(e.to_string())))?;
        Ok(())
    }

    /// `waitForAgentReport` (§4.7).
    pub async fn wait_for_agent_report(
        &self,
        task_id: &str,
        timeout: Duration,
        requesting_workspace_id: &str,
    ) -> Result<CompletedReport, TaskError> {
        if let Some(cached) = self.completed_report(task_id).await {
            return Ok(cached);
        }

        let entry = self.store.get_workspace(task_id).await?.ok_or_else(|| TaskError::TaskNotFound(task_id.to_string()))?;
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter { tx };

        {
            let mut state = self.state.lock().await;
            if entry.task_status == Some(TaskStatus::Queued) {
                state.pending_start_waiters.entry(task_id.to_string()).or_default().push(waiter);
            } else {
                state.waiters.entry(task_id.to_string()).or_default().push(waiter);
            }
        }
        self.register_foreground_await(requesting_workspace_id).await;

        let result = tokio::time::timeout(timeout, rx).await;
        self.unregister_foreground_await(requesting_workspace_id).await;

        match result {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(_)) => Err(TaskError::WaitAborted(task_id.to_string(), "waiter channel closed".into())),
            Err(_) => {
                let mut state = self.state.lock().await;
                state.waiters.remove(task_id);
                state.pending_start_waiters.remove(task_id);
                Err(TaskError::WaitTimedOut(task_id.to_string()))
            }
        }
    }

    /// Moves waiters registered while a task was queued into the active
    /// waiter set and starts their timeout clock (§4.7 `pendingStartWaitersByTaskId`).
    pub async fn promote_pending_start_waiters(&self, task_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(pending) = state.pending_start_waiters.remove(task_id) {
            state.waiters.entry(task_id.to_string()).or_default().extend(pending);
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_session::AgentSessionDeps;
    use crate::locks::WorkspaceLocks;

    /// No-op runtime: never touches git or the filesystem, so scheduling
    /// logic can be exercised without a real worktree.
    struct FakeRuntime {
        head_sha: String,
    }

    impl TaskRuntime for FakeRuntime {
        fn create_worktree(&self, parent_project_path: &str, task_id: &str, _trunk_branch: Option<&str>) -> std::io::Result<PathBuf> {
            Ok(std::path::Path::new(parent_project_path).join(".mux-worktrees").join(task_id))
        }

        fn remove_worktree(&self, _project_path: &str) -> std::io::Result<()> {
            Ok(())
        }

        fn run_init_hook(&self, _project_path: &str) -> std::io::Result<()> {
            Ok(())
        }

        fn head_commit_sha(&self, _project_path: &str) -> std::io::Result<String> {
            Ok(self.head_sha.clone())
        }
    }

    async fn deps(max_parallel_agent_tasks: usize, max_task_nesting_depth: usize) -> (Arc<TaskService>, String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path().join("workspaces.db")).unwrap());
        let root_id = store.create_workspace(Some("root".into())).await.unwrap();
        let project_path = dir.path().join("project");
        std::fs::create_dir_all(&project_path).unwrap();
        store.set_project_path(&root_id, &project_path.to_string_lossy()).await.unwrap();

        let locks = Arc::new(WorkspaceLocks::new());
        let history = Arc::new(HistoryStore::new(dir.path(), locks.clone()));
        let partial = Arc::new(crate::partial::PartialStore::new(dir.path(), locks.clone(), history.clone()));
        let stream_manager = Arc::new(StreamManager::new(dir.path().join("tmp"), locks, history.clone(), partial));
        let agent_session = Arc::new(AgentSession::new(AgentSessionDeps {
            history: history.clone(),
            stream_manager: stream_manager.clone(),
            compaction_threshold: 0.85,
            compact_model_string: None,
            use_1m_context: false,
        }));

        let agents = Arc::new(AgentRegistry::new(vec![AgentDefinition {
            agent_id: "explorer".into(),
            runnable: true,
            skip_init_hook: true,
            default_model: None,
        }]));

        let service = Arc::new(TaskService::new(TaskServiceDeps {
            store,
            history,
            stream_manager,
            agent_session,
            runtime: Arc::new(FakeRuntime { head_sha: "deadbeef".into() }),
            agents,
            max_parallel_agent_tasks,
            max_task_nesting_depth,
        }));
        (service, root_id, dir)
    }

    fn request(parent_id: &str, agent_id: &str, prompt: &str) -> CreateTaskRequest {
        CreateTaskRequest {
            parent_workspace_id: parent_id.to_string(),
            agent_id: agent_id.to_string(),
            prompt: prompt.to_string(),
            explicit_model: None,
            parent_per_agent_model: None,
            workspace_default_model: None,
            global_default_model: None,
        }
    }

    #[tokio::test]
    async fn create_runs_under_capacity_and_queues_over_capacity() {
        let (service, root_id, _dir) = deps(1, 8).await;

        let first = service.create(request(&root_id, "explorer", "first task")).await.unwrap();
        let first_id = match first {
            CreateOutcome::Running { task_id } => task_id,
            other => panic!("expected Running, got {other:?}"),
        };
        let first_entry = service.store.get_workspace(&first_id).await.unwrap().unwrap();
        assert_eq!(first_entry.task_status, Some(TaskStatus::Running));
        assert_eq!(first_entry.task_base_commit_sha.as_deref(), Some("deadbeef"));

        let second = service.create(request(&root_id, "explorer", "second task")).await.unwrap();
        match second {
            CreateOutcome::Queued { task_id } => {
                let entry = service.store.get_workspace(&task_id).await.unwrap().unwrap();
                assert_eq!(entry.task_status, Some(TaskStatus::Queued));
                assert_eq!(entry.task_prompt.as_deref(), Some("second task"));
            }
            other => panic!("expected Queued, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_rejects_agent_not_in_registry() {
        let (service, root_id, _dir) = deps(8, 8).await;
        let err = service.create(request(&root_id, "ghost", "whoami")).await.unwrap_err();
        assert!(matches!(err, TaskError::AgentNotRunnable(agent, _) if agent == "ghost"));
    }

    #[tokio::test]
    async fn create_rejects_nesting_past_max_depth() {
        let (service, root_id, _dir) = deps(8, 1).await;
        let child = service.create(request(&root_id, "explorer", "child task")).await.unwrap();
        let CreateOutcome::Running { task_id: child_id } = child else { panic!("expected child to run") };

        let err = service.create(request(&child_id, "explorer", "grandchild task")).await.unwrap_err();
        assert!(matches!(err, TaskError::DepthExceeded { depth: 2, max: 1 }));
    }

    #[tokio::test]
    async fn deliver_agent_report_rejects_with_active_descendants() {
        let (service, root_id, _dir) = deps(8, 8).await;
        let parent = service.create(request(&root_id, "explorer", "parent task")).await.unwrap();
        let CreateOutcome::Running { task_id: parent_id } = parent else { panic!("expected parent to run") };
        let _child = service.create(request(&parent_id, "explorer", "child task")).await.unwrap();

        let err = service.deliver_agent_report(&parent_id, None, "done".into()).await.unwrap_err();
        assert!(matches!(err, TaskError::HasActiveDescendants(id) if id == parent_id));
    }

    #[tokio::test]
    async fn deliver_agent_report_resolves_an_in_flight_waiter() {
        let (service, root_id, _dir) = deps(8, 8).await;
        let outcome = service.create(request(&root_id, "explorer", "leaf task")).await.unwrap();
        let CreateOutcome::Running { task_id } = outcome else { panic!("expected leaf to run") };

        let waiter_service = service.clone();
        let waiter_task_id = task_id.clone();
        let root_for_wait = root_id.clone();
        let waiter = tokio::spawn(async move {
            waiter_service.wait_for_agent_report(&waiter_task_id, Duration::from_secs(5), &root_for_wait).await
        });

        // Give the waiter a chance to register before the report lands.
        tokio::task::yield_now().await;
        service.deliver_agent_report(&task_id, Some("Done".into()), "all good".into()).await.unwrap();

        let report = waiter.await.unwrap().unwrap();
        assert_eq!(report.report_markdown, "all good");
        assert_eq!(report.title, "Done");
        assert_eq!(report.ancestor_workspace_ids, vec![root_id]);

        let cached = service.completed_report(&task_id).await.unwrap();
        assert_eq!(cached.report_markdown, "all good");
    }

    #[tokio::test]
    async fn deliver_agent_report_finalizes_pending_task_tool_call_when_parent_not_streaming() {
        let (service, root_id, _dir) = deps(8, 8).await;
        let outcome = service.create(request(&root_id, "explorer", "leaf task")).await.unwrap();
        let CreateOutcome::Running { task_id } = outcome else { panic!("expected leaf to run") };

        let mut pending = Message::new(
            "parent-turn",
            Role::Assistant,
            vec![Part::DynamicTool {
                tool_call_id: task_id.clone(),
                tool_name: "task".into(),
                state: ToolPartState::InputAvailable,
                input: serde_json::json!({"agentId": "explorer", "prompt": "leaf task"}),
                output: None,
            }],
        );
        pending.metadata.partial = false;
        service.history.append(&root_id, pending).await.unwrap();

        service.deliver_agent_report(&task_id, Some("Done".into()), "all good".into()).await.unwrap();

        let history = service.history.get_history(&root_id).await.unwrap();
        // No synthetic XML-report message appended; the tool-call part was finalized in place.
        assert_eq!(history.len(), 1);
        match &history[0].parts[0] {
            Part::DynamicTool { state, output, .. } => {
                assert_eq!(*state, ToolPartState::OutputAvailable);
                assert_eq!(output.as_ref().and_then(|o| o.get("title")).and_then(|t| t.as_str()), Some("Done"));
            }
            other => panic!("expected DynamicTool part, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_agent_report_times_out_when_never_delivered() {
        let (service, root_id, _dir) = deps(8, 8).await;
        let outcome = service.create(request(&root_id, "explorer", "leaf task")).await.unwrap();
        let CreateOutcome::Running { task_id } = outcome else { panic!("expected leaf to run") };

        let err = service
            .wait_for_agent_report(&task_id, Duration::from_millis(50), &root_id)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::WaitTimedOut(id) if id == task_id));
    }
}
