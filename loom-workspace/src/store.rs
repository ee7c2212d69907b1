//! SQLite-backed workspace store: workspace entries, task-tree state, and
//! thread membership (spec §3 "Workspace entry").

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Workspace metadata for list_workspaces.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkspaceMeta {
    pub id: String,
    pub name: Option<String>,
    /// Milliseconds since Unix epoch.
    pub created_at_ms: i64,
}

/// Thread membership for list_threads (UI: "某 workspace 下所有对话列表").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadInWorkspace {
    pub thread_id: String,
    /// Milliseconds since Unix epoch.
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeConfig {
    Local,
    Worktree,
    Ssh,
}

impl RuntimeConfig {
    fn as_str(self) -> &'static str {
        match self {
            RuntimeConfig::Local => "local",
            RuntimeConfig::Worktree => "worktree",
            RuntimeConfig::Ssh => "ssh",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "worktree" => RuntimeConfig::Worktree,
            "ssh" => RuntimeConfig::Ssh,
            _ => RuntimeConfig::Local,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    AwaitingReport,
    Reported,
}

impl TaskStatus {
    fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::AwaitingReport => "awaiting_report",
            TaskStatus::Reported => "reported",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "awaiting_report" => Some(TaskStatus::AwaitingReport),
            "reported" => Some(TaskStatus::Reported),
            _ => None,
        }
    }
}

/// A workspace entry (spec §3 "Workspace entry"). Fields prefixed `task_`
/// only apply to sub-agent task workspaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    pub id: String,
    pub name: Option<String>,
    pub project_path: String,
    pub parent_workspace_id: Option<String>,
    pub runtime_config: RuntimeConfig,
    pub agent_id: Option<String>,
    pub task_status: Option<TaskStatus>,
    pub task_prompt: Option<String>,
    pub task_trunk_branch: Option<String>,
    pub task_base_commit_sha: Option<String>,
    pub task_model_string: Option<String>,
    pub task_thinking_level: Option<String>,
    /// Free-form per-task experiment flags, serialized as JSON text.
    pub task_experiments: Option<serde_json::Value>,
    pub ai_settings: Option<serde_json::Value>,
    pub ai_settings_by_agent: Option<serde_json::Value>,
    pub reported_at_ms: Option<i64>,
    pub created_at_ms: i64,
}

fn system_time_to_i64(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn parse_json_col(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkspaceEntry> {
    let runtime_config: String = row.get("runtime_config")?;
    let task_status: Option<String> = row.get("task_status")?;
    let task_experiments: Option<String> = row.get("task_experiments")?;
    let ai_settings: Option<String> = row.get("ai_settings")?;
    let ai_settings_by_agent: Option<String> = row.get("ai_settings_by_agent")?;
    Ok(WorkspaceEntry {
        id: row.get("id")?,
        name: row.get("name")?,
        project_path: row.get("project_path")?,
        parent_workspace_id: row.get("parent_workspace_id")?,
        runtime_config: RuntimeConfig::parse(&runtime_config),
        agent_id: row.get("agent_id")?,
        task_status: task_status.as_deref().and_then(TaskStatus::parse),
        task_prompt: row.get("task_prompt")?,
        task_trunk_branch: row.get("task_trunk_branch")?,
        task_base_commit_sha: row.get("task_base_commit_sha")?,
        task_model_string: row.get("task_model_string")?,
        task_thinking_level: row.get("task_thinking_level")?,
        task_experiments: parse_json_col(task_experiments),
        ai_settings: parse_json_col(ai_settings),
        ai_settings_by_agent: parse_json_col(ai_settings_by_agent),
        reported_at_ms: row.get("reported_at")?,
        created_at_ms: row.get("created_at")?,
    })
}

/// Arguments for creating a new task (sub-agent) workspace.
#[derive(Debug, Clone, Default)]
pub struct NewTaskWorkspace {
    pub name: Option<String>,
    pub project_path: String,
    pub parent_workspace_id: String,
    pub runtime_config: RuntimeConfig,
    pub agent_id: String,
    pub task_status: TaskStatus,
    pub task_prompt: Option<String>,
    pub task_trunk_branch: Option<String>,
    pub task_base_commit_sha: Option<String>,
    pub task_model_string: Option<String>,
    pub task_thinking_level: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::Local
    }
}

const WORKSPACE_COLUMNS: &str = "id, name, project_path, parent_workspace_id, runtime_config, agent_id, \
    task_status, task_prompt, task_trunk_branch, task_base_commit_sha, task_model_string, \
    task_thinking_level, task_experiments, ai_settings, ai_settings_by_agent, reported_at, created_at";

/// SQLite-backed workspace store. Own DB, independent of loom checkpoint/store.
pub struct Store {
    db: Arc<Mutex<rusqlite::Connection>>,
}

impl Store {
    /// Opens or creates the database and tables.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&path).map_err(|e| StoreError::Storage(e.to_string()))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                name TEXT,
                project_path TEXT NOT NULL DEFAULT '',
                parent_workspace_id TEXT,
                runtime_config TEXT NOT NULL DEFAULT 'local',
                agent_id TEXT,
                task_status TEXT,
                task_prompt TEXT,
                task_trunk_branch TEXT,
                task_base_commit_sha TEXT,
                task_model_string TEXT,
                task_thinking_level TEXT,
                task_experiments TEXT,
                ai_settings TEXT,
                ai_settings_by_agent TEXT,
                reported_at INTEGER,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (parent_workspace_id) REFERENCES workspaces(id)
            );
            CREATE INDEX IF NOT EXISTS idx_workspaces_parent ON workspaces(parent_workspace_id);
            CREATE INDEX IF NOT EXISTS idx_workspaces_task_status ON workspaces(task_status);
            CREATE TABLE IF NOT EXISTS workspace_threads (
                workspace_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (workspace_id, thread_id),
                FOREIGN KEY (workspace_id) REFERENCES workspaces(id)
            );
            CREATE INDEX IF NOT EXISTS idx_workspace_threads_workspace_id ON workspace_threads(workspace_id);
            "#,
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates a workspace. Returns the id.
    pub async fn create_workspace(&self, name: Option<String>) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = system_time_to_i64(SystemTime::now());
        let name = name.as_deref().map(String::from);
        let db = self.db.clone();
        tokio::task::block_in_place(|| {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            conn.execute(
                "INSERT INTO workspaces (id, name, runtime_config, created_at) VALUES (?1, ?2, 'local', ?3)",
                rusqlite::params![&id, name.as_deref(), now],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(id)
        })
    }

    /// Creates a sub-agent task workspace row (spec §4.7 `create`, persistence step).
    pub async fn create_task_workspace(&self, new: NewTaskWorkspace) -> Result<WorkspaceEntry, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = system_time_to_i64(SystemTime::now());
        let db = self.db.clone();
        let new2 = new.clone_for_insert();
        tokio::task::block_in_place(move || {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            conn.execute(
                "INSERT INTO workspaces (id, name, project_path, parent_workspace_id, runtime_config, \
                 agent_id, task_status, task_prompt, task_trunk_branch, task_base_commit_sha, \
                 task_model_string, task_thinking_level, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    &id,
                    new2.name,
                    new2.project_path,
                    new2.parent_workspace_id,
                    new2.runtime_config.as_str(),
                    new2.agent_id,
                    new2.task_status.as_str(),
                    new2.task_prompt,
                    new2.task_trunk_branch,
                    new2.task_base_commit_sha,
                    new2.task_model_string,
                    new2.task_thinking_level,
                    now,
                ],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            let mut stmt = conn
                .prepare(&format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = ?1"))
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            stmt.query_row(rusqlite::params![&id], row_to_entry)
                .map_err(|e| StoreError::Storage(e.to_string()))
        })
    }

    pub async fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceEntry>, StoreError> {
        let db = self.db.clone();
        let id = id.to_string();
        tokio::task::block_in_place(move || {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            let mut stmt = conn
                .prepare(&format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = ?1"))
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            match stmt.query_row(rusqlite::params![&id], row_to_entry) {
                Ok(entry) => Ok(Some(entry)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(StoreError::Storage(e.to_string())),
            }
        })
    }

    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<WorkspaceEntry>, StoreError> {
        let db = self.db.clone();
        let parent_id = parent_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE parent_workspace_id = ?1 ORDER BY created_at ASC"
                ))
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![&parent_id], row_to_entry)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Storage(e.to_string()))
        })
    }

    /// All `queued` task workspaces, oldest-first (§4.7 `maybeStartQueuedTasks` drain order).
    pub async fn list_queued_tasks(&self) -> Result<Vec<WorkspaceEntry>, StoreError> {
        let db = self.db.clone();
        tokio::task::block_in_place(move || {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE task_status = 'queued' ORDER BY created_at ASC"
                ))
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let rows = stmt.query_map([], row_to_entry).map_err(|e| StoreError::Storage(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Storage(e.to_string()))
        })
    }

    /// Counts workspaces whose `task_status` ∈ {queued, running, awaiting_report},
    /// excluding the ids in `exclude` (foreground-awaiting parents; §4.7 deadlock note).
    pub async fn count_active_agent_tasks(&self, exclude: &[String]) -> Result<usize, StoreError> {
        let db = self.db.clone();
        let exclude = exclude.to_vec();
        tokio::task::block_in_place(move || {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            let mut stmt = conn
                .prepare("SELECT id FROM workspaces WHERE task_status IN ('queued','running','awaiting_report')")
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| StoreError::Storage(e.to_string()))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(ids.iter().filter(|id| !exclude.contains(id)).count())
        })
    }

    /// Depth of `id` counting edges to the root (root has depth 0).
    pub async fn depth(&self, id: &str) -> Result<usize, StoreError> {
        let mut depth = 0usize;
        let mut current = id.to_string();
        let mut seen = std::collections::HashSet::new();
        loop {
            if !seen.insert(current.clone()) {
                return Err(StoreError::Storage(format!("cycle detected in workspace ancestry at {current}")));
            }
            if depth > 32 {
                return Err(StoreError::Storage("workspace ancestry exceeds max recursion depth".into()));
            }
            let Some(entry) = self.get_workspace(&current).await? else {
                return Err(StoreError::NotFound(current));
            };
            match entry.parent_workspace_id {
                Some(parent) => {
                    depth += 1;
                    current = parent;
                }
                None => return Ok(depth),
            }
        }
    }

    pub async fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        reported_at_ms: Option<i64>,
    ) -> Result<(), StoreError> {
        let db = self.db.clone();
        let id = id.to_string();
        tokio::task::block_in_place(move || {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            conn.execute(
                "UPDATE workspaces SET task_status = ?1, reported_at = COALESCE(?2, reported_at) WHERE id = ?3",
                rusqlite::params![status.as_str(), reported_at_ms, id],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
    }

    /// Links a workspace to a project directory on disk (e.g. when onboarding
    /// a workspace or provisioning a sub-agent's worktree).
    pub async fn set_project_path(&self, id: &str, project_path: &str) -> Result<(), StoreError> {
        let db = self.db.clone();
        let id = id.to_string();
        let project_path = project_path.to_string();
        tokio::task::block_in_place(move || {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            conn.execute(
                "UPDATE workspaces SET project_path = ?1 WHERE id = ?2",
                rusqlite::params![project_path, id],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
    }

    pub async fn set_task_base_commit_sha(&self, id: &str, sha: &str) -> Result<(), StoreError> {
        let db = self.db.clone();
        let id = id.to_string();
        let sha = sha.to_string();
        tokio::task::block_in_place(move || {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            conn.execute(
                "UPDATE workspaces SET task_base_commit_sha = ?1 WHERE id = ?2",
                rusqlite::params![sha, id],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
    }

    pub async fn clear_task_prompt(&self, id: &str) -> Result<(), StoreError> {
        let db = self.db.clone();
        let id = id.to_string();
        tokio::task::block_in_place(move || {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            conn.execute("UPDATE workspaces SET task_prompt = NULL WHERE id = ?1", rusqlite::params![id])
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
    }

    pub async fn remove_workspace(&self, id: &str) -> Result<(), StoreError> {
        let db = self.db.clone();
        let id = id.to_string();
        tokio::task::block_in_place(move || {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            conn.execute("DELETE FROM workspace_threads WHERE workspace_id = ?1", rusqlite::params![&id])
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            conn.execute("DELETE FROM workspaces WHERE id = ?1", rusqlite::params![&id])
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
    }

    /// Lists all workspaces (no multi-tenant filter for now).
    pub async fn list_workspaces(&self) -> Result<Vec<WorkspaceMeta>, StoreError> {
        let db = self.db.clone();
        tokio::task::block_in_place(|| {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            let mut stmt = conn
                .prepare("SELECT id, name, created_at FROM workspaces ORDER BY created_at ASC")
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    let created_at_ms: i64 = row.get(2)?;
                    Ok(WorkspaceMeta {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at_ms,
                    })
                })
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Storage(e.to_string()))
        })
    }

    /// Lists threads in a workspace (for UI "某 workspace 下所有对话列表").
    pub async fn list_threads(&self, workspace_id: &str) -> Result<Vec<ThreadInWorkspace>, StoreError> {
        let db = self.db.clone();
        let workspace_id = workspace_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT thread_id, created_at FROM workspace_threads WHERE workspace_id = ?1 ORDER BY created_at DESC",
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![workspace_id.as_str()], |row| {
                    let created_at_ms: i64 = row.get(1)?;
                    Ok(ThreadInWorkspace {
                        thread_id: row.get(0)?,
                        created_at_ms,
                    })
                })
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Storage(e.to_string()))
        })
    }

    /// Adds a thread to a workspace. Idempotent: existing row is a no-op.
    pub async fn add_thread_to_workspace(
        &self,
        workspace_id: &str,
        thread_id: &str,
    ) -> Result<(), StoreError> {
        let now = system_time_to_i64(SystemTime::now());
        let db = self.db.clone();
        let workspace_id = workspace_id.to_string();
        let thread_id = thread_id.to_string();
        tokio::task::block_in_place(|| {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            conn.execute(
                "INSERT OR IGNORE INTO workspace_threads (workspace_id, thread_id, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![workspace_id, thread_id, now],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
    }

    /// Removes a thread from a workspace.
    pub async fn remove_thread_from_workspace(
        &self,
        workspace_id: &str,
        thread_id: &str,
    ) -> Result<(), StoreError> {
        let db = self.db.clone();
        let workspace_id = workspace_id.to_string();
        let thread_id = thread_id.to_string();
        tokio::task::block_in_place(|| {
            let conn = db.lock().map_err(|_| StoreError::Storage("lock".into()))?;
            conn.execute(
                "DELETE FROM workspace_threads WHERE workspace_id = ?1 AND thread_id = ?2",
                rusqlite::params![workspace_id, thread_id],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
    }
}

impl NewTaskWorkspace {
    fn clone_for_insert(&self) -> Self {
        self.clone()
    }
}
