//! Local, in-process engine construction.
//!
//! `serve` wires `HistoryStore`/`StreamManager`/`AgentSession`/`McpServerManager`
//! together behind a socket; the CLI wires the same services together directly,
//! since it talks to them in-process rather than over a connection.

use std::sync::Arc;

use config::WorkstationConfig;
use loom::agent_session::{AgentSession, AgentSessionDeps};
use loom::history::HistoryStore;
use loom::locks::WorkspaceLocks;
use loom::mcp::McpServerManager;
use loom::partial::PartialStore;
use loom::stream_manager::StreamManager;
use loom_workspace::{Store, StoreError};
use model_spec_core::ProvidersConfig;

const CONFIG_APP_NAME: &str = "loom";

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Everything one CLI invocation needs to drive the engine directly.
pub struct Engine {
    pub store: Arc<Store>,
    pub history: Arc<HistoryStore>,
    pub stream_manager: Arc<StreamManager>,
    pub agent_session: Arc<AgentSession>,
    pub mcp: Arc<McpServerManager>,
    pub providers_config: ProvidersConfig,
    pub workstation_config: WorkstationConfig,
}

/// Builds the engine from `SESSIONS_ROOT`/`STREAM_TMP_ROOT`/`WORKSPACES_DB` env
/// vars, mirroring `serve`'s `build_state` convention, plus `~/.config/loom/`
/// for `workstation.toml`/`providers.toml`.
pub fn build_engine() -> Result<Engine, Box<dyn std::error::Error + Send + Sync>> {
    let sessions_root = env_or("SESSIONS_ROOT", "sessions");
    let tmp_root = env_or("STREAM_TMP_ROOT", "stream-tmp");
    let workspaces_db = env_or("WORKSPACES_DB", "workspaces.db");

    let locks = Arc::new(WorkspaceLocks::new());
    let history = Arc::new(HistoryStore::new(&sessions_root, locks.clone()));
    let partial = Arc::new(PartialStore::new(&sessions_root, locks.clone(), history.clone()));
    let stream_manager = Arc::new(StreamManager::new(&tmp_root, locks, history.clone(), partial));
    let store = Arc::new(Store::new(&workspaces_db)?);

    let workstation_config = config::load_config_or_default(CONFIG_APP_NAME, None)?;
    let providers_config = config::load_providers_config(CONFIG_APP_NAME, None)?;

    let agent_session = Arc::new(AgentSession::new(AgentSessionDeps {
        history: history.clone(),
        stream_manager: stream_manager.clone(),
        compaction_threshold: workstation_config.compaction_threshold,
        compact_model_string: workstation_config.agent_ai_defaults.compact.model_string.clone(),
        use_1m_context: workstation_config.use_1m_context,
    }));

    Ok(Engine {
        store,
        history,
        stream_manager,
        agent_session,
        mcp: Arc::new(McpServerManager::new()),
        providers_config,
        workstation_config,
    })
}

impl Engine {
    /// Resolves the workspace to run a message against: the given id if
    /// present, otherwise a freshly created workspace rooted at `working_folder`
    /// (or the current directory).
    pub async fn resolve_workspace(
        &self,
        workspace_id: Option<String>,
        working_folder: Option<&std::path::Path>,
    ) -> Result<String, StoreError> {
        if let Some(id) = workspace_id {
            return Ok(id);
        }
        let id = self.store.create_workspace(None).await?;
        let path = working_folder
            .map(|p| p.to_path_buf())
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        self.store.set_project_path(&id, &path.to_string_lossy()).await?;
        Ok(id)
    }
}
