//! WebSocket server for Loom (axum + ws).
//!
//! Listens on ws://127.0.0.1:8080, handles `run`, `tools_list`, `tool_show`,
//! `ping` (§6.1).
//!
//! **Public API**: [`run_serve`], [`run_serve_on_listener`].

mod app;
mod connection;
mod protocol;
mod response;
mod run;
mod tools;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::info;

use loom::agent_session::{AgentSession, AgentSessionDeps};
use loom::history::HistoryStore;
use loom::locks::WorkspaceLocks;
use loom::mcp::McpServerManager;
use loom::partial::PartialStore;
use loom::stream_manager::StreamManager;

use app::{router, run_config_from_env, AppState};

const DEFAULT_WS_ADDR: &str = "127.0.0.1:8080";
const CONFIG_APP_NAME: &str = "loom";

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn build_state(once: bool, shutdown_tx: Option<oneshot::Sender<()>>) -> Result<Arc<AppState>, Box<dyn std::error::Error + Send + Sync>> {
    let sessions_root = env_or("SESSIONS_ROOT", "sessions");
    let tmp_root = env_or("STREAM_TMP_ROOT", "stream-tmp");

    let locks = Arc::new(WorkspaceLocks::new());
    let history = Arc::new(HistoryStore::new(&sessions_root, locks.clone()));
    let partial = Arc::new(PartialStore::new(&sessions_root, locks.clone(), history.clone()));
    let stream_manager = Arc::new(StreamManager::new(&tmp_root, locks, history.clone(), partial));

    let workstation_config = config::load_config_or_default(CONFIG_APP_NAME, None)?;
    let providers_config = config::load_providers_config(CONFIG_APP_NAME, None)?;

    let agent_session = Arc::new(AgentSession::new(AgentSessionDeps {
        history,
        stream_manager: stream_manager.clone(),
        compaction_threshold: workstation_config.compaction_threshold,
        compact_model_string: workstation_config.agent_ai_defaults.compact.model_string,
        use_1m_context: workstation_config.use_1m_context,
    }));

    Ok(Arc::new(AppState {
        shutdown_tx: Arc::new(std::sync::Mutex::new(if once { shutdown_tx } else { None })),
        stream_manager,
        agent_session,
        mcp: Arc::new(McpServerManager::new()),
        providers_config,
        run_config: run_config_from_env(),
    }))
}

/// Runs the WebSocket server on an existing listener. Used by tests (bind to 127.0.0.1:0 then pass listener).
/// When `once` is true, accepts one connection, handles it, then returns.
pub async fn run_serve_on_listener(
    listener: TcpListener,
    once: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("WebSocket server listening on ws://{}", addr);
    if once {
        info!("will exit after first connection is done (once mode, used by tests)");
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let state = build_state(once, Some(shutdown_tx))?;
    let app = router(state);

    if once {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await?;
        info!("connection done, exiting (once mode)");
    } else {
        axum::serve(listener, app).await?;
    }
    Ok(())
}

/// Runs the WebSocket server. Listens on `addr` (default 127.0.0.1:8080).
/// When `once` is true, accepts one connection, handles it, then returns (process exits).
pub async fn run_serve(
    addr: Option<&str>,
    once: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = addr.unwrap_or(DEFAULT_WS_ADDR);
    let listener = TcpListener::bind(addr).await?;
    run_serve_on_listener(listener, once).await
}
