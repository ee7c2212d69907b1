//! Axum app: shared engine state, router, and WebSocket upgrade handler.

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Router,
};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use loom::agent_session::AgentSession;
use loom::mcp::McpServerManager;
use loom::stream_manager::StreamManager;
use model_spec_core::ProvidersConfig;

use super::connection::handle_socket;

/// Bounds on the per-run forwarding path, overridable for tests.
#[derive(Clone, Copy)]
pub(crate) struct RunConfig {
    pub(crate) event_queue_capacity: usize,
}

pub(crate) fn run_config_from_env() -> RunConfig {
    let event_queue_capacity = std::env::var("RUN_EVENT_QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(128);
    RunConfig { event_queue_capacity }
}

/// Everything a connection needs to serve `run` / `tools_list` / `tool_show`
/// requests. Built once in [`crate::run_serve_on_listener`] and shared across
/// every WebSocket connection.
pub(crate) struct AppState {
    pub(crate) shutdown_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    pub(crate) stream_manager: Arc<StreamManager>,
    pub(crate) agent_session: Arc<AgentSession>,
    pub(crate) mcp: Arc<McpServerManager>,
    pub(crate) providers_config: ProvidersConfig,
    pub(crate) run_config: RunConfig,
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new().route("/", get(ws_handler)).with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let shutdown_tx = state.shutdown_tx.lock().ok().and_then(|mut g| g.take());
    ws.on_upgrade(move |socket| handle_socket(socket, shutdown_tx, state))
}
