//! Handle `ToolsList` and `ToolShow` requests, grounded in
//! [`loom::mcp::McpServerManager`].

use std::sync::Arc;

use loom::mcp::GetToolsRequest;

use super::app::AppState;
use super::protocol::{
    ErrorResponse, ServerResponse, ToolShowOutput, ToolShowRequest, ToolShowResponse,
    ToolSpecWire, ToolsListRequest, ToolsListResponse,
};

pub(crate) async fn handle_tools_list(r: ToolsListRequest, state: &Arc<AppState>) -> ServerResponse {
    let id = r.id.clone();
    let servers = r.servers.into_iter().map(Into::into).collect();
    let req = GetToolsRequest {
        workspace_id: &r.workspace_id,
        servers,
        oauth_token_present: r.oauth_token_present,
    };
    match state.mcp.get_tools_for_workspace(req).await {
        Ok(tools) => {
            let tools = tools
                .into_iter()
                .map(|(namespaced_name, spec)| ToolSpecWire {
                    name: namespaced_name,
                    description: spec.description,
                    input_schema: spec.input_schema,
                })
                .collect();
            ServerResponse::ToolsList(ToolsListResponse { id, tools })
        }
        Err(e) => ServerResponse::Error(ErrorResponse { id: Some(id), error: e.to_string() }),
    }
}

pub(crate) async fn handle_tool_show(r: ToolShowRequest, state: &Arc<AppState>) -> ServerResponse {
    let id = r.id.clone();
    let servers = r.servers.clone().into_iter().map(Into::into).collect();
    let req = GetToolsRequest {
        workspace_id: &r.workspace_id,
        servers,
        oauth_token_present: r.oauth_token_present,
    };
    let tools = match state.mcp.get_tools_for_workspace(req).await {
        Ok(tools) => tools,
        Err(e) => return ServerResponse::Error(ErrorResponse { id: Some(id), error: e.to_string() }),
    };

    let Some((namespaced_name, spec)) = tools.into_iter().find(|(name, _)| *name == r.name) else {
        return ServerResponse::Error(ErrorResponse {
            id: Some(id),
            error: format!("tool not found: {}", r.name),
        });
    };

    let as_json = serde_json::json!({
        "name": namespaced_name,
        "description": spec.description,
        "input_schema": spec.input_schema,
    });
    let (tool, tool_yaml) = match r.output {
        Some(ToolShowOutput::Yaml) => (None, Some(serde_yaml::to_string(&as_json).unwrap_or_default())),
        _ => (Some(as_json), None),
    };
    ServerResponse::ToolShow(ToolShowResponse { id, tool, tool_yaml })
}
