//! [`LocalBackend`]: drives the engine in-process, no socket involved.

use async_trait::async_trait;
use loom::mcp::GetToolsRequest;
use loom_workspace::TaskStatus;

use crate::engine::Engine;
use crate::run::{format_message_line, run_message, RunError};
use crate::RunOptions;

use super::{RunBackend, RunOutput, StreamOut, ToolShowFormat};

pub struct LocalBackend {
    engine: Engine,
}

impl LocalBackend {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl RunBackend for LocalBackend {
    async fn run(&self, opts: &RunOptions, stream_out: StreamOut) -> Result<RunOutput, RunError> {
        let result = run_message(&self.engine, opts, stream_out.clone()).await?;
        Ok(if stream_out.is_none() && opts.output_json {
            RunOutput::Json { workspace_id: result.workspace_id, events: result.events }
        } else {
            RunOutput::Reply { workspace_id: result.workspace_id, reply: result.reply }
        })
    }

    async fn list_tools(&self, opts: &RunOptions) -> Result<(), RunError> {
        let workspace_id = opts.workspace_id.as_deref().unwrap_or("cli");
        let req = GetToolsRequest { workspace_id, servers: Vec::new(), oauth_token_present: false };
        let tools = self.engine.mcp.get_tools_for_workspace(req).await?;
        for (name, spec) in tools {
            match spec.description {
                Some(desc) => println!("{:<32} {}", name, desc),
                None => println!("{}", name),
            }
        }
        Ok(())
    }

    async fn show_tool(&self, opts: &RunOptions, name: &str, format: ToolShowFormat) -> Result<(), RunError> {
        let workspace_id = opts.workspace_id.as_deref().unwrap_or("cli");
        let req = GetToolsRequest { workspace_id, servers: Vec::new(), oauth_token_present: false };
        let tools = self.engine.mcp.get_tools_for_workspace(req).await?;
        let Some((namespaced_name, spec)) = tools.into_iter().find(|(n, _)| n == name) else {
            return Err(RunError::ToolNotFound(name.to_string()));
        };
        let as_json = serde_json::json!({
            "name": namespaced_name,
            "description": spec.description,
            "input_schema": spec.input_schema,
        });
        match format {
            ToolShowFormat::Json => println!("{}", serde_json::to_string_pretty(&as_json).unwrap_or_default()),
            ToolShowFormat::Yaml => println!("{}", serde_yaml::to_string(&as_json).unwrap_or_default()),
        }
        Ok(())
    }

    async fn list_tasks(&self, workspace_id: &str) -> Result<(), RunError> {
        let children = self.engine.store.list_children(workspace_id).await?;
        if children.is_empty() {
            println!("no tasks under workspace {}", workspace_id);
            return Ok(());
        }
        for entry in children {
            let status = match entry.task_status {
                Some(TaskStatus::Queued) => "queued",
                Some(TaskStatus::Running) => "running",
                Some(TaskStatus::AwaitingReport) => "awaiting_report",
                Some(TaskStatus::Reported) => "reported",
                None => "-",
            };
            let prompt = entry.task_prompt.as_deref().unwrap_or("");
            println!("{:<38} {:<14} {}", entry.id, status, prompt);
        }
        Ok(())
    }

    async fn tail(&self, workspace_id: &str, limit: Option<usize>) -> Result<(), RunError> {
        let history = self.engine.history.get_history(workspace_id).await?;
        let start = limit.map(|n| history.len().saturating_sub(n)).unwrap_or(0);
        for message in &history[start..] {
            println!("{}", format_message_line(message));
        }
        Ok(())
    }
}
