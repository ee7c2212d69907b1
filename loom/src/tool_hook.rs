//! `ToolHookRunner`: wraps tool execution with user-supplied pre/post hook
//! scripts using a stdout readiness-marker protocol (spec §4.8).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::ToolHookError;

pub const TOOL_INPUT_ENV_LIMIT: usize = 8_000;
pub const DEFAULT_PRE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POST_TIMEOUT: Duration = Duration::from_secs(10);

/// Either the tool hook script path is split into pre/post variants, or a
/// single combined hook handles both phases via the marker protocol.
#[derive(Debug, Clone)]
pub enum HookScripts {
    Combined(PathBuf),
    Split { pre: Option<PathBuf>, post: Option<PathBuf> },
}

#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub input: serde_json::Value,
    pub workspace_id: String,
    pub project_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub tool_result: serde_json::Value,
    pub stdout_after_marker: String,
}

pub struct ToolHookRunner {
    runtime_temp_dir: PathBuf,
    pre_timeout: Duration,
    post_timeout: Duration,
}

impl ToolHookRunner {
    pub fn new(runtime_temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_temp_dir: runtime_temp_dir.into(),
            pre_timeout: DEFAULT_PRE_TIMEOUT,
            post_timeout: DEFAULT_POST_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, pre: Duration, post: Duration) -> Self {
        self.pre_timeout = pre;
        self.post_timeout = post;
        self
    }

    /// Locates `.mux/tool_hook` (project) or `~/.mux/tool_hook` (user),
    /// falling back to split `tool_pre`/`tool_post` scripts. First match wins.
    pub fn resolve_hook(project_dir: &Path, home_dir: &Path) -> Option<HookScripts> {
        let project_combined = project_dir.join(".mux").join("tool_hook");
        if project_combined.exists() {
            return Some(HookScripts::Combined(project_combined));
        }
        let user_combined = home_dir.join(".mux").join("tool_hook");
        if user_combined.exists() {
            return Some(HookScripts::Combined(user_combined));
        }

        let pre = [project_dir.join(".mux").join("tool_pre"), home_dir.join(".mux").join("tool_pre")]
            .into_iter()
            .find(|p| p.exists());
        let post = [project_dir.join(".mux").join("tool_post"), home_dir.join(".mux").join("tool_post")]
            .into_iter()
            .find(|p| p.exists());
        if pre.is_some() || post.is_some() {
            return Some(HookScripts::Split { pre, post });
        }
        None
    }

    fn marker() -> String {
        format!("MUX_EXEC_{}", Uuid::new_v4().simple())
    }

    /// Encodes `value` for the env, spilling to a temp file when it exceeds
    /// `TOOL_INPUT_ENV_LIMIT`. Returns the `(MUX_TOOL_INPUT, MUX_TOOL_INPUT_PATH)`
    /// env pair and the temp file path if one was created.
    fn encode_for_env(
        &self,
        value: &serde_json::Value,
        file_prefix: &str,
    ) -> Result<(String, Option<String>, Option<PathBuf>), ToolHookError> {
        let json = serde_json::to_string(value).map_err(|e| ToolHookError::ToolFailed(e.to_string()))?;
        if json.len() <= TOOL_INPUT_ENV_LIMIT {
            return Ok((json, None, None));
        }
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let path = self.runtime_temp_dir.join(format!("mux-{file_prefix}-{ts}-{}.json", Uuid::new_v4()));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &json)?;
        Ok(("__MUX_TOOL_INPUT_FILE__".to_string(), Some(path.display().to_string()), Some(path)))
    }

    /// Runs the combined hook (§4.8 `runWithHook`): spawns the hook, waits for
    /// the readiness marker on stdout, executes `run_tool`, writes the
    /// serialized result to the hook's stdin, then drains remaining stdout.
    pub async fn run_with_hook<F, Fut>(
        &self,
        hook_path: &Path,
        invocation: &ToolInvocation,
        run_tool: F,
    ) -> Result<HookOutcome, ToolHookError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<serde_json::Value, String>>,
    {
        let marker = Self::marker();
        let (input_env, input_path_env, temp_file) = self.encode_for_env(&invocation.input, "tool-input")?;

        let mut command = Command::new(hook_path);
        command
            .env("MUX_TOOL", &invocation.tool_name)
            .env("MUX_TOOL_INPUT", &input_env)
            .env("MUX_WORKSPACE_ID", &invocation.workspace_id)
            .env("MUX_PROJECT_DIR", invocation.project_dir.display().to_string())
            .env("MUX_EXEC", &marker)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(path) = &input_path_env {
            command.env("MUX_TOOL_INPUT_PATH", path);
        }

        let mut child = command.spawn()?;
        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stdin = child.stdin.take().expect("piped stdin");

        let marker_result = timeout(self.pre_timeout, Self::read_until_marker(&mut stdout, &marker)).await;
        let before_marker = match marker_result {
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => {
                Self::cleanup(temp_file.as_deref());
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                Self::cleanup(temp_file.as_deref());
                let _ = child.kill().await;
                return Err(ToolHookError::Timeout { phase: "pre" });
            }
        };
        let _ = before_marker;

        let tool_result = run_tool().await;
        let wire = match &tool_result {
            Ok(value) => serde_json::json!(value),
            Err(message) => serde_json::json!({ "error": message }),
        };
        let mut line = serde_json::to_string(&wire).map_err(|e| ToolHookError::ToolFailed(e.to_string()))?;
        line.push('\n');
        let _ = stdin.write_all(line.as_bytes()).await;
        drop(stdin);

        let post_result = timeout(self.post_timeout, Self::drain_rest(&mut stdout)).await;
        let stdout_after_marker = match post_result {
            Ok(Ok(buf)) => buf,
            Ok(Err(_)) | Err(_) => String::new(),
        };

        let _ = child.wait().await;
        Self::cleanup(temp_file.as_deref());

        match tool_result {
            Ok(value) => Ok(HookOutcome { tool_result: value, stdout_after_marker }),
            Err(message) => Err(ToolHookError::ToolFailed(message)),
        }
    }

    async fn read_until_marker(
        stdout: &mut tokio::process::ChildStdout,
        marker: &str,
    ) -> Result<String, ToolHookError> {
        let mut collected = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stdout.read(&mut chunk).await?;
            if n == 0 {
                return Err(ToolHookError::ToolFailed("hook exited before emitting readiness marker".into()));
            }
            collected.extend_from_slice(&chunk[..n]);
            if let Ok(text) = std::str::from_utf8(&collected) {
                if text.contains(marker) {
                    return Ok(text.to_string());
                }
            }
        }
    }

    async fn drain_rest(stdout: &mut tokio::process::ChildStdout) -> std::io::Result<String> {
        let mut buf = String::new();
        stdout.read_to_string(&mut buf).await?;
        Ok(buf)
    }

    fn cleanup(temp_file: Option<&Path>) {
        if let Some(path) = temp_file {
            let _ = std::fs::remove_file(path);
        }
    }

    /// Runs a standalone pre-hook: exit 0 allows the tool call, non-zero blocks it.
    pub async fn run_pre_hook(&self, hook_path: &Path, invocation: &ToolInvocation) -> Result<(), ToolHookError> {
        let (input_env, input_path_env, temp_file) = self.encode_for_env(&invocation.input, "tool-input")?;
        let mut command = Command::new(hook_path);
        command
            .env("MUX_TOOL", &invocation.tool_name)
            .env("MUX_TOOL_INPUT", &input_env)
            .env("MUX_WORKSPACE_ID", &invocation.workspace_id)
            .env("MUX_PROJECT_DIR", invocation.project_dir.display().to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(path) = &input_path_env {
            command.env("MUX_TOOL_INPUT_PATH", path);
        }

        let result = timeout(self.pre_timeout, command.status()).await;
        Self::cleanup(temp_file.as_deref());
        match result {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(ToolHookError::NonZeroExit(status.code().unwrap_or(-1))),
            Ok(Err(e)) => Err(ToolHookError::Io(e)),
            Err(_) => Err(ToolHookError::Timeout { phase: "pre" }),
        }
    }

    /// Runs a standalone post-hook with the tool result attached; failures are
    /// logged by the caller, never surfaced back to the LLM.
    pub async fn run_post_hook(
        &self,
        hook_path: &Path,
        invocation: &ToolInvocation,
        tool_result: &serde_json::Value,
    ) -> Result<(), ToolHookError> {
        let (input_env, input_path_env, input_temp) = self.encode_for_env(&invocation.input, "tool-input")?;
        let (result_env, result_path_env, result_temp) = self.encode_for_env(tool_result, "tool-result")?;

        let mut command = Command::new(hook_path);
        command
            .env("MUX_TOOL", &invocation.tool_name)
            .env("MUX_TOOL_INPUT", &input_env)
            .env("MUX_TOOL_RESULT", &result_env)
            .env("MUX_WORKSPACE_ID", &invocation.workspace_id)
            .env("MUX_PROJECT_DIR", invocation.project_dir.display().to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(path) = &input_path_env {
            command.env("MUX_TOOL_INPUT_PATH", path);
        }
        if let Some(path) = &result_path_env {
            command.env("MUX_TOOL_RESULT_PATH", path);
        }

        let result = timeout(self.post_timeout, command.status()).await;
        Self::cleanup(input_temp.as_deref());
        Self::cleanup(result_temp.as_deref());
        match result {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(ToolHookError::NonZeroExit(status.code().unwrap_or(-1))),
            Ok(Err(e)) => Err(ToolHookError::Io(e)),
            Err(_) => Err(ToolHookError::Timeout { phase: "post" }),
        }
    }
}
