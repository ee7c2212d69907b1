//! Typed workstation config: compaction policy, task scheduler limits, and
//! agent AI defaults, loaded from `~/.config/<app>/workstation.toml`
//! (falling back to defaults when the file is absent — spec §4.3/§4.7).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::LoadError;

/// `agentAiDefaults.compact` — the model preferred for compaction-summary turns
/// (spec §4.6 step 4 / scenario S3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactAiDefaults {
    /// `"<provider>:<model>"`, e.g. `"openai:gpt-4o-mini"`.
    pub model_string: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentAiDefaults {
    #[serde(default)]
    pub compact: CompactAiDefaults,
    /// Fallback model string used when nothing more specific is configured.
    pub default_model: Option<String>,
}

/// Top-level workstation config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkstationConfig {
    /// Compaction usage-percentage threshold in (0, 1]. 1.0 disables auto-compaction.
    pub compaction_threshold: f64,
    pub agent_ai_defaults: AgentAiDefaults,
    pub max_parallel_agent_tasks: usize,
    pub max_task_nesting_depth: usize,
    /// Whether the `1M context` provider beta is enabled by default.
    pub use_1m_context: bool,
}

impl Default for WorkstationConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 0.85,
            agent_ai_defaults: AgentAiDefaults::default(),
            max_parallel_agent_tasks: 4,
            max_task_nesting_depth: 8,
            use_1m_context: false,
        }
    }
}

fn config_path(app_name: &str, override_dir: Option<&Path>) -> Result<PathBuf, LoadError> {
    if let Some(dir) = override_dir {
        return Ok(dir.join("workstation.toml"));
    }
    let base = cross_xdg::BaseDirs::new().map_err(|e| LoadError::XdgPath(e.to_string()))?;
    Ok(base.config_home().join(app_name).join("workstation.toml"))
}

/// Loads `workstation.toml`, returning `WorkstationConfig::default()` when the
/// file does not exist. A malformed file is an error (distinct from "absent"),
/// since a typo'd config should never be silently ignored.
pub fn load_config_or_default(
    app_name: &str,
    override_dir: Option<&Path>,
) -> Result<WorkstationConfig, LoadError> {
    let path = config_path(app_name, override_dir)?;
    if !path.exists() {
        return Ok(WorkstationConfig::default());
    }
    let content = std::fs::read_to_string(&path).map_err(LoadError::XdgRead)?;
    let config: WorkstationConfig = toml::from_str(&content)?;
    Ok(config)
}
