//! Loads [`model_spec_core::ProvidersConfig`] from `~/.config/<app>/providers.toml`.

use std::path::{Path, PathBuf};

use model_spec_core::ProvidersConfig;

use crate::LoadError;

fn providers_path(app_name: &str, override_dir: Option<&Path>) -> Result<PathBuf, LoadError> {
    if let Some(dir) = override_dir {
        return Ok(dir.join("providers.toml"));
    }
    let base = cross_xdg::BaseDirs::new().map_err(|e| LoadError::XdgPath(e.to_string()))?;
    Ok(base.config_home().join(app_name).join("providers.toml"))
}

/// Loads per-install provider context-limit overrides. Absent file → empty
/// (no overrides) config, so `effective_context_limit` falls back to the
/// static table.
pub fn load_providers_config(
    app_name: &str,
    override_dir: Option<&Path>,
) -> Result<ProvidersConfig, LoadError> {
    let path = providers_path(app_name, override_dir)?;
    if !path.exists() {
        return Ok(ProvidersConfig::default());
    }
    let content = std::fs::read_to_string(&path).map_err(LoadError::XdgRead)?;
    let config: ProvidersConfig = toml::from_str(&content)?;
    Ok(config)
}
