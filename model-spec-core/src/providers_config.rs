//! Per-install provider overrides and the `effective_context_limit` policy
//! consumed by the compaction engine (spec §4.3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::spec::ModelSpec;
use crate::static_table::StaticTableResolver;

/// A model string of the form `"<provider>:<model>"` (e.g. `"anthropic:claude-sonnet-4-5"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelString(pub String);

impl ModelString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Splits into `(provider, model)` on the first `:`. Returns `None` if there's no `:`.
    pub fn split(&self) -> Option<(&str, &str)> {
        self.0.split_once(':')
    }
}

impl std::fmt::Display for ModelString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-install overrides for a single provider: context/output limit overrides
/// keyed by model id, layered on top of the static table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderOverride {
    #[serde(default)]
    pub models: HashMap<String, ModelSpec>,
}

/// Top-level providers config (loaded from `~/.config/<app>/providers.toml` by
/// the `config` crate); threaded through `checkBeforeSend`/`checkMidStream` so
/// context-window math reflects per-install overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderOverride>,
}

impl ProvidersConfig {
    pub fn lookup(&self, provider_id: &str, model_id: &str) -> Option<ModelSpec> {
        self.providers.get(provider_id)?.models.get(model_id).cloned()
    }
}

/// Resolves `model`'s effective context-window limit, honoring (in priority order):
/// 1. `providers_config` override for that exact provider/model.
/// 2. The built-in static table.
/// 3. A conservative default (128,000) if the model is entirely unknown.
///
/// When `use_1m_context` is true and the resolved spec carries an
/// `extended_context_limit`, that value is used instead of `context_limit`.
///
/// Returns `None` only when the resulting limit would be non-positive — callers
/// (CompactionMonitor) must treat that as "guard: do not force-compact".
pub fn effective_context_limit(
    model: &ModelString,
    use_1m_context: bool,
    providers_config: &ProvidersConfig,
) -> Option<u32> {
    const DEFAULT_CONTEXT_LIMIT: u32 = 128_000;

    let (provider_id, model_id) = model.split()?;
    let spec = providers_config
        .lookup(provider_id, model_id)
        .or_else(|| StaticTableResolver::new().get_sync(provider_id, model_id));

    let limit = match spec {
        Some(spec) if use_1m_context => spec.extended_context_limit.unwrap_or(spec.context_limit),
        Some(spec) => spec.context_limit,
        None => DEFAULT_CONTEXT_LIMIT,
    };

    if limit == 0 {
        None
    } else {
        Some(limit)
    }
}
