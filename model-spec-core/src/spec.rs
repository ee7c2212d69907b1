//! Model specification: context limit, output limit, and optional cache limits.

use serde::{Deserialize, Serialize};

/// Model token limit specification.
///
/// Used by the compaction engine to determine when the active context is
/// approaching the provider's window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Context (input) token limit.
    pub context_limit: u32,
    /// Output token limit.
    pub output_limit: u32,
    /// Context limit when the provider's extended-context mode is enabled
    /// (e.g. Anthropic/OpenAI "1M context" betas). `None` if the model has
    /// no such mode.
    #[serde(default)]
    pub extended_context_limit: Option<u32>,
    /// Optional cache read token limit (for models with prompt caching).
    #[serde(default)]
    pub cache_read: Option<u32>,
    /// Optional cache write token limit.
    #[serde(default)]
    pub cache_write: Option<u32>,
}

impl ModelSpec {
    /// Creates a new `ModelSpec` with required limits.
    pub fn new(context_limit: u32, output_limit: u32) -> Self {
        Self {
            context_limit,
            output_limit,
            extended_context_limit: None,
            cache_read: None,
            cache_write: None,
        }
    }

    pub fn with_extended_context_limit(mut self, limit: u32) -> Self {
        self.extended_context_limit = Some(limit);
        self
    }

    pub fn with_cache_read(mut self, limit: u32) -> Self {
        self.cache_read = Some(limit);
        self
    }

    pub fn with_cache_write(mut self, limit: u32) -> Self {
        self.cache_write = Some(limit);
        self
    }
}
