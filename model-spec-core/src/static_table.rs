//! Built-in table of well-known model specs, used when no config override and
//! no remote resolver is configured. Kept intentionally small: this is a
//! fallback of last resort, not a model catalog.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::resolver::ModelLimitResolver;
use crate::spec::ModelSpec;

/// Resolver backed by a fixed, compiled-in `HashMap<"provider/model", ModelSpec>`.
pub struct StaticTableResolver {
    table: HashMap<String, ModelSpec>,
}

impl StaticTableResolver {
    pub fn new() -> Self {
        let mut table = HashMap::new();
        table.insert(
            "anthropic/claude-sonnet-4-5".to_string(),
            ModelSpec::new(200_000, 64_000).with_extended_context_limit(1_000_000),
        );
        table.insert(
            "anthropic/claude-opus-4-1".to_string(),
            ModelSpec::new(200_000, 32_000),
        );
        table.insert(
            "openai/gpt-4o".to_string(),
            ModelSpec::new(128_000, 16_384),
        );
        table.insert(
            "openai/gpt-4o-mini".to_string(),
            ModelSpec::new(128_000, 16_384),
        );
        table.insert(
            "openai/gpt-5".to_string(),
            ModelSpec::new(272_000, 128_000),
        );
        Self { table }
    }

    pub fn with_override(mut self, key: impl Into<String>, spec: ModelSpec) -> Self {
        self.table.insert(key.into(), spec);
        self
    }

    /// Synchronous lookup. The table is a plain in-memory map, so this never
    /// blocks; callers that can't go through the async `ModelLimitResolver`
    /// trait (e.g. the pure `effective_context_limit` policy function) use
    /// this directly instead.
    pub fn get_sync(&self, provider_id: &str, model_id: &str) -> Option<ModelSpec> {
        self.table.get(&format!("{provider_id}/{model_id}")).cloned()
    }
}

impl Default for StaticTableResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelLimitResolver for StaticTableResolver {
    async fn resolve(&self, provider_id: &str, model_id: &str) -> Option<ModelSpec> {
        self.table
            .get(&format!("{provider_id}/{model_id}"))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_known_model() {
        let resolver = StaticTableResolver::new();
        let spec = resolver
            .resolve("anthropic", "claude-sonnet-4-5")
            .await
            .unwrap();
        assert_eq!(spec.context_limit, 200_000);
        assert_eq!(spec.extended_context_limit, Some(1_000_000));
    }

    #[tokio::test]
    async fn unknown_model_is_none() {
        let resolver = StaticTableResolver::new();
        assert!(resolver.resolve("acme", "made-up").await.is_none());
    }

    #[tokio::test]
    async fn with_override_replaces_entry() {
        let resolver = StaticTableResolver::new()
            .with_override("openai/gpt-4o", ModelSpec::new(1, 1));
        let spec = resolver.resolve("openai", "gpt-4o").await.unwrap();
        assert_eq!(spec.context_limit, 1);
    }
}
