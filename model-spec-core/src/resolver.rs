//! Model limit resolver trait: look up a `ModelSpec` by provider/model id.

use async_trait::async_trait;

use crate::spec::ModelSpec;

/// Resolves a model's token limits from some backing source (static table,
/// local file, cache, composite fallback chain).
#[async_trait]
pub trait ModelLimitResolver: Send + Sync {
    async fn resolve(&self, provider_id: &str, model_id: &str) -> Option<ModelSpec>;
}
