//! Composite resolver: tries each inner resolver in order, first hit wins.

use async_trait::async_trait;

use crate::resolver::ModelLimitResolver;
use crate::spec::ModelSpec;

/// Chains resolvers: config override → cache/remote → static table, mirroring
/// the priority order `effective_context_limit` uses for the sync path.
pub struct CompositeResolver {
    resolvers: Vec<Box<dyn ModelLimitResolver>>,
}

impl CompositeResolver {
    pub fn new(resolvers: Vec<Box<dyn ModelLimitResolver>>) -> Self {
        Self { resolvers }
    }
}

#[async_trait]
impl ModelLimitResolver for CompositeResolver {
    async fn resolve(&self, provider_id: &str, model_id: &str) -> Option<ModelSpec> {
        for resolver in &self.resolvers {
            if let Some(spec) = resolver.resolve(provider_id, model_id).await {
                return Some(spec);
            }
        }
        None
    }
}
