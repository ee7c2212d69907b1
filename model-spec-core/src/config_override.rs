//! Resolver that only ever answers from `ProvidersConfig` overrides — first
//! link in the `CompositeResolver` chain so per-install overrides always win.

use async_trait::async_trait;

use crate::providers_config::ProvidersConfig;
use crate::resolver::ModelLimitResolver;
use crate::spec::ModelSpec;

pub struct ConfigOverride {
    config: ProvidersConfig,
}

impl ConfigOverride {
    pub fn new(config: ProvidersConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ModelLimitResolver for ConfigOverride {
    async fn resolve(&self, provider_id: &str, model_id: &str) -> Option<ModelSpec> {
        self.config.lookup(provider_id, model_id)
    }
}
