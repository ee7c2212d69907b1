//! Feature flag service: TTL-cached overrides with `off`/`on`/`default` semantics
//! (spec §9 "Feature flags / overrides").

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// An explicit override for one flag. `Default` defers to the flag's
/// built-in default (e.g. the `stats` feature is default-on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagOverride {
    Off,
    On,
    Default,
}

struct CacheEntry {
    overrides: HashMap<String, FlagOverride>,
    loaded_at: Instant,
}

/// A loader function supplies overrides (e.g. read from `WorkstationConfig`
/// or a remote flag service); `FeatureFlagService` just adds the TTL cache
/// and the override-resolution policy on top.
pub type FlagLoader = Box<dyn Fn() -> HashMap<String, FlagOverride> + Send + Sync>;

pub struct FeatureFlagService {
    loader: FlagLoader,
    ttl: Duration,
    cache: Mutex<Option<CacheEntry>>,
}

impl FeatureFlagService {
    pub fn new(loader: FlagLoader) -> Self {
        Self {
            loader,
            ttl: DEFAULT_TTL,
            cache: Mutex::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Resolves `name`: `Off` → false, `On` → true, `Default`/unset → `default_on`.
    /// Refreshes the cache if it's absent or older than `ttl`.
    pub fn is_enabled(&self, name: &str, default_on: bool) -> bool {
        let mut guard = self.cache.lock().expect("feature flag cache poisoned");
        let needs_refresh = match guard.as_ref() {
            None => true,
            Some(entry) => entry.loaded_at.elapsed() >= self.ttl,
        };
        if needs_refresh {
            *guard = Some(CacheEntry {
                overrides: (self.loader)(),
                loaded_at: Instant::now(),
            });
        }
        match guard.as_ref().unwrap().overrides.get(name) {
            Some(FlagOverride::Off) => false,
            Some(FlagOverride::On) => true,
            Some(FlagOverride::Default) | None => default_on,
        }
    }

    /// Forces the next `is_enabled` call to reload, bypassing the TTL.
    pub fn invalidate(&self) {
        *self.cache.lock().expect("feature flag cache poisoned") = None;
    }
}
