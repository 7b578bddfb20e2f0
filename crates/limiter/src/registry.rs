//! Lazy map of resource key to limiter.

use std::sync::Arc;

use dashmap::DashMap;
use flowgate_common::LimiterSettings;

use crate::limiter::Limiter;
use crate::random::RandomSource;

/// Limiters by resource key, created on first use.
///
/// A limiter lives for the process, with one exception: when the configured
/// window size no longer matches, the entry is rebuilt from scratch. Ring
/// length is baked into a limiter's slot indexing, so a resize is a reset.
pub struct LimiterRegistry {
    limiters: DashMap<String, Arc<Limiter>>,
    random: Arc<dyn RandomSource>,
}

impl LimiterRegistry {
    pub fn new(random: Arc<dyn RandomSource>) -> Self {
        Self {
            limiters: DashMap::new(),
            random,
        }
    }

    /// Fetch the limiter for `resource_key`, creating or rebuilding it as
    /// needed.
    pub fn get(&self, resource_key: &str, settings: &LimiterSettings) -> Arc<Limiter> {
        if let Some(existing) = self.limiters.get(resource_key) {
            if existing.window_size() == settings.window_size {
                return Arc::clone(&existing);
            }
        }

        let limiter = Arc::new(Limiter::new(
            resource_key.to_string(),
            settings.window_size,
            settings.log_resource_keys.contains(resource_key),
            Arc::clone(&self.random),
        ));
        tracing::info!(
            resource = resource_key,
            window_size = settings.window_size,
            "created limiter"
        );
        self.limiters
            .insert(resource_key.to_string(), Arc::clone(&limiter));
        limiter
    }

    /// Look up a limiter without creating one.
    pub fn peek(&self, resource_key: &str) -> Option<Arc<Limiter>> {
        self.limiters
            .get(resource_key)
            .map(|entry| Arc::clone(&entry))
    }

    /// Snapshot of all live limiters, for the syncer's fan-out.
    pub fn limiters(&self) -> Vec<Arc<Limiter>> {
        self.limiters
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
